use std::collections::HashSet;
use crate::{
    block::{block_len, num_blocks, BlockInfo},
    BLOCK_SIZE,
};

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum BlockState {

    // Block has not been requested.
    #[default]
    Free,

    // Block has been requested from at least 1 peer.
    Requested,

    // Block has been received.
    Received,

}

// Per-block request state for one piece being downloaded.
#[derive(Debug)]
pub struct PartialPiece {

    pub idx: usize,

    pub len: usize,

    pub block_states: Vec<BlockState>,

}

impl PartialPiece {

    pub fn new(idx: usize, len: usize) -> Self {
        Self {
            idx,
            len,
            block_states: vec![BlockState::default(); num_blocks(len)],
        }
    }

    pub fn free_block(&mut self, block: &BlockInfo) {
        debug_assert_eq!(block.piece_idx, self.idx);
        let state = &mut self.block_states[block.idx_in_piece()];
        if *state == BlockState::Requested {
            *state = BlockState::Free;
        }
    }

    pub fn free_all_blocks(&mut self) {
        self.block_states
            .iter_mut()
            .filter(|s| **s == BlockState::Requested)
            .for_each(|s| *s = BlockState::Free);
    }

    // Marks a block received; returns true when it already was (endgame
    // double delivery, or a peer re-sending).
    pub fn received_block(&mut self, block: &BlockInfo) -> bool {
        let state = &mut self.block_states[block.idx_in_piece()];
        match *state {
            // A choke may have freed the request before the data arrived;
            // the bytes are still good.
            BlockState::Free | BlockState::Requested => {
                *state = BlockState::Received;
                false
            }
            BlockState::Received => true,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.block_states.iter().all(|s| *s == BlockState::Received)
    }

    pub fn has_gaps(&self) -> bool {
        self.block_states.iter().any(|s| *s != BlockState::Received)
    }

    // Picks up to `num` open blocks in offset order. With `end_game` set,
    // already-requested blocks are handed out again as long as this peer
    // doesn't hold them already.
    pub fn pick_next_blocks(
        &mut self,
        num: usize,
        buf: &mut Vec<BlockInfo>,
        prev: &HashSet<BlockInfo>,
        end_game: bool,
    ) -> usize {
        let mut num_picked = 0;
        for (i, state) in self.block_states.iter_mut().enumerate() {
            if num_picked == num {
                break;
            }

            if *state == BlockState::Free {
                buf.push(BlockInfo {
                    piece_idx: self.idx,
                    offset: i * BLOCK_SIZE,
                    len: block_len(self.len, i),
                });
                *state = BlockState::Requested;
                num_picked += 1;

            } else if end_game && *state == BlockState::Requested {

                let block = BlockInfo {
                    piece_idx: self.idx,
                    offset: i * BLOCK_SIZE,
                    len: block_len(self.len, i),
                };

                if !prev.contains(&block) {
                    buf.push(block);
                    num_picked += 1;
                }
            }
        }
        num_picked
    }
}
