use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use crate::{block::BlockInfo, config::SchedulerConfig, Bitfield};

pub mod piece_picker;
pub mod partial_piece;
mod choker;

pub use choker::{allowed_fast_set, ChokeAction, Choker, PeerChokeInfo};
use partial_piece::PartialPiece;
use piece_picker::PiecePicker;

// Window for counting a peer's request timeouts towards the slow flag.
const SLOW_PEER_WINDOW: Duration = Duration::from_secs(60);

struct FlightEntry {
    peer: SocketAddr,
    issued_at: Instant,
}

// What happened when a block arrived, and which outstanding duplicates
// should now be cancelled on other peers.
pub struct BlockReceipt {
    pub duplicate: bool,
    pub cancels: Vec<(SocketAddr, BlockInfo)>,
}

pub struct TimeoutSweep {
    // Requests returned to the pool, by the peer that sat on them.
    pub expired: Vec<(SocketAddr, BlockInfo)>,
    // Peers that hit two timeouts on different pieces within a minute.
    pub slow: Vec<SocketAddr>,
}

// Global download intent for one torrent: which pieces to ask for, from
// whom, next. Shared by all peer sessions of the torrent.
pub struct Picker {

    pub piece_picker: RwLock<PiecePicker>,

    pub partial_pieces: RwLock<HashMap<usize, RwLock<PartialPiece>>>,

    // Every outstanding (block -> peers that were asked, when).
    in_flight: RwLock<HashMap<BlockInfo, Vec<FlightEntry>>>,

    // Pieces whose first request was just planned; drained by the torrent
    // to drive the Missing -> Requested transition in the store.
    started: Mutex<Vec<usize>>,

    // Recent request timeouts per peer, for slow-peer flagging.
    timeout_log: Mutex<HashMap<SocketAddr, VecDeque<(Instant, usize)>>>,

    endgame: AtomicBool,

    config: SchedulerConfig,

    num_pieces: u32,
    piece_len: usize,
    last_piece_len: usize,

}

impl Picker {

    pub fn new(num_pieces: u32, piece_len: usize, last_piece_len: usize, config: SchedulerConfig) -> Self {
        Self {
            piece_picker: RwLock::new(PiecePicker::new(num_pieces as usize)),
            partial_pieces: RwLock::new(HashMap::new()),
            in_flight: RwLock::new(HashMap::new()),
            started: Mutex::new(Vec::new()),
            timeout_log: Mutex::new(HashMap::new()),
            endgame: AtomicBool::new(false),
            config,
            num_pieces,
            piece_len,
            last_piece_len,
        }
    }

    fn piece_len(&self, idx: usize) -> usize {
        if idx as u32 == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub fn is_endgame(&self) -> bool {
        self.endgame.load(Ordering::Relaxed)
    }

    // The per-peer request window, raised during endgame.
    pub fn window(&self) -> usize {
        if self.is_endgame() {
            self.config.request_window_endgame
        } else {
            self.config.request_window
        }
    }

    async fn update_endgame(&self) -> bool {
        let missing = self.piece_picker.read().await.missing_count();
        let endgame = missing > 0
            && (missing <= self.config.endgame_threshold
                || missing * 20 <= self.num_pieces as usize);
        self.endgame.store(endgame, Ordering::Relaxed);
        endgame
    }

    // Plans up to a window's worth of requests for one peer: partially
    // downloaded pieces first, then new pieces rarest-first, then (in
    // endgame) duplicates of outstanding blocks.
    pub async fn pick_blocks(
        &self,
        peer: SocketAddr,
        current: &HashSet<BlockInfo>,
        bf: &Bitfield,
    ) -> Vec<BlockInfo> {

        let endgame = self.update_endgame().await;
        let mut requests = vec![];
        let mut remaining = self.window().saturating_sub(current.len());
        if remaining == 0 {
            return requests;
        }

        // Finish pieces with gaps before opening new ones.
        {
            let partials = self.partial_pieces.read().await;
            for partial in partials.values() {
                if remaining == 0 {
                    break;
                }
                let mut partial = partial.write().await;
                if !bf[partial.idx] {
                    continue;
                }
                remaining -= partial.pick_next_blocks(remaining, &mut requests, current, false);
            }
        }

        // Open new pieces.
        while remaining != 0 {
            let picked = self.piece_picker.write().await.pick_new_piece(bf);
            match picked {
                Some(idx) => {
                    tracing::trace!("picked piece {}", idx);
                    self.started.lock().expect("started list poisoned").push(idx);
                    let mut partial = PartialPiece::new(idx, self.piece_len(idx));
                    remaining -= partial.pick_next_blocks(remaining, &mut requests, current, false);
                    self.partial_pieces.write().await.insert(idx, RwLock::new(partial));
                }
                None => break,
            }
        }

        // Endgame: request every remaining block from every peer that has
        // it; redundant deliveries are cancelled on first arrival.
        if remaining != 0 && endgame {
            // Blocks picked earlier in this call count as held too.
            let held: HashSet<BlockInfo> = current.iter().chain(requests.iter()).copied().collect();
            let partials = self.partial_pieces.read().await;
            for partial in partials.values() {
                if remaining == 0 {
                    break;
                }
                let mut partial = partial.write().await;
                if !bf[partial.idx] {
                    continue;
                }
                remaining -= partial.pick_next_blocks(remaining, &mut requests, &held, true);
            }
        }

        if !requests.is_empty() {
            let now = Instant::now();
            let mut in_flight = self.in_flight.write().await;
            for block in &requests {
                in_flight
                    .entry(*block)
                    .or_default()
                    .push(FlightEntry { peer, issued_at: now });
            }
        }
        requests
    }

    // Applies an arrived block and collects the cancels owed to other peers
    // still holding the same request.
    pub async fn block_received(&self, peer: SocketAddr, block: BlockInfo) -> BlockReceipt {

        let duplicate = {
            let partials = self.partial_pieces.read().await;
            match partials.get(&block.piece_idx) {
                Some(partial) => partial.write().await.received_block(&block),
                // Piece already completed and retired; late duplicate.
                None => self.piece_picker.read().await.own_bitfield()[block.piece_idx],
            }
        };

        let cancels = {
            let mut in_flight = self.in_flight.write().await;
            match in_flight.remove(&block) {
                Some(entries) => entries
                    .into_iter()
                    .filter(|e| e.peer != peer)
                    .map(|e| (e.peer, block))
                    .collect(),
                None => Vec::new(),
            }
        };

        BlockReceipt { duplicate, cancels }
    }

    // Returns a disconnected or choked peer's outstanding requests to the
    // pool. Blocks still in flight to another peer stay Requested.
    pub async fn free_peer_requests<'a>(
        &self,
        peer: SocketAddr,
        blocks: impl IntoIterator<Item = &'a BlockInfo>,
    ) {
        let mut in_flight = self.in_flight.write().await;
        let partials = self.partial_pieces.read().await;

        for block in blocks {
            let mut still_wanted = false;
            let mut drained = false;
            if let Some(entries) = in_flight.get_mut(block) {
                entries.retain(|e| e.peer != peer);
                still_wanted = !entries.is_empty();
                drained = !still_wanted;
            }
            if drained {
                in_flight.remove(block);
            }
            if !still_wanted {
                if let Some(partial) = partials.get(&block.piece_idx) {
                    partial.write().await.free_block(block);
                    tracing::trace!("freed block request: {:?}", block);
                }
            }
        }
    }

    // Expires requests older than the configured timeout and flags peers
    // accumulating timeouts across different pieces.
    pub async fn sweep_timeouts(&self, now: Instant) -> TimeoutSweep {

        let timeout = self.config.request_timeout;
        let mut expired: Vec<(SocketAddr, BlockInfo)> = Vec::new();
        let mut freed: Vec<BlockInfo> = Vec::new();

        {
            let mut in_flight = self.in_flight.write().await;
            in_flight.retain(|block, entries| {
                entries.retain(|e| {
                    if now.duration_since(e.issued_at) >= timeout {
                        expired.push((e.peer, *block));
                        false
                    } else {
                        true
                    }
                });
                if entries.is_empty() {
                    freed.push(*block);
                    false
                } else {
                    true
                }
            });
        }

        {
            let partials = self.partial_pieces.read().await;
            for block in &freed {
                if let Some(partial) = partials.get(&block.piece_idx) {
                    partial.write().await.free_block(block);
                }
            }
        }

        let mut slow = Vec::new();
        if !expired.is_empty() {
            let mut log = self.timeout_log.lock().expect("timeout log poisoned");
            for (peer, block) in &expired {
                let entries = log.entry(*peer).or_default();
                entries.push_back((now, block.piece_idx));
                while let Some((at, _)) = entries.front() {
                    if now.duration_since(*at) > SLOW_PEER_WINDOW {
                        entries.pop_front();
                    } else {
                        break;
                    }
                }
                let distinct: HashSet<usize> = entries.iter().map(|(_, p)| *p).collect();
                if entries.len() >= 2 && distinct.len() >= 2 && !slow.contains(peer) {
                    slow.push(*peer);
                }
            }
        }

        TimeoutSweep { expired, slow }
    }

    pub async fn piece_done(&self, idx: usize) {
        self.partial_pieces.write().await.remove(&idx);
        self.piece_picker.write().await.received_piece(idx);
        self.in_flight
            .write()
            .await
            .retain(|block, _| block.piece_idx != idx);
        self.update_endgame().await;
    }

    // Hash failure: drop the partial entirely so the next pick rebuilds it
    // from scratch.
    pub async fn piece_failed(&self, idx: usize) {
        self.partial_pieces.write().await.remove(&idx);
        self.piece_picker.write().await.hash_failed(idx);
        self.in_flight
            .write()
            .await
            .retain(|block, _| block.piece_idx != idx);
    }

    pub async fn pause_piece(&self, idx: usize) {
        self.partial_pieces.write().await.remove(&idx);
        self.piece_picker.write().await.pause_piece(idx);
    }

    // Pieces that moved Missing -> Requested since the last call.
    pub fn drain_started(&self) -> Vec<usize> {
        std::mem::take(&mut *self.started.lock().expect("started list poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_SIZE;
    use bitvec::prelude::*;

    fn config() -> SchedulerConfig {
        SchedulerConfig::default()
    }

    fn peer(n: u8) -> SocketAddr {
        format!("10.0.0.{}:6881", n).parse().unwrap()
    }

    fn all_have(n: usize) -> Bitfield {
        BitVec::repeat(true, n)
    }

    #[tokio::test]
    async fn test_pick_blocks_fills_window() {
        let picker = Picker::new(1028, 32_768, 32_768, config());
        let bf = all_have(1028);
        picker.piece_picker.write().await.bitfield_update(&bf);

        let requests = picker.pick_blocks(peer(1), &HashSet::new(), &bf).await;
        assert_eq!(requests.len(), picker.window());

        // A short window only tops up the difference.
        let current: HashSet<BlockInfo> = requests.iter().take(10).copied().collect();
        let more = picker.pick_blocks(peer(1), &current, &bf).await;
        assert_eq!(more.len(), picker.window() - 10);
    }

    #[tokio::test]
    async fn test_started_pieces_are_reported() {
        let picker = Picker::new(8, BLOCK_SIZE, BLOCK_SIZE, config());
        let bf = all_have(8);
        picker.piece_picker.write().await.bitfield_update(&bf);

        let requests = picker.pick_blocks(peer(1), &HashSet::new(), &bf).await;
        assert!(!requests.is_empty());
        let started = picker.drain_started();
        assert!(!started.is_empty());
        assert!(picker.drain_started().is_empty());
    }

    #[tokio::test]
    async fn test_endgame_duplicates_and_cancel_on_arrival() {
        // Two single-block pieces; endgame threshold covers everything.
        let picker = Picker::new(2, BLOCK_SIZE, BLOCK_SIZE, config());
        let bf = all_have(2);
        picker.piece_picker.write().await.bitfield_update(&bf);
        picker.piece_picker.write().await.bitfield_update(&bf);

        let a_requests = picker.pick_blocks(peer(1), &HashSet::new(), &bf).await;
        assert_eq!(a_requests.len(), 2);

        // Peer B gets the same blocks again through endgame.
        let b_requests = picker.pick_blocks(peer(2), &HashSet::new(), &bf).await;
        assert_eq!(b_requests.len(), 2);

        // First arrival from A owes B a cancel for the identical triple.
        let receipt = picker.block_received(peer(1), a_requests[0]).await;
        assert!(!receipt.duplicate);
        assert_eq!(receipt.cancels, vec![(peer(2), a_requests[0])]);

        // B's copy of the same block then lands as a duplicate, with no
        // further cancels.
        let receipt = picker.block_received(peer(2), a_requests[0]).await;
        assert!(receipt.duplicate);
        assert!(receipt.cancels.is_empty());
    }

    #[tokio::test]
    async fn test_free_peer_requests_respects_other_holders() {
        let picker = Picker::new(2, BLOCK_SIZE, BLOCK_SIZE, config());
        let bf = all_have(2);
        picker.piece_picker.write().await.bitfield_update(&bf);

        let a_requests = picker.pick_blocks(peer(1), &HashSet::new(), &bf).await;
        let b_requests = picker.pick_blocks(peer(2), &HashSet::new(), &bf).await;
        assert_eq!(
            a_requests.iter().collect::<HashSet<_>>(),
            b_requests.iter().collect::<HashSet<_>>(),
        );

        // A drops out; the blocks stay Requested because B still holds
        // them, so a third peer gets nothing outside endgame duplicates.
        picker.free_peer_requests(peer(1), a_requests.iter()).await;
        let receipt = picker.block_received(peer(2), b_requests[0]).await;
        assert!(!receipt.duplicate);
        assert!(receipt.cancels.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_sweep_returns_blocks_and_flags_slow_peers() {
        let picker = Picker::new(64, BLOCK_SIZE, BLOCK_SIZE, config());
        let bf = all_have(64);
        picker.piece_picker.write().await.bitfield_update(&bf);

        let requests = picker.pick_blocks(peer(1), &HashSet::new(), &bf).await;
        assert!(requests.len() >= 2);

        let later = Instant::now() + Duration::from_secs(61);
        let sweep = picker.sweep_timeouts(later).await;
        assert_eq!(sweep.expired.len(), requests.len());
        assert!(sweep.expired.iter().all(|(p, _)| *p == peer(1)));
        // Timeouts spanned several pieces inside one minute.
        assert_eq!(sweep.slow, vec![peer(1)]);

        // The freed blocks are plannable again.
        let again = picker.pick_blocks(peer(2), &HashSet::new(), &bf).await;
        for block in &requests {
            assert!(again.contains(block));
        }
    }

    #[tokio::test]
    async fn test_piece_done_clears_tracking() {
        let picker = Picker::new(2, BLOCK_SIZE, BLOCK_SIZE, config());
        let bf = all_have(2);
        picker.piece_picker.write().await.bitfield_update(&bf);

        let requests = picker.pick_blocks(peer(1), &HashSet::new(), &bf).await;
        let idx = requests[0].piece_idx;
        picker.piece_done(idx).await;

        assert!(picker.partial_pieces.read().await.get(&idx).is_none());
        assert!(picker.piece_picker.read().await.own_bitfield()[idx]);
    }
}
