use bytes::{Buf, BufMut, BytesMut};
use crate::{
    block::{Block, BlockInfo},
    buffers::RingBuffer,
    Bitfield,
};
use super::PeerError;

// One peer-wire message. Base protocol ids 0-9, fast extension 13-17,
// extension protocol envelope 20.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {

    KeepAlive,

    Choke,

    Unchoke,

    Interested,

    NotInterested,

    Have { idx: u32 },

    // Bit-per-piece, MSB first; only legal directly after the handshake.
    Bitfield(Bitfield),

    Request(BlockInfo),

    Block(Block),

    Cancel(BlockInfo),

    // The peer's DHT port.
    Port { port: u16 },

    SuggestPiece { idx: u32 },

    HaveAll,

    HaveNone,

    RejectRequest(BlockInfo),

    AllowedFast { idx: u32 },

    // BEP 10 envelope; payload is bencoded for the handshake and most
    // extensions, raw for some.
    Extended { ext_id: u8, payload: Vec<u8> },

}

impl Message {

    // Appends the framed message to the session's send buffer. Header and
    // payload go straight into `dst`; there is no intermediate allocation.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {

            Message::KeepAlive => dst.put_u32(0),

            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            }

            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            }

            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            }

            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            }

            // have: <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(*idx);
            }

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let raw = bitfield.as_raw_slice();
                dst.put_u32(1 + raw.len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(raw);
            }

            // request: <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            }

            // piece: <len=0009+X><id=7><index><begin><block>
            Message::Block(block) => {
                dst.put_u32(9 + block.data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.extend_from_slice(&block.data);
            }

            // cancel: <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            }

            // port: <len=0003><id=9><listen-port>
            Message::Port { port } => {
                dst.put_u32(3);
                dst.put_u8(9);
                dst.put_u16(*port);
            }

            Message::SuggestPiece { idx } => {
                dst.put_u32(5);
                dst.put_u8(13);
                dst.put_u32(*idx);
            }

            Message::HaveAll => {
                dst.put_u32(1);
                dst.put_u8(14);
            }

            Message::HaveNone => {
                dst.put_u32(1);
                dst.put_u8(15);
            }

            Message::RejectRequest(block) => {
                dst.put_u32(13);
                dst.put_u8(16);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            }

            Message::AllowedFast { idx } => {
                dst.put_u32(5);
                dst.put_u8(17);
                dst.put_u32(*idx);
            }

            // extended: <len=0002+X><id=20><ext id><payload>
            Message::Extended { ext_id, payload } => {
                dst.put_u32(2 + payload.len() as u32);
                dst.put_u8(20);
                dst.put_u8(*ext_id);
                dst.extend_from_slice(payload);
            }
        }
    }

    // Parses one complete frame out of the receive ring, consuming exactly
    // its bytes. A partial frame leaves the ring untouched; a frame longer
    // than `max_frame_size` is a protocol error.
    pub fn decode(ring: &mut RingBuffer, max_frame_size: usize) -> Result<Option<Message>, PeerError> {

        if ring.len() < 4 {
            return Ok(None);
        }
        let header = ring.peek(4);
        let msg_len = u32::from_be_bytes(header.try_into().expect("peeked 4 bytes")) as usize;
        if msg_len > max_frame_size {
            return Err(PeerError::OversizedMessage(msg_len));
        }
        if ring.len() < 4 + msg_len {
            // Frame not fully received.
            return Ok(None);
        }

        if msg_len == 0 {
            ring.consume(4);
            return Ok(Some(Message::KeepAlive));
        }

        let msg = {
            let (a, b) = ring.peek_views(Some(4 + msg_len));
            let mut buf = a.chain(b);
            buf.advance(4);
            Self::parse_body(&mut buf, msg_len)?
        };
        ring.consume(4 + msg_len);
        Ok(Some(msg))
    }

    fn parse_body(buf: &mut impl Buf, msg_len: usize) -> Result<Message, PeerError> {

        let id = buf.get_u8();
        let payload_len = msg_len - 1;

        let expect = |wanted: usize| {
            if payload_len == wanted {
                Ok(())
            } else {
                Err(PeerError::InvalidMessage)
            }
        };

        let msg = match id {
            0 => {
                expect(0)?;
                Message::Choke
            }
            1 => {
                expect(0)?;
                Message::Unchoke
            }
            2 => {
                expect(0)?;
                Message::Interested
            }
            3 => {
                expect(0)?;
                Message::NotInterested
            }
            4 => {
                expect(4)?;
                Message::Have { idx: buf.get_u32() }
            }
            5 => {
                let mut raw = vec![0; payload_len];
                buf.copy_to_slice(&mut raw);
                Message::Bitfield(Bitfield::from_vec(raw))
            }
            6 => {
                expect(12)?;
                Message::Request(read_block_info(buf))
            }
            7 => {
                if payload_len < 8 {
                    return Err(PeerError::InvalidMessage);
                }
                let piece_idx = buf.get_u32() as usize;
                let offset = buf.get_u32() as usize;
                let mut data = vec![0; payload_len - 8];
                buf.copy_to_slice(&mut data);
                Message::Block(Block { piece_idx, offset, data })
            }
            8 => {
                expect(12)?;
                Message::Cancel(read_block_info(buf))
            }
            9 => {
                expect(2)?;
                Message::Port { port: buf.get_u16() }
            }
            13 => {
                expect(4)?;
                Message::SuggestPiece { idx: buf.get_u32() }
            }
            14 => {
                expect(0)?;
                Message::HaveAll
            }
            15 => {
                expect(0)?;
                Message::HaveNone
            }
            16 => {
                expect(12)?;
                Message::RejectRequest(read_block_info(buf))
            }
            17 => {
                expect(4)?;
                Message::AllowedFast { idx: buf.get_u32() }
            }
            20 => {
                if payload_len < 1 {
                    return Err(PeerError::InvalidMessage);
                }
                let ext_id = buf.get_u8();
                let mut payload = vec![0; payload_len - 1];
                buf.copy_to_slice(&mut payload);
                Message::Extended { ext_id, payload }
            }
            id => {
                tracing::warn!("invalid message id: {}", id);
                return Err(PeerError::InvalidMessageId(id));
            }
        };
        Ok(msg)
    }
}

fn read_block_info(buf: &mut impl Buf) -> BlockInfo {
    BlockInfo {
        piece_idx: buf.get_u32() as usize,
        offset: buf.get_u32() as usize,
        len: buf.get_u32() as usize,
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have piece {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(block) => write!(
                f, "request {{ piece: {}, offset: {}, len: {} }}",
                block.piece_idx, block.offset, block.len,
            ),
            Message::Block(block) => write!(
                f, "block {{ piece: {}, offset: {}, len: {} }}",
                block.piece_idx, block.offset, block.data.len(),
            ),
            Message::Cancel(block) => write!(
                f, "cancel {{ piece: {}, offset: {}, len: {} }}",
                block.piece_idx, block.offset, block.len,
            ),
            Message::Port { port } => write!(f, "port {}", port),
            Message::SuggestPiece { idx } => write!(f, "suggest piece {}", idx),
            Message::HaveAll => write!(f, "have all"),
            Message::HaveNone => write!(f, "have none"),
            Message::RejectRequest(block) => write!(
                f, "reject {{ piece: {}, offset: {}, len: {} }}",
                block.piece_idx, block.offset, block.len,
            ),
            Message::AllowedFast { idx } => write!(f, "allowed fast {}", idx),
            Message::Extended { ext_id, payload } => {
                write!(f, "extended {{ id: {}, {} bytes }}", ext_id, payload.len())
            }
        }
    }
}
