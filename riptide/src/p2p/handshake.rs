use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use super::PeerError;

pub const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";

// Reserved flags: byte 5 bit 0x10 advertises BEP 10, byte 7 bit 0x04 the
// fast extension.
const EXTENSION_PROTOCOL_BYTE: usize = 5;
const EXTENSION_PROTOCOL_BIT: u8 = 0x10;
const FAST_EXTENSION_BYTE: usize = 7;
const FAST_EXTENSION_BIT: u8 = 0x04;

pub struct Handshake {
    pub protocol:   [u8; 19],
    pub reserved:   [u8; 8],
    pub info_hash:  [u8; 20],
    pub peer_id:    [u8; 20],
}

impl Handshake {

    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], extensions: bool, fast: bool) -> Self {
        let mut reserved = [0; 8];
        if extensions {
            reserved[EXTENSION_PROTOCOL_BYTE] |= EXTENSION_PROTOCOL_BIT;
        }
        if fast {
            reserved[FAST_EXTENSION_BYTE] |= FAST_EXTENSION_BIT;
        }
        Self {
            protocol: PROTOCOL,
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[EXTENSION_PROTOCOL_BYTE] & EXTENSION_PROTOCOL_BIT != 0
    }

    pub fn supports_fast(&self) -> bool {
        self.reserved[FAST_EXTENSION_BYTE] & FAST_EXTENSION_BIT != 0
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {

    type Error = PeerError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u8(19);
        dst.extend_from_slice(&item.protocol);
        dst.extend_from_slice(&item.reserved);
        dst.extend_from_slice(&item.info_hash);
        dst.extend_from_slice(&item.peer_id);
        debug_assert_eq!(dst.len() % 68, 0, "encoded handshake length is not 68 bytes");
        Ok(())
    }
}

impl Decoder for HandshakeCodec {

    type Item = Handshake;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if src.is_empty() {
            return Ok(None);
        }

        if src[0] as usize != PROTOCOL.len() {
            return Err(PeerError::IncorrectProtocol);
        }
        if src.remaining() < 68 {
            // Handshake not fully received.
            return Ok(None);
        }
        src.advance(1);

        let mut protocol = [0; 19];
        src.copy_to_slice(&mut protocol);
        if protocol != PROTOCOL {
            return Err(PeerError::IncorrectProtocol);
        }

        let mut reserved = [0; 8];
        src.copy_to_slice(&mut reserved);

        let mut info_hash = [0; 20];
        src.copy_to_slice(&mut info_hash);

        let mut peer_id = [0; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            protocol,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("protocol", &String::from_utf8_lossy(&self.protocol))
            .field("reserved", &self.reserved)
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_roundtrip_is_byte_identical() {
        let handshake = Handshake::new([7; 20], *b"-RP0010-123456789012", true, true);
        let mut encoded = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut encoded).unwrap();
        assert_eq!(encoded.len(), 68);
        let original = encoded.clone();

        let decoded = HandshakeCodec.decode(&mut encoded).unwrap().unwrap();
        assert!(decoded.supports_extension_protocol());
        assert!(decoded.supports_fast());

        let mut reencoded = BytesMut::new();
        HandshakeCodec.encode(decoded, &mut reencoded).unwrap();
        assert_eq!(reencoded, original);
    }

    #[test]
    fn test_reserved_bits() {
        let plain = Handshake::new([0; 20], [1; 20], false, false);
        assert_eq!(plain.reserved, [0; 8]);
        let ext = Handshake::new([0; 20], [1; 20], true, false);
        assert_eq!(ext.reserved[5], 0x10);
        assert!(!ext.supports_fast());
        let fast = Handshake::new([0; 20], [1; 20], false, true);
        assert_eq!(fast.reserved[7], 0x04);
    }

    #[test]
    fn test_decoding_incomplete_returns_none() {
        let mut src = BytesMut::new();
        src.put_u8(19);
        src.extend_from_slice(b"BitTorrent protocol");
        assert!(HandshakeCodec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_decoding_wrong_protocol_len_fails() {
        let mut src = BytesMut::new();
        src.put_u8(20);
        src.extend_from_slice(b"Invalid protocol ...");
        src.extend_from_slice(&[0; 48]);
        assert!(HandshakeCodec.decode(&mut src).is_err());
    }

    #[test]
    fn test_decoding_leaves_trailing_bytes() {
        let handshake = Handshake::new([3; 20], [9; 20], false, false);
        let mut src = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut src).unwrap();
        // A keep-alive already followed the handshake.
        src.extend_from_slice(&[0, 0, 0, 0]);

        let decoded = HandshakeCodec.decode(&mut src).unwrap().unwrap();
        assert_eq!(decoded.info_hash, [3; 20]);
        assert_eq!(&src[..], &[0, 0, 0, 0]);
    }
}
