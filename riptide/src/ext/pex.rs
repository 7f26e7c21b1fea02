use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use bencode::Value;
use super::{ExtensionError, Result};

// Per-peer flag byte accompanying added peers.
pub const FLAG_SEED: u8 = 0x01;
pub const FLAG_CONNECTABLE: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PexPeer {
    pub addr: SocketAddr,
    pub flags: u8,
}

impl PexPeer {

    pub fn new(addr: SocketAddr, seed: bool, connectable: bool) -> Self {
        let mut flags = 0;
        if seed {
            flags |= FLAG_SEED;
        }
        if connectable {
            flags |= FLAG_CONNECTABLE;
        }
        Self { addr, flags }
    }

    pub fn is_seed(&self) -> bool {
        self.flags & FLAG_SEED != 0
    }

    pub fn is_connectable(&self) -> bool {
        self.flags & FLAG_CONNECTABLE != 0
    }
}

// One ut_pex gossip message: deltas against what we previously told the
// peer, in compact form (6 bytes per IPv4 peer, 18 per IPv6).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PexMessage {
    pub added: Vec<PexPeer>,
    pub dropped: Vec<SocketAddr>,
}

impl PexMessage {

    pub fn encode(&self) -> Vec<u8> {

        let mut added4 = Vec::new();
        let mut added4_flags = Vec::new();
        let mut added6 = Vec::new();
        let mut added6_flags = Vec::new();
        for peer in &self.added {
            match peer.addr.ip() {
                IpAddr::V4(ip) => {
                    added4.extend_from_slice(&ip.octets());
                    added4.extend_from_slice(&peer.addr.port().to_be_bytes());
                    added4_flags.push(peer.flags);
                }
                IpAddr::V6(ip) => {
                    added6.extend_from_slice(&ip.octets());
                    added6.extend_from_slice(&peer.addr.port().to_be_bytes());
                    added6_flags.push(peer.flags);
                }
            }
        }

        let mut dropped4 = Vec::new();
        let mut dropped6 = Vec::new();
        for addr in &self.dropped {
            match addr.ip() {
                IpAddr::V4(ip) => {
                    dropped4.extend_from_slice(&ip.octets());
                    dropped4.extend_from_slice(&addr.port().to_be_bytes());
                }
                IpAddr::V6(ip) => {
                    dropped6.extend_from_slice(&ip.octets());
                    dropped6.extend_from_slice(&addr.port().to_be_bytes());
                }
            }
        }

        let mut root = Value::dict();
        root.insert("added", Value::Bytes(added4));
        root.insert("added.f", Value::Bytes(added4_flags));
        root.insert("added6", Value::Bytes(added6));
        root.insert("added6.f", Value::Bytes(added6_flags));
        root.insert("dropped", Value::Bytes(dropped4));
        root.insert("dropped6", Value::Bytes(dropped6));
        bencode::encode(&root)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let root = bencode::decode(payload)?;
        let mut msg = PexMessage::default();

        if let Some(raw) = root.get_bytes(b"added") {
            let flags = root.get_bytes(b"added.f").unwrap_or(&[]);
            for (i, addr) in decode_compact_v4(raw)?.into_iter().enumerate() {
                msg.added.push(PexPeer { addr, flags: flags.get(i).copied().unwrap_or(0) });
            }
        }
        if let Some(raw) = root.get_bytes(b"added6") {
            let flags = root.get_bytes(b"added6.f").unwrap_or(&[]);
            for (i, addr) in decode_compact_v6(raw)?.into_iter().enumerate() {
                msg.added.push(PexPeer { addr, flags: flags.get(i).copied().unwrap_or(0) });
            }
        }
        if let Some(raw) = root.get_bytes(b"dropped") {
            msg.dropped.extend(decode_compact_v4(raw)?);
        }
        if let Some(raw) = root.get_bytes(b"dropped6") {
            msg.dropped.extend(decode_compact_v6(raw)?);
        }
        Ok(msg)
    }
}

pub fn decode_compact_v4(raw: &[u8]) -> Result<Vec<SocketAddr>> {
    if raw.len() % 6 != 0 {
        return Err(ExtensionError::Malformed("compact ipv4 peer list"));
    }
    Ok(raw
        .chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            let port = u16::from_be_bytes([c[4], c[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect())
}

pub fn decode_compact_v6(raw: &[u8]) -> Result<Vec<SocketAddr>> {
    if raw.len() % 18 != 0 {
        return Err(ExtensionError::Malformed("compact ipv6 peer list"));
    }
    Ok(raw
        .chunks_exact(18)
        .map(|c| {
            let octets: [u8; 16] = c[..16].try_into().expect("chunk is 18 bytes");
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([c[16], c[17]]);
            SocketAddr::new(IpAddr::V6(ip), port)
        })
        .collect())
}

// Tracks what we last told one peer so each tick gossips only the deltas.
#[derive(Debug, Default)]
pub struct PexTracker {
    last_sent: HashSet<SocketAddr>,
}

impl PexTracker {

    // Builds the delta message against the currently connected set, or
    // None when there is nothing new to say.
    pub fn delta(&mut self, connected: &[PexPeer]) -> Option<PexMessage> {
        let current: HashSet<SocketAddr> = connected.iter().map(|p| p.addr).collect();

        let added: Vec<PexPeer> = connected
            .iter()
            .filter(|p| !self.last_sent.contains(&p.addr))
            .copied()
            .collect();
        let dropped: Vec<SocketAddr> = self
            .last_sent
            .iter()
            .filter(|a| !current.contains(a))
            .copied()
            .collect();

        self.last_sent = current;
        if added.is_empty() && dropped.is_empty() {
            None
        } else {
            Some(PexMessage { added, dropped })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_pex_roundtrip_v4_v6() {
        let msg = PexMessage {
            added: vec![
                PexPeer::new(v4("10.1.2.3:6881"), true, true),
                PexPeer::new("[2001:db8::1]:51413".parse().unwrap(), false, true),
            ],
            dropped: vec![v4("192.168.0.9:1"), "[::1]:2".parse().unwrap()],
        };
        let decoded = PexMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.added[0].is_seed());
        assert!(decoded.added[1].is_connectable());
        assert!(!decoded.added[1].is_seed());
    }

    #[test]
    fn test_compact_v4_layout() {
        let msg = PexMessage {
            added: vec![PexPeer::new(v4("1.2.3.4:257"), false, false)],
            dropped: vec![],
        };
        let root = bencode::decode(&msg.encode()).unwrap();
        assert_eq!(root.get_bytes(b"added").unwrap(), &[1, 2, 3, 4, 1, 1]);
        assert_eq!(root.get_bytes(b"added.f").unwrap(), &[0]);
    }

    #[test]
    fn test_malformed_lists_rejected() {
        assert!(decode_compact_v4(&[1, 2, 3]).is_err());
        assert!(decode_compact_v6(&[0; 17]).is_err());
    }

    #[test]
    fn test_tracker_deltas() {
        let mut tracker = PexTracker::default();
        let a = PexPeer::new(v4("10.0.0.1:1"), false, true);
        let b = PexPeer::new(v4("10.0.0.2:2"), false, true);

        let first = tracker.delta(&[a, b]).unwrap();
        assert_eq!(first.added.len(), 2);
        assert!(first.dropped.is_empty());

        // No change, nothing to gossip.
        assert!(tracker.delta(&[a, b]).is_none());

        // B left, C joined.
        let c = PexPeer::new(v4("10.0.0.3:3"), true, true);
        let third = tracker.delta(&[a, c]).unwrap();
        assert_eq!(third.added, vec![c]);
        assert_eq!(third.dropped, vec![b.addr]);
    }
}
