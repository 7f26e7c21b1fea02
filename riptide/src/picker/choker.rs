use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};
use crate::config::SchedulerConfig;
use crate::InfoHash;

// Upload-side choking: a few reciprocal slots rotated on rate, plus one
// optimistic slot so new peers get a chance to prove themselves.
pub struct Choker {
    config: SchedulerConfig,
    last_regular: Option<Instant>,
    last_optimistic: Option<Instant>,
    optimistic: Option<SocketAddr>,
}

// Per-peer inputs to a choke round.
#[derive(Debug, Clone, Copy)]
pub struct PeerChokeInfo {
    pub addr: SocketAddr,
    // We are currently choking them.
    pub choked: bool,
    // They are interested in our pieces.
    pub interested: bool,
    pub down_rate: u64,
    pub up_rate: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChokeAction {
    Choke(SocketAddr),
    Unchoke(SocketAddr),
}

impl Choker {

    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            last_regular: None,
            last_optimistic: None,
            optimistic: None,
        }
    }

    pub fn optimistic(&self) -> Option<SocketAddr> {
        self.optimistic
    }

    // Runs the due rounds and returns the state changes to apply. While
    // leeching peers are ranked on what they send us; while seeding, on
    // what we send them.
    pub fn tick(&mut self, now: Instant, peers: &[PeerChokeInfo], seeding: bool) -> Vec<ChokeAction> {

        let mut actions = Vec::new();

        let optimistic_due = self
            .last_optimistic
            .map_or(true, |at| now.duration_since(at) >= self.config.optimistic_unchoke_interval);
        if optimistic_due && !peers.is_empty() {
            self.last_optimistic = Some(now);
            let choked: Vec<&PeerChokeInfo> = peers
                .iter()
                .filter(|p| p.choked && Some(p.addr) != self.optimistic)
                .collect();
            if let Some(pick) = choked.choose(&mut rand::thread_rng()) {
                self.optimistic = Some(pick.addr);
                tracing::debug!("optimistic unchoke: {}", pick.addr);
            }
        }

        let regular_due = self
            .last_regular
            .map_or(true, |at| now.duration_since(at) >= self.config.unchoke_interval);
        if !regular_due {
            return actions;
        }
        self.last_regular = Some(now);

        // Rank interested peers by rate and fill the regular slots.
        let mut ranked: Vec<&PeerChokeInfo> = peers.iter().filter(|p| p.interested).collect();
        ranked.sort_by_key(|p| std::cmp::Reverse(if seeding { p.up_rate } else { p.down_rate }));

        let mut unchoked: Vec<SocketAddr> = ranked
            .iter()
            .take(self.config.unchoke_slots)
            .map(|p| p.addr)
            .collect();
        if let Some(optimistic) = self.optimistic {
            if !unchoked.contains(&optimistic) && peers.iter().any(|p| p.addr == optimistic) {
                unchoked.push(optimistic);
            }
        }

        for peer in peers {
            let should_unchoke = unchoked.contains(&peer.addr);
            if should_unchoke && peer.choked {
                actions.push(ChokeAction::Unchoke(peer.addr));
            } else if !should_unchoke && !peer.choked {
                actions.push(ChokeAction::Choke(peer.addr));
            }
        }
        actions
    }
}

// BEP 6 allowed-fast set: pieces a peer may request even while choked,
// derived deterministically from its /24 and the info hash.
pub fn allowed_fast_set(
    info_hash: &InfoHash,
    ip: IpAddr,
    num_pieces: u32,
    count: usize,
) -> Vec<u32> {

    let IpAddr::V4(ipv4) = ip else {
        // The derivation is defined for IPv4; v6 peers get no fast set.
        return Vec::new();
    };
    if num_pieces == 0 {
        return Vec::new();
    }
    // Small torrents can't yield more distinct indices than they have
    // pieces; without the cap the draw below would never terminate.
    let count = count.min(num_pieces as usize);

    let masked = u32::from(ipv4) & 0xffff_ff00;
    let mut x = Vec::with_capacity(24);
    x.extend_from_slice(&masked.to_be_bytes());
    x.extend_from_slice(info_hash);

    let mut set = Vec::with_capacity(count);
    while set.len() < count {
        let digest: [u8; 20] = {
            let mut hasher = Sha1::new();
            hasher.update(&x);
            hasher.finalize().into()
        };
        x = digest.to_vec();
        for chunk in digest.chunks_exact(4) {
            if set.len() == count {
                break;
            }
            let idx = u32::from_be_bytes(chunk.try_into().expect("chunk is 4 bytes")) % num_pieces;
            if !set.contains(&idx) {
                set.push(idx);
            }
        }
    }
    set
}
