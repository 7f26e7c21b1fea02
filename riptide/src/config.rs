use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};
use crate::PeerId;

// The core reads no environment; everything arrives through this struct.
#[derive(Debug, Clone)]
pub struct Config {

    pub client_id: PeerId,

    pub output_dir: PathBuf,

    pub listen_address: SocketAddr,

    pub scheduler: SchedulerConfig,

    pub network: NetworkConfig,

    pub disk: DiskConfig,

    pub extensions: ExtensionsConfig,

    pub event_bus: EventBusConfig,

}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {

    // Blocks in flight per peer.
    pub request_window: usize,

    // Raised window during endgame.
    pub request_window_endgame: usize,

    // Endgame starts when missing pieces drop to this count (or below 5%).
    pub endgame_threshold: usize,

    pub request_timeout: Duration,

    pub unchoke_slots: usize,

    pub unchoke_interval: Duration,

    pub optimistic_unchoke_interval: Duration,

    // Bad blocks before a peer is dropped and blacklisted.
    pub bad_blocks_threshold: u32,

    // Disconnect slow peers instead of just deprioritizing them.
    pub slow_peer_disconnect: bool,

}

#[derive(Debug, Clone)]
pub struct NetworkConfig {

    pub min_peers: usize,

    pub max_peers: usize,

    // Outbound connection attempts per tick.
    pub max_connect_rate: usize,

    pub keepalive: Duration,

    pub idle_disconnect: Duration,

    pub max_frame_size: usize,

}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preallocation {
    None,
    Sparse,
    Full,
    // posix_fallocate on Linux, SetEndOfFile on Windows, sparse elsewhere.
    Native,
}

#[derive(Debug, Clone)]
pub struct DiskConfig {

    pub preallocate: Preallocation,

    // Flush a file's batch when it holds this many requests...
    pub write_batch_requests: usize,

    // ...or this many bytes.
    pub write_batch_bytes: usize,

    // Fixed batch timeout; replaced by a detected value when adaptive.
    pub write_batch_timeout: Duration,

    pub write_batch_timeout_adaptive: bool,

    // Writes this close together are coalesced into one run.
    pub write_contiguous_threshold: usize,

    pub write_queue_size: usize,

    // Max-heap over (priority, arrival) instead of FIFO.
    pub write_queue_priority: bool,

    pub mmap_enabled: bool,

    pub mmap_cache_size: usize,

    // Shrink the cache limit to a share of available memory when smaller
    // than the configured size.
    pub mmap_cache_adaptive: bool,

    pub mmap_cache_entries: usize,

    pub mmap_cache_cleanup_interval: Duration,

    pub mmap_cache_warmup: bool,

    pub read_ahead: usize,

    pub read_ahead_adaptive: bool,

    pub workers: usize,

    pub workers_adaptive: bool,

    // Staging buffer used by the write batcher to coalesce runs.
    pub write_buffer_size: usize,

    // Whole pieces cached after a block read; peers usually come back for
    // neighbouring blocks.
    pub read_cache_pieces: usize,

}

#[derive(Debug, Clone)]
pub struct ExtensionsConfig {

    pub fast_enabled: bool,

    pub pex_enabled: bool,

    pub pex_interval: Duration,

    pub webseed_enabled: bool,

    pub ssl_peers_enabled: bool,

    // Fall back to plaintext when the peer rejects the upgrade.
    pub ssl_opportunistic: bool,

}

#[derive(Debug, Clone)]
pub struct EventBusConfig {

    pub queue_size: usize,

    pub replay_size: usize,

}

const DEFAULT_CLIENT_ID: PeerId = *b"-RP0010-73b3b0b0b0b0";

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID,
            output_dir: PathBuf::from("downloads"),
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6881),
            scheduler: SchedulerConfig::default(),
            network: NetworkConfig::default(),
            disk: DiskConfig::default(),
            extensions: ExtensionsConfig::default(),
            event_bus: EventBusConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            request_window: 16,
            request_window_endgame: 64,
            endgame_threshold: 20,
            request_timeout: Duration::from_secs(60),
            unchoke_slots: 4,
            unchoke_interval: Duration::from_secs(10),
            optimistic_unchoke_interval: Duration::from_secs(30),
            bad_blocks_threshold: 5,
            slow_peer_disconnect: false,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            min_peers: 5,
            max_peers: 100,
            max_connect_rate: 10,
            keepalive: Duration::from_secs(120),
            idle_disconnect: Duration::from_secs(240),
            max_frame_size: 1024 * 1024,
        }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            preallocate: Preallocation::Sparse,
            write_batch_requests: 16,
            write_batch_bytes: 256 * 1024,
            write_batch_timeout: Duration::from_millis(5),
            write_batch_timeout_adaptive: true,
            write_contiguous_threshold: 0,
            write_queue_size: 1024,
            write_queue_priority: false,
            mmap_enabled: true,
            mmap_cache_size: 256 * 1024 * 1024,
            mmap_cache_adaptive: false,
            mmap_cache_entries: 128,
            mmap_cache_cleanup_interval: Duration::from_secs(5),
            mmap_cache_warmup: false,
            read_ahead: 0,
            read_ahead_adaptive: false,
            workers: 2,
            workers_adaptive: false,
            write_buffer_size: 256 * 1024,
            read_cache_pieces: 500,
        }
    }
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        Self {
            fast_enabled: true,
            pex_enabled: true,
            pex_interval: Duration::from_secs(60),
            webseed_enabled: true,
            ssl_peers_enabled: false,
            ssl_opportunistic: true,
        }
    }
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_size: 10_000,
            replay_size: 1000,
        }
    }
}
