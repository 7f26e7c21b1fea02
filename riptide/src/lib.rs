mod metainfo;
mod store;
mod config;
mod block;
mod stats;
mod de;
mod torrent;
mod client;
pub mod buffers;
pub mod disk;
pub mod events;
pub mod ext;
mod piece;
mod p2p;
mod picker;
mod tracker;

// Wire-level block size, 16 KiB.
const BLOCK_SIZE: usize = 0x4000;

// 20-byte SHA-1 of the bencoded info dictionary; the torrent's identity.
pub type InfoHash = [u8; 20];
pub type PeerId = [u8; 20];

type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

pub use client::{Client, ClientCommand, ClientTx};
pub use config::{Config, DiskConfig, EventBusConfig, ExtensionsConfig, NetworkConfig, Preallocation, SchedulerConfig};
pub use events::{Event, EventBus, EventKind, EventPayload};
pub use metainfo::MetaInfo;
pub use torrent::{Torrent, TorrentParams};
