use std::net::SocketAddr;
use std::time::SystemTime;
use crate::InfoHash;

mod bus;

pub use bus::{EventBus, EventBusStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    Low,
    Normal,
    High,
    Critical,
}

// Why a session went away; carried on PeerDisconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    InfoHashMismatch,
    ProtocolViolation,
    IdleTimeout,
    IoError,
    BadBlocks,
    Requested,
}

// One variant per event the runtime emits. Events are values; payloads never
// own sockets, files or other resources.
#[derive(Debug, Clone)]
pub enum EventPayload {

    PeerConnected { address: SocketAddr },

    PeerHandshakeComplete { address: SocketAddr },

    PeerDisconnected { address: SocketAddr, reason: DisconnectReason },

    // Learned about a peer through PEX or a tracker.
    PeerDiscovered { address: SocketAddr, source: &'static str },

    PieceVerified { piece_idx: usize },

    PieceHashFailed { piece_idx: usize, contributors: Vec<SocketAddr> },

    TorrentStarted { info_hash: InfoHash },

    TorrentStopped { info_hash: InfoHash },

    TorrentCompleted { info_hash: InfoHash },

    ExtensionHandshake { address: SocketAddr, extensions: Vec<String> },

    UnknownExtensionMessage { address: SocketAddr, ext_id: u8 },

    SslUpgraded { address: SocketAddr },

    SslRejected { address: SocketAddr },

    WebSeedDownloadSuccess { url: String, piece_idx: usize },

    WebSeedDownloadFailed { url: String, error: String },

    SystemError { message: String },

}

// Tag used for subscription routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PeerConnected,
    PeerHandshakeComplete,
    PeerDisconnected,
    PeerDiscovered,
    PieceVerified,
    PieceHashFailed,
    TorrentStarted,
    TorrentStopped,
    TorrentCompleted,
    ExtensionHandshake,
    UnknownExtensionMessage,
    SslUpgraded,
    SslRejected,
    WebSeedDownloadSuccess,
    WebSeedDownloadFailed,
    SystemError,
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::PeerConnected { .. } => EventKind::PeerConnected,
            EventPayload::PeerHandshakeComplete { .. } => EventKind::PeerHandshakeComplete,
            EventPayload::PeerDisconnected { .. } => EventKind::PeerDisconnected,
            EventPayload::PeerDiscovered { .. } => EventKind::PeerDiscovered,
            EventPayload::PieceVerified { .. } => EventKind::PieceVerified,
            EventPayload::PieceHashFailed { .. } => EventKind::PieceHashFailed,
            EventPayload::TorrentStarted { .. } => EventKind::TorrentStarted,
            EventPayload::TorrentStopped { .. } => EventKind::TorrentStopped,
            EventPayload::TorrentCompleted { .. } => EventKind::TorrentCompleted,
            EventPayload::ExtensionHandshake { .. } => EventKind::ExtensionHandshake,
            EventPayload::UnknownExtensionMessage { .. } => EventKind::UnknownExtensionMessage,
            EventPayload::SslUpgraded { .. } => EventKind::SslUpgraded,
            EventPayload::SslRejected { .. } => EventKind::SslRejected,
            EventPayload::WebSeedDownloadSuccess { .. } => EventKind::WebSeedDownloadSuccess,
            EventPayload::WebSeedDownloadFailed { .. } => EventKind::WebSeedDownloadFailed,
            EventPayload::SystemError { .. } => EventKind::SystemError,
        }
    }

    fn default_priority(&self) -> EventPriority {
        match self {
            EventPayload::SystemError { .. } => EventPriority::Critical,
            EventPayload::PieceHashFailed { .. } => EventPriority::High,
            EventPayload::PeerDiscovered { .. } => EventPriority::Low,
            _ => EventPriority::Normal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {

    pub id: u128,

    pub timestamp: SystemTime,

    pub priority: EventPriority,

    pub source: Option<&'static str>,

    pub correlation_id: Option<u128>,

    pub payload: EventPayload,

}

impl Event {

    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: rand::random(),
            timestamp: SystemTime::now(),
            priority: payload.default_priority(),
            source: None,
            correlation_id: None,
            payload,
        }
    }

    pub fn with_source(mut self, source: &'static str) -> Self {
        self.source = Some(source);
        self
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}
