use std::{net::SocketAddr, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::Instrument;
use crate::{
    block::{Block, BlockInfo},
    events::DisconnectReason,
    ext::pex::PexPeer,
    torrent::TorrentContext,
    PeerId,
};

mod handshake;
mod message;
mod session;
pub mod state;
#[cfg(test)]
mod tests;

pub use handshake::{Handshake, HandshakeCodec, PROTOCOL};
pub use message::Message;
pub use session::PeerSession;
use state::SessionState;

pub type Result<T> = std::result::Result<T, PeerError>;
type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("no handshake received")]
    NoHandshake,

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("bitfield sent mid-session")]
    UnexpectedBitfield,

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("message of {0} bytes exceeds the frame limit")]
    OversizedMessage(usize),

    #[error("connection timeout")]
    Timeout,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("tls negotiation failed: {0}")]
    TlsFailed(String),

    #[error("channel error: {0}")]
    Channel(String),

}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        PeerError::Channel(e.to_string())
    }
}

impl PeerError {
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            PeerError::IncorrectInfoHash => DisconnectReason::InfoHashMismatch,
            PeerError::Timeout => DisconnectReason::IdleTimeout,
            PeerError::Io(_) | PeerError::ConnectionClosed => DisconnectReason::IoError,
            _ => DisconnectReason::ProtocolViolation,
        }
    }
}

// Commands the torrent (or disk-read tasks) send to a peer session.
pub enum PeerCommand {

    // A piece finished verification: announce it, cancel dangling requests.
    PieceWritten(usize),

    // Block read from disk for serving an upload.
    BlockRead(Block),

    // Endgame: another peer satisfied this block first.
    SendCancel(BlockInfo),

    // Choker decisions.
    Choke,
    Unchoke,

    // Periodic PEX gossip; the session computes its own delta.
    PexTick(Vec<PexPeer>),

    Shutdown,

}

#[derive(Debug)]
pub struct PeerHandle {

    pub peer_tx: PeerTx,

    // Option so shutdown can await the task behind a mutable ref.
    pub session_handle: Option<JoinHandle<()>>,

    // Last state reported by the session.
    pub state: SessionState,

    pub id: Option<PeerId>,

}

impl PeerHandle {
    pub fn start_session(
        address: SocketAddr,
        ctx: Arc<TorrentContext>,
        socket: Option<tokio::net::TcpStream>,
    ) -> Self {

        let (mut session, peer_tx) = PeerSession::new(address, ctx);
        let session_handle = tokio::spawn(
            async move {
                if let Err(e) = session.start(socket).await {
                    tracing::debug!("session error: {}", e);
                    session.disconnect(e.disconnect_reason()).await;
                } else {
                    session.disconnect(DisconnectReason::Requested).await;
                }
            }
            .instrument(tracing::info_span!("peer", addr = %address)),
        );

        PeerHandle {
            peer_tx,
            session_handle: Some(session_handle),
            state: SessionState::default(),
            id: None,
        }
    }
}
