mod store;
mod reader;

pub use reader::PieceReader;
pub use store::{PieceStore, StoreError, VerifyJob, VerifyOutcome, WriteOutcome};

// Download lifecycle of a single piece.
//
//   Missing -> Requested -> Downloading -> Verified -> Available
//
// A hash mismatch sends the piece back to Missing; a piece stuck failing
// verification is parked in Paused for operator attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Missing,
    Requested,
    Downloading,
    Verified,
    Available,
    Paused,
}

impl PieceState {
    pub fn is_complete(&self) -> bool {
        matches!(self, PieceState::Verified | PieceState::Available)
    }
}
