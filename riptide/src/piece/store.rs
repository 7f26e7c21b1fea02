use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::oneshot;
use crate::{
    block::{num_blocks, Block},
    disk::{DiskHandle, WritePriority, WriteResult},
    events::{Event, EventBus, EventPayload},
    store::StoreInfo,
};
use super::PieceState;

// Consecutive hash failures before a piece is paused for inspection.
const PAUSE_AFTER_FAILURES: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {

    #[error("invalid block {piece_idx}+{offset}")]
    InvalidBlock { piece_idx: usize, offset: usize },

    #[error("disk error: {0}")]
    Disk(#[from] crate::disk::DiskError),

}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    // First copy of the block accepted and routed to disk.
    Accepted,
    // All blocks of the piece have now arrived.
    PieceComplete,
    // Identical block already applied; dropped.
    Duplicate,
}

// Blocks received so far for one in-progress piece.
struct PieceProgress {
    received: Vec<bool>,
    num_received: usize,
    // Which peer delivered each block, for hash-failure attribution.
    contributors: HashMap<SocketAddr, u32>,
    // Write completions the verify step must await before reading back.
    pending_writes: Vec<oneshot::Receiver<WriteResult>>,
}

// Maps the logical piece address space onto files and tracks piece state.
// Never touches the filesystem itself; every byte goes through the disk
// manager.
pub struct PieceStore {
    info: StoreInfo,
    hashes: Vec<[u8; 20]>,
    states: Vec<PieceState>,
    progress: HashMap<usize, PieceProgress>,
    consecutive_failures: HashMap<usize, u32>,
    disk: DiskHandle,
    events: EventBus,
    duplicate_blocks: u64,
}

impl PieceStore {

    pub fn new(info: StoreInfo, hashes: Vec<[u8; 20]>, disk: DiskHandle, events: EventBus) -> Self {
        debug_assert_eq!(hashes.len(), info.num_pieces as usize);
        Self {
            states: vec![PieceState::Missing; info.num_pieces as usize],
            progress: HashMap::new(),
            consecutive_failures: HashMap::new(),
            info,
            hashes,
            disk,
            events,
            duplicate_blocks: 0,
        }
    }

    pub fn state(&self, piece_idx: usize) -> PieceState {
        self.states[piece_idx]
    }

    pub fn duplicate_blocks(&self) -> u64 {
        self.duplicate_blocks
    }

    pub fn missing_count(&self) -> usize {
        self.states
            .iter()
            .filter(|s| !s.is_complete())
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.states.iter().all(|s| s.is_complete())
    }

    pub fn bitfield(&self) -> crate::Bitfield {
        let mut bf = crate::Bitfield::repeat(false, self.states.len());
        for (idx, state) in self.states.iter().enumerate() {
            if state.is_complete() {
                bf.set(idx, true);
            }
        }
        bf
    }

    // The scheduler has started planning requests for this piece.
    pub fn note_requested(&mut self, piece_idx: usize) {
        if self.states[piece_idx] == PieceState::Missing {
            self.states[piece_idx] = PieceState::Requested;
        }
    }

    // Applies one received block. The first write wins; duplicates are
    // dropped with a counter so endgame double-deliveries are harmless.
    pub fn write_block(&mut self, block: Block, from: Option<SocketAddr>) -> Result<WriteOutcome> {

        let info = block.info();
        if !info.is_valid(&self.info) {
            return Err(StoreError::InvalidBlock { piece_idx: info.piece_idx, offset: info.offset });
        }

        let piece_idx = info.piece_idx;
        if self.states[piece_idx].is_complete() {
            self.duplicate_blocks += 1;
            return Ok(WriteOutcome::Duplicate);
        }

        let piece_len = self.info.piece_len(piece_idx);
        let progress = self.progress.entry(piece_idx).or_insert_with(|| PieceProgress {
            received: vec![false; num_blocks(piece_len)],
            num_received: 0,
            contributors: HashMap::new(),
            pending_writes: Vec::new(),
        });

        let block_idx = info.idx_in_piece();
        if progress.received[block_idx] {
            self.duplicate_blocks += 1;
            return Ok(WriteOutcome::Duplicate);
        }
        progress.received[block_idx] = true;
        progress.num_received += 1;
        if let Some(addr) = from {
            *progress.contributors.entry(addr).or_insert(0) += 1;
        }

        // Route across file boundaries.
        let mut cursor = 0;
        for slice in self.info.file_slices(piece_idx, info.offset, info.len) {
            let path = self.info.abs_path(slice.file_idx);
            let data = block.data[cursor..cursor + slice.len].to_vec();
            cursor += slice.len;
            let rx = self.disk.write_block(path, slice.offset, data, WritePriority::Normal)?;
            progress.pending_writes.push(rx);
        }

        self.states[piece_idx] = PieceState::Downloading;

        if progress.num_received == num_blocks(piece_len) {
            Ok(WriteOutcome::PieceComplete)
        } else {
            Ok(WriteOutcome::Accepted)
        }
    }

    // Packages everything the verify task needs so it can run detached from
    // the store. Returns None unless every block of the piece has arrived.
    pub fn take_verify_job(&mut self, piece_idx: usize) -> Option<VerifyJob> {
        let piece_len = self.info.piece_len(piece_idx);
        let progress = self.progress.get_mut(&piece_idx)?;
        if progress.num_received != num_blocks(piece_len) {
            return None;
        }

        let pending_writes = std::mem::take(&mut progress.pending_writes);
        let contributors = progress.contributors.keys().copied().collect();
        let reads = self
            .info
            .file_slices(piece_idx, 0, piece_len)
            .into_iter()
            .map(|s| (self.info.abs_path(s.file_idx), s.offset, s.len))
            .collect();

        Some(VerifyJob {
            piece_idx,
            expected: self.hashes[piece_idx],
            disk: self.disk.clone(),
            reads,
            pending_writes,
            contributors,
        })
    }

    // Applies a verify outcome: publish Verified only after the read-back
    // confirmed the bytes are on disk, or discard and penalize on mismatch.
    pub fn apply_verify(&mut self, outcome: &VerifyOutcome) -> PieceState {
        let piece_idx = outcome.piece_idx;
        self.progress.remove(&piece_idx);

        if outcome.valid {
            self.states[piece_idx] = PieceState::Verified;
            self.consecutive_failures.remove(&piece_idx);
            self.events.emit(Event::new(EventPayload::PieceVerified { piece_idx }));
        } else {
            let failures = self.consecutive_failures.entry(piece_idx).or_insert(0);
            *failures += 1;
            if *failures >= PAUSE_AFTER_FAILURES {
                tracing::warn!(
                    "piece {} failed verification {} times in a row, pausing it",
                    piece_idx, failures,
                );
                self.states[piece_idx] = PieceState::Paused;
            } else {
                self.states[piece_idx] = PieceState::Missing;
            }
            self.events.emit(Event::new(EventPayload::PieceHashFailed {
                piece_idx,
                contributors: outcome.contributors.clone(),
            }));
        }
        self.states[piece_idx]
    }

    // Hands back every write completion still outstanding, for the
    // shutdown path to await before the torrent reports stopped.
    pub fn drain_pending_writes(&mut self) -> Vec<oneshot::Receiver<WriteResult>> {
        self.progress
            .values_mut()
            .flat_map(|p| std::mem::take(&mut p.pending_writes))
            .collect()
    }

    // Verified -> Available once the piece has been announced to peers.
    pub fn mark_available(&mut self, piece_idx: usize) {
        if self.states[piece_idx] == PieceState::Verified {
            self.states[piece_idx] = PieceState::Available;
        }
    }

    // Resume support: hashes whatever is already on disk and marks the
    // matching pieces Available. Runs before any peer is connected.
    pub async fn verify_existing(&mut self, reader: &super::PieceReader) -> usize {
        let mut found = 0;
        for piece_idx in 0..self.info.num_pieces as usize {
            let Ok(piece) = reader.read_piece(piece_idx).await else {
                // Nothing on disk yet for this piece's files.
                continue;
            };
            if piece.len() != self.info.piece_len(piece_idx) {
                reader.invalidate(piece_idx).await;
                continue;
            }
            let expected = self.hashes[piece_idx];
            let piece = piece.clone();
            let matches = tokio::task::spawn_blocking(move || {
                use sha1::Digest;
                let mut hasher = sha1::Sha1::new();
                hasher.update(&*piece);
                let digest: [u8; 20] = hasher.finalize().into();
                digest == expected
            })
            .await
            .unwrap_or(false);

            if matches {
                self.states[piece_idx] = PieceState::Available;
                found += 1;
            } else {
                // Keep the stale bytes out of the upload cache.
                reader.invalidate(piece_idx).await;
            }
        }
        if found > 0 {
            tracing::info!("{} pieces already on disk verified", found);
        }
        found
    }
}

// Detached verification: await outstanding writes, read the piece back,
// hash it on a worker thread, compare.
pub struct VerifyJob {
    piece_idx: usize,
    expected: [u8; 20],
    disk: DiskHandle,
    reads: Vec<(PathBuf, u64, usize)>,
    pending_writes: Vec<oneshot::Receiver<WriteResult>>,
    contributors: Vec<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub piece_idx: usize,
    pub valid: bool,
    pub contributors: Vec<SocketAddr>,
}

impl VerifyJob {

    pub async fn run(self) -> VerifyOutcome {
        let VerifyJob { piece_idx, expected, disk, reads, pending_writes, contributors } = self;
        let failed = |contributors: Vec<SocketAddr>| VerifyOutcome {
            piece_idx,
            valid: false,
            contributors,
        };

        for rx in pending_writes {
            match rx.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!("piece {} write failed before verify: {}", piece_idx, e);
                    return failed(contributors);
                }
                Err(_) => {
                    tracing::error!("piece {} write dropped before verify", piece_idx);
                    return failed(contributors);
                }
            }
        }

        let mut data = Vec::new();
        for (path, offset, len) in &reads {
            match disk.read_block(path.clone(), *offset, *len).await {
                Ok(bytes) if bytes.len() == *len => data.extend_from_slice(&bytes),
                Ok(bytes) => {
                    tracing::error!(
                        "piece {} short read: wanted {} got {}",
                        piece_idx, len, bytes.len(),
                    );
                    return failed(contributors);
                }
                Err(e) => {
                    tracing::error!("piece {} read-back failed: {}", piece_idx, e);
                    return failed(contributors);
                }
            }
        }

        let valid = tokio::task::spawn_blocking(move || {
            use sha1::Digest;
            let mut hasher = sha1::Sha1::new();
            hasher.update(&data);
            let digest: [u8; 20] = hasher.finalize().into();
            digest == expected
        })
        .await
        .unwrap_or(false);

        VerifyOutcome {
            piece_idx,
            valid,
            contributors,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tempfile::tempdir;
    use crate::config::{DiskConfig, EventBusConfig};
    use crate::disk::DiskManager;
    use crate::store::FileInfo;
    use super::*;

    fn sha1_of(data: &[u8]) -> [u8; 20] {
        use sha1::Digest;
        let mut hasher = sha1::Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn fixture(dir: &std::path::Path) -> (StoreInfo, Vec<Vec<u8>>) {
        // Two 32 KiB pieces over two files, piece 1 truncated to 20000.
        let piece_len = 32_768;
        let total: u64 = 32_768 + 20_000;
        let pieces: Vec<Vec<u8>> = vec![
            (0..piece_len).map(|i| (i % 251) as u8).collect(),
            (0..20_000).map(|i| (i % 13) as u8).collect(),
        ];
        let info = StoreInfo {
            total_len: total,
            piece_len,
            last_piece_len: 20_000,
            num_pieces: 2,
            files: vec![
                FileInfo { path: "a.bin".into(), length: 40_000, offset: 0, md5sum: None },
                FileInfo { path: "b.bin".into(), length: total - 40_000, offset: 40_000, md5sum: None },
            ],
            output_dir: dir.to_path_buf(),
        };
        (info, pieces)
    }

    async fn write_whole_piece(
        store: &mut PieceStore,
        piece_idx: usize,
        data: &[u8],
        from: SocketAddr,
    ) -> WriteOutcome {
        let mut last = WriteOutcome::Accepted;
        for (block_idx, chunk) in data.chunks(crate::BLOCK_SIZE).enumerate() {
            last = store
                .write_block(
                    Block {
                        piece_idx,
                        offset: block_idx * crate::BLOCK_SIZE,
                        data: chunk.to_vec(),
                    },
                    Some(from),
                )
                .unwrap();
        }
        last
    }

    #[tokio::test]
    async fn test_write_verify_roundtrip() {
        let dir = tempdir().unwrap();
        let (info, pieces) = fixture(dir.path());
        let hashes = pieces.iter().map(|p| sha1_of(p)).collect();

        let manager = DiskManager::start(DiskConfig {
            write_batch_timeout: Duration::from_millis(5),
            write_batch_timeout_adaptive: false,
            ..DiskConfig::default()
        });
        let (events, _bus_task) = EventBus::start(&EventBusConfig::default());
        let mut store = PieceStore::new(info, hashes, manager.handle(), events);

        let peer: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let outcome = write_whole_piece(&mut store, 0, &pieces[0], peer).await;
        assert_eq!(outcome, WriteOutcome::PieceComplete);
        assert_eq!(store.state(0), PieceState::Downloading);

        let job = store.take_verify_job(0).unwrap();
        let outcome = job.run().await;
        assert!(outcome.valid);
        assert_eq!(store.apply_verify(&outcome), PieceState::Verified);

        // The truncated final piece verifies with its short length.
        let outcome = write_whole_piece(&mut store, 1, &pieces[1], peer).await;
        assert_eq!(outcome, WriteOutcome::PieceComplete);
        let outcome = store.take_verify_job(1).unwrap().run().await;
        assert!(outcome.valid);
        store.apply_verify(&outcome);
        assert!(store.is_complete());

        // Bytes landed across the file boundary correctly.
        let a = std::fs::read(dir.path().join("a.bin")).unwrap();
        let b = std::fs::read(dir.path().join("b.bin")).unwrap();
        assert_eq!(a.len(), 40_000);
        assert_eq!(&a[..32_768], &pieces[0][..]);
        assert_eq!(&a[32_768..], &pieces[1][..40_000 - 32_768]);
        assert_eq!(&b[..], &pieces[1][40_000 - 32_768..]);

        manager.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_duplicate_block_dropped() {
        let dir = tempdir().unwrap();
        let (info, pieces) = fixture(dir.path());
        let hashes = pieces.iter().map(|p| sha1_of(p)).collect();

        let manager = DiskManager::start(DiskConfig::default());
        let (events, _bus_task) = EventBus::start(&EventBusConfig::default());
        let mut store = PieceStore::new(info, hashes, manager.handle(), events);

        let peer: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let block = Block { piece_idx: 0, offset: 0, data: pieces[0][..crate::BLOCK_SIZE].to_vec() };
        assert_eq!(store.write_block(block.clone(), Some(peer)).unwrap(), WriteOutcome::Accepted);
        assert_eq!(store.write_block(block, Some(peer)).unwrap(), WriteOutcome::Duplicate);
        assert_eq!(store.duplicate_blocks(), 1);

        manager.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_hash_failure_attribution() {
        let dir = tempdir().unwrap();
        let (info, pieces) = fixture(dir.path());
        // Expected hashes deliberately do not match the data.
        let hashes = vec![[0u8; 20]; 2];

        let manager = DiskManager::start(DiskConfig {
            write_batch_timeout: Duration::from_millis(5),
            write_batch_timeout_adaptive: false,
            ..DiskConfig::default()
        });
        let (events, _bus_task) = EventBus::start(&EventBusConfig::default());
        let mut store = PieceStore::new(info, hashes, manager.handle(), events.clone());

        // Two peers each contribute one block of piece 0.
        let peer_a: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let peer_b: SocketAddr = "10.0.0.2:2".parse().unwrap();
        store.write_block(
            Block { piece_idx: 0, offset: 0, data: pieces[0][..crate::BLOCK_SIZE].to_vec() },
            Some(peer_a),
        ).unwrap();
        let outcome = store.write_block(
            Block { piece_idx: 0, offset: crate::BLOCK_SIZE, data: pieces[0][crate::BLOCK_SIZE..].to_vec() },
            Some(peer_b),
        ).unwrap();
        assert_eq!(outcome, WriteOutcome::PieceComplete);

        let outcome = store.take_verify_job(0).unwrap().run().await;
        assert!(!outcome.valid);
        let mut contributors = outcome.contributors.clone();
        contributors.sort();
        assert_eq!(contributors, vec![peer_a, peer_b]);

        // Piece re-enters Missing and the event carries both peers.
        assert_eq!(store.apply_verify(&outcome), PieceState::Missing);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let replayed = events.replay(Some(crate::events::EventKind::PieceHashFailed), 10);
        assert_eq!(replayed.len(), 1);

        manager.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_repeated_failures_pause_piece() {
        let dir = tempdir().unwrap();
        let (info, _) = fixture(dir.path());
        let manager = DiskManager::start(DiskConfig::default());
        let (events, _bus_task) = EventBus::start(&EventBusConfig::default());
        let mut store = PieceStore::new(info, vec![[0u8; 20]; 2], manager.handle(), events);

        let outcome = VerifyOutcome { piece_idx: 0, valid: false, contributors: vec![] };
        assert_eq!(store.apply_verify(&outcome), PieceState::Missing);
        assert_eq!(store.apply_verify(&outcome), PieceState::Missing);
        assert_eq!(store.apply_verify(&outcome), PieceState::Paused);

        manager.shutdown(Duration::from_secs(5)).await;
    }
}
