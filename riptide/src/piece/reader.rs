use std::num::NonZeroUsize;
use std::sync::Arc;
use lru::LruCache;
use tokio::sync::Mutex;
use crate::{
    block::BlockInfo,
    disk::DiskHandle,
    store::StoreInfo,
};
use super::store::{Result, StoreError};

// Serves block reads for upload. Peers usually request several blocks from
// the same piece back to back, so whole pieces are read once and kept in an
// LRU cache; sequential readers get the following pieces prefetched.
pub struct PieceReader {
    info: StoreInfo,
    disk: DiskHandle,
    cache: Mutex<LruCache<usize, Arc<Vec<u8>>>>,
    read_ahead_pieces: usize,
}

impl PieceReader {

    pub fn new(info: StoreInfo, disk: DiskHandle, cache_pieces: usize, read_ahead: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_pieces.max(1)).expect("capacity is non-zero");
        let read_ahead_pieces = if info.piece_len > 0 {
            read_ahead / info.piece_len
        } else {
            0
        };
        Self {
            info,
            disk,
            cache: Mutex::new(LruCache::new(capacity)),
            read_ahead_pieces,
        }
    }

    pub async fn read_block(&self, block: BlockInfo) -> Result<Vec<u8>> {

        if !block.is_valid(&self.info) {
            return Err(StoreError::InvalidBlock {
                piece_idx: block.piece_idx,
                offset: block.offset,
            });
        }

        let piece = self.read_piece(block.piece_idx).await?;
        if piece.len() < block.offset + block.len {
            // The piece is not fully on disk; don't serve garbage.
            self.invalidate(block.piece_idx).await;
            return Err(StoreError::InvalidBlock {
                piece_idx: block.piece_idx,
                offset: block.offset,
            });
        }
        Ok(piece[block.offset..block.offset + block.len].to_vec())
    }

    pub async fn read_piece(&self, piece_idx: usize) -> Result<Arc<Vec<u8>>> {

        if let Some(piece) = self.cache.lock().await.get(&piece_idx) {
            tracing::trace!("piece read cache hit for {}", piece_idx);
            return Ok(piece.clone());
        }

        let piece_len = self.info.piece_len(piece_idx);
        let mut data = Vec::with_capacity(piece_len);
        for slice in self.info.file_slices(piece_idx, 0, piece_len) {
            let path = self.info.abs_path(slice.file_idx);
            let bytes = self.disk.read_block(path, slice.offset, slice.len).await?;
            data.extend_from_slice(&bytes);
        }

        let piece = Arc::new(data);
        self.cache.lock().await.put(piece_idx, piece.clone());
        self.read_ahead(piece_idx);
        Ok(piece)
    }

    // Warms the disk layer for the pieces a sequential reader asks for
    // next; results are dropped, the point is the mmap and page cache.
    fn read_ahead(&self, piece_idx: usize) {
        if self.read_ahead_pieces == 0 {
            return;
        }
        let last = (piece_idx + self.read_ahead_pieces).min(self.info.num_pieces as usize - 1);
        let mut reads = Vec::new();
        for idx in piece_idx + 1..=last {
            for slice in self.info.file_slices(idx, 0, self.info.piece_len(idx)) {
                reads.push((self.info.abs_path(slice.file_idx), slice.offset, slice.len));
            }
        }
        if reads.is_empty() {
            return;
        }
        let disk = self.disk.clone();
        tokio::spawn(async move {
            for (path, offset, len) in reads {
                if disk.read_block(path, offset, len).await.is_err() {
                    break;
                }
            }
        });
    }

    // Drops a cached piece whose on-disk bytes are about to change.
    pub async fn invalidate(&self, piece_idx: usize) {
        self.cache.lock().await.pop(&piece_idx);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tempfile::tempdir;
    use crate::config::DiskConfig;
    use crate::disk::DiskManager;
    use crate::store::FileInfo;
    use super::*;

    #[tokio::test]
    async fn test_read_block_via_cache() {
        let dir = tempdir().unwrap();
        let content: Vec<u8> = (0..40_000u32).map(|i| (i % 256) as u8).collect();
        std::fs::write(dir.path().join("a.bin"), &content).unwrap();

        let info = StoreInfo {
            total_len: 40_000,
            piece_len: 32_768,
            last_piece_len: 40_000 - 32_768,
            num_pieces: 2,
            files: vec![FileInfo { path: "a.bin".into(), length: 40_000, offset: 0, md5sum: None }],
            output_dir: dir.path().to_path_buf(),
        };

        let manager = DiskManager::start(DiskConfig::default());
        let reader = PieceReader::new(info, manager.handle(), 8, 0);

        let block = reader
            .read_block(BlockInfo { piece_idx: 0, offset: crate::BLOCK_SIZE, len: 100 })
            .await
            .unwrap();
        assert_eq!(block, &content[crate::BLOCK_SIZE..crate::BLOCK_SIZE + 100]);

        // Second block of the same piece comes from the cache.
        let block = reader
            .read_block(BlockInfo { piece_idx: 0, offset: 0, len: 16 })
            .await
            .unwrap();
        assert_eq!(block, &content[..16]);

        // Out-of-range requests are rejected before touching the disk.
        assert!(reader
            .read_block(BlockInfo { piece_idx: 1, offset: 16_384, len: 16_384 })
            .await
            .is_err());

        manager.shutdown(Duration::from_secs(5)).await;
    }
}
