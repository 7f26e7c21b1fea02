use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use crate::config::{DiskConfig, Preallocation};

mod batcher;
mod mmap;
mod preallocate;
#[cfg(test)]
mod tests;

use mmap::MmapCache;

#[derive(Debug, thiserror::Error)]
pub enum DiskError {

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("disk write queue is full")]
    QueueFull,

    #[error("disk write failed: {0}")]
    WriteFailed(String),

    #[error("preallocation failed: {0}")]
    Preallocation(String),

    #[error("disk manager is shut down")]
    Shutdown,

    #[error("write cancelled before reaching disk")]
    Cancelled,

}

pub type Result<T> = std::result::Result<T, DiskError>;

// Outcome delivered on a write's completion handle.
pub type WriteResult = std::result::Result<(), DiskError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WritePriority {
    Low,
    Normal,
    High,
}

// One queued write; the batcher owns it until flushed.
pub(crate) struct WriteRequest {
    pub path: PathBuf,
    pub offset: u64,
    pub data: Vec<u8>,
    pub priority: WritePriority,
    pub queued_at: Instant,
    pub seq: u64,
    pub done: oneshot::Sender<WriteResult>,
}

#[derive(Debug, Default)]
pub struct DiskStats {
    pub writes: AtomicU64,
    pub bytes_written: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub preallocations: AtomicU64,
    pub queue_full_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskStatsSnapshot {
    pub writes: u64,
    pub bytes_written: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub preallocations: u64,
    pub queue_full_errors: u64,
}

impl DiskStats {
    pub fn snapshot(&self) -> DiskStatsSnapshot {
        DiskStatsSnapshot {
            writes: self.writes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            preallocations: self.preallocations.load(Ordering::Relaxed),
            queue_full_errors: self.queue_full_errors.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct Shared {
    pub config: DiskConfig,
    pub queue_tx: mpsc::Sender<WriteRequest>,
    pub seq: AtomicU64,
    pub mmap: Mutex<MmapCache>,
    pub stats: DiskStats,
    pub workers: Arc<Semaphore>,
    pub batch_timeout: Duration,
    pub shutdown_tx: watch::Sender<bool>,
}

// The only component that touches the filesystem on the hot path. Owns the
// write queue, the batcher and cleaner tasks, and the mmap cache.
pub struct DiskManager {
    handle: DiskHandle,
    batcher: JoinHandle<()>,
    cleaner: JoinHandle<()>,
}

// Cheap cloneable handle shared by all torrents.
#[derive(Clone)]
pub struct DiskHandle {
    shared: Arc<Shared>,
}

impl DiskManager {

    pub fn start(config: DiskConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.write_queue_size.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let workers = if config.workers_adaptive {
            std::thread::available_parallelism()
                .map(|n| (n.get() / 2).max(2))
                .unwrap_or(config.workers)
        } else {
            config.workers
        };

        let batch_timeout = if config.write_batch_timeout_adaptive {
            batcher::detect_batch_timeout()
        } else {
            config.write_batch_timeout
        };
        tracing::info!("disk manager starting, {} workers, batch timeout {:?}", workers, batch_timeout);

        let cache_size = if config.mmap_cache_adaptive {
            mmap::adaptive_cache_size(config.mmap_cache_size)
        } else {
            config.mmap_cache_size
        };

        let shared = Arc::new(Shared {
            mmap: Mutex::new(MmapCache::new(cache_size, config.mmap_cache_entries)),
            config,
            queue_tx,
            seq: AtomicU64::new(0),
            stats: DiskStats::default(),
            workers: Arc::new(Semaphore::new(workers.max(1))),
            batch_timeout,
            shutdown_tx,
        });

        let batcher = tokio::spawn(batcher::run(shared.clone(), queue_rx, shutdown_rx.clone()));
        let cleaner = tokio::spawn(cache_cleaner(shared.clone(), shutdown_rx));

        DiskManager {
            handle: DiskHandle { shared },
            batcher,
            cleaner,
        }
    }

    pub fn handle(&self) -> DiskHandle {
        self.handle.clone()
    }

    // Stops background tasks, flushes outstanding writes within the given
    // bound and tears down the mmap cache.
    pub async fn shutdown(self, flush_timeout: Duration) {
        self.handle.shared.shutdown_tx.send(true).ok();

        if tokio::time::timeout(flush_timeout, self.batcher).await.is_err() {
            tracing::warn!("disk batcher did not flush within {:?}", flush_timeout);
        }
        self.cleaner.abort();

        self.handle
            .shared
            .mmap
            .lock()
            .expect("mmap cache poisoned")
            .clear();

        // Give Windows a moment to release the unmapped handles before
        // callers unlink files.
        #[cfg(windows)]
        tokio::time::sleep(Duration::from_millis(250)).await;

        tracing::info!("disk manager stopped");
    }
}

impl DiskHandle {

    // Enqueues a write. Fails fast with QueueFull when the bounded queue is
    // at capacity; the returned receiver resolves when the batch flushes.
    pub fn write_block(
        &self,
        path: PathBuf,
        offset: u64,
        data: Vec<u8>,
        priority: WritePriority,
    ) -> Result<oneshot::Receiver<WriteResult>> {
        let (done, rx) = oneshot::channel();
        let request = WriteRequest {
            path,
            offset,
            data,
            priority,
            queued_at: Instant::now(),
            seq: self.shared.seq.fetch_add(1, Ordering::Relaxed),
            done,
        };

        match self.shared.queue_tx.try_send(request) {
            Ok(()) => Ok(rx),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.stats.queue_full_errors.fetch_add(1, Ordering::Relaxed);
                Err(DiskError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DiskError::Shutdown),
        }
    }

    // Reads through the mmap cache when enabled, else from a worker thread.
    pub async fn read_block(&self, path: PathBuf, offset: u64, len: usize) -> Result<Vec<u8>> {

        if self.shared.config.mmap_enabled {
            let cached = {
                let mut cache = self.shared.mmap.lock().expect("mmap cache poisoned");
                cache.read(&path, offset, len)
            };
            match cached {
                Some(data) => {
                    self.shared.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(data);
                }
                None => {
                    self.shared.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let _permit = self.shared.workers.clone().acquire_owned().await
            .map_err(|_| DiskError::Shutdown)?;
        tokio::task::spawn_blocking(move || read_block_sync(&path, offset, len))
            .await
            .map_err(|e| DiskError::WriteFailed(e.to_string()))?
    }

    // Ephemeral read-only mapping; installs no cache entry. An empty file
    // yields empty bytes without creating a mapping.
    pub async fn read_block_mmap(&self, path: PathBuf, offset: u64, len: usize) -> Result<Vec<u8>> {
        let _permit = self.shared.workers.clone().acquire_owned().await
            .map_err(|_| DiskError::Shutdown)?;
        tokio::task::spawn_blocking(move || {
            let file = open_for_read(&path)?;
            let file_len = file.metadata()?.len();
            if file_len == 0 {
                return Ok(Vec::new());
            }
            let map = unsafe { memmap2::Mmap::map(&file) }?;
            Ok(copy_clamped(&map, offset, len))
        })
        .await
        .map_err(|e| DiskError::WriteFailed(e.to_string()))?
    }

    pub async fn preallocate(&self, path: PathBuf, size: u64) -> Result<()> {
        let strategy = self.shared.config.preallocate;
        if strategy == Preallocation::None {
            return Ok(());
        }

        let _permit = self.shared.workers.clone().acquire_owned().await
            .map_err(|_| DiskError::Shutdown)?;
        let result = tokio::task::spawn_blocking(move || {
            preallocate::preallocate_sync(&path, size, strategy)
        })
        .await
        .map_err(|e| DiskError::Preallocation(e.to_string()))?;

        match result {
            Ok(()) => {
                self.shared.stats.preallocations.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => Err(DiskError::Preallocation(e.to_string())),
        }
    }

    // Best-effort cache warmup, highest priority first.
    pub async fn warmup(&self, mut files: Vec<(PathBuf, u8)>) {
        if !self.shared.config.mmap_enabled {
            return;
        }
        files.sort_by(|a, b| b.1.cmp(&a.1));
        let mut cache = self.shared.mmap.lock().expect("mmap cache poisoned");
        for (path, _) in files {
            if cache.warm(&path).is_none() {
                tracing::debug!("mmap warmup skipped {:?}", path);
            }
        }
        cache.evict_to_limits();
    }

    pub fn drop_mmap(&self, path: &std::path::Path) {
        self.shared
            .mmap
            .lock()
            .expect("mmap cache poisoned")
            .remove(path);
    }

    pub fn stats(&self) -> DiskStatsSnapshot {
        self.shared.stats.snapshot()
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }
}

async fn cache_cleaner(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let interval = shared.config.mmap_cache_cleanup_interval;
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(interval) => {
                let evicted = shared
                    .mmap
                    .lock()
                    .expect("mmap cache poisoned")
                    .evict_to_limits();
                if evicted > 0 {
                    tracing::debug!("mmap cache cleaner evicted {} entries", evicted);
                }
            }
        }
    }
}

fn open_for_read(path: &std::path::Path) -> Result<std::fs::File> {
    std::fs::File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            DiskError::FileNotFound(path.to_path_buf())
        } else {
            DiskError::Io(e)
        }
    })
}

fn read_block_sync(path: &std::path::Path, offset: u64, len: usize) -> Result<Vec<u8>> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = open_for_read(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0; len];
    let mut filled = 0;
    while filled < len {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

fn copy_clamped(data: &[u8], offset: u64, len: usize) -> Vec<u8> {
    let start = (offset as usize).min(data.len());
    let end = (start + len).min(data.len());
    data[start..end].to_vec()
}
