use std::collections::{BinaryHeap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use crate::buffers::Staging;
use super::{DiskError, Shared, WriteRequest};

// Backoff after a flush error so a transient failure doesn't spin the loop.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

// Batch timeouts per detected storage class.
const NVME_TIMEOUT: Duration = Duration::from_micros(100);
const SSD_TIMEOUT: Duration = Duration::from_millis(5);
const HDD_TIMEOUT: Duration = Duration::from_millis(50);

pub(crate) fn detect_batch_timeout() -> Duration {
    match StorageKind::detect() {
        StorageKind::Nvme => NVME_TIMEOUT,
        StorageKind::Ssd => SSD_TIMEOUT,
        StorageKind::Hdd => HDD_TIMEOUT,
    }
}

#[derive(Debug, Clone, Copy)]
enum StorageKind {
    Nvme,
    Ssd,
    Hdd,
}

impl StorageKind {
    #[cfg(target_os = "linux")]
    fn detect() -> Self {
        if Path::new("/sys/class/nvme").exists() || Path::new("/dev/nvme0").exists() {
            return StorageKind::Nvme;
        }
        // Any rotational block device downgrades the guess to HDD.
        if let Ok(entries) = std::fs::read_dir("/sys/block") {
            for entry in entries.flatten() {
                let rotational = entry.path().join("queue/rotational");
                if let Ok(v) = std::fs::read_to_string(rotational) {
                    if v.trim() == "1" {
                        return StorageKind::Hdd;
                    }
                }
            }
        }
        StorageKind::Ssd
    }

    #[cfg(not(target_os = "linux"))]
    fn detect() -> Self {
        StorageKind::Ssd
    }
}

struct FileBatch {
    requests: Vec<WriteRequest>,
    bytes: usize,
    oldest: Instant,
}

// Orders the priority heap by (priority, arrival).
struct Prioritized(WriteRequest);

impl PartialEq for Prioritized {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority && self.0.seq == other.0.seq
    }
}
impl Eq for Prioritized {}

impl Ord for Prioritized {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then(other.0.seq.cmp(&self.0.seq))
    }
}
impl PartialOrd for Prioritized {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub(crate) async fn run(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<WriteRequest>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut batcher = Batcher {
        pending: HashMap::new(),
        staging: Some(Staging::new(shared.config.write_buffer_size)),
        shared,
    };
    let tick = batcher.shared.batch_timeout.max(Duration::from_millis(1));

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            request = rx.recv() => {
                let Some(request) = request else { break };
                batcher.receive(request, &mut rx);
                batcher.flush_ready().await;
            }
            // Stale sweep: force out batches that aged past the timeout
            // without new arrivals.
            _ = tokio::time::sleep(tick) => {
                batcher.flush_stale().await;
            }
        }
    }

    // Final flush of everything still queued or pending.
    while let Ok(request) = rx.try_recv() {
        batcher.stage(request);
    }
    let paths: Vec<PathBuf> = batcher.pending.keys().cloned().collect();
    for path in paths {
        batcher.flush_file(&path).await;
    }
    tracing::debug!("disk write batcher stopped");
}

struct Batcher {
    shared: Arc<Shared>,
    pending: HashMap<PathBuf, FileBatch>,
    // Moved into each blocking flush and recovered afterwards.
    staging: Option<Staging>,
}

impl Batcher {

    // Pulls everything immediately available so priority ordering sees the
    // whole backlog, not one request at a time.
    fn receive(&mut self, first: WriteRequest, rx: &mut mpsc::Receiver<WriteRequest>) {
        if self.shared.config.write_queue_priority {
            let mut heap = BinaryHeap::new();
            heap.push(Prioritized(first));
            while let Ok(request) = rx.try_recv() {
                heap.push(Prioritized(request));
            }
            while let Some(Prioritized(request)) = heap.pop() {
                self.stage(request);
            }
        } else {
            self.stage(first);
            while let Ok(request) = rx.try_recv() {
                self.stage(request);
            }
        }
    }

    fn stage(&mut self, request: WriteRequest) {
        let batch = self
            .pending
            .entry(request.path.clone())
            .or_insert_with(|| FileBatch {
                requests: Vec::new(),
                bytes: 0,
                oldest: request.queued_at,
            });
        batch.bytes += request.data.len();
        batch.oldest = batch.oldest.min(request.queued_at);
        batch.requests.push(request);
    }

    async fn flush_ready(&mut self) {
        let config = &self.shared.config;
        let timeout = self.shared.batch_timeout;
        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, batch)| {
                batch.requests.len() >= config.write_batch_requests
                    || batch.bytes >= config.write_batch_bytes
                    || batch.oldest.elapsed() > timeout
            })
            .map(|(path, _)| path.clone())
            .collect();

        for path in due {
            self.flush_file(&path).await;
        }
    }

    async fn flush_stale(&mut self) {
        let timeout = self.shared.batch_timeout;
        let stale: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, batch)| batch.oldest.elapsed() > timeout)
            .map(|(path, _)| path.clone())
            .collect();

        for path in stale {
            self.flush_file(&path).await;
        }
    }

    async fn flush_file(&mut self, path: &Path) {
        let Some(mut batch) = self.pending.remove(path) else { return };
        if batch.requests.is_empty() {
            return;
        }

        batch.requests.sort_by_key(|r| r.offset);
        let runs = split_runs(batch.requests, self.shared.config.write_contiguous_threshold);

        let staging = self.staging.take().expect("staging buffer in flight");
        let shared = self.shared.clone();
        let path_owned = path.to_path_buf();

        let permit = match self.shared.workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let mut staging = staging;
            let mut failure: Option<String> = None;
            let mut completed: Vec<(Vec<WriteRequest>, Option<String>)> = Vec::new();

            for run in runs {
                if let Some(msg) = &failure {
                    // Earlier run failed; fail the rest of this file's
                    // batch without touching the disk again.
                    completed.push((run, Some(msg.clone())));
                    continue;
                }
                match write_run(&path_owned, &run, &mut staging) {
                    Ok(bytes) => {
                        shared.stats.writes.fetch_add(1, Ordering::Relaxed);
                        shared.stats.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
                        completed.push((run, None));
                    }
                    Err(e) => {
                        let msg = e.to_string();
                        tracing::error!("disk write to {:?} failed: {}", path_owned, msg);
                        failure = Some(msg.clone());
                        completed.push((run, Some(msg)));
                    }
                }
            }
            staging.reclaim();
            (staging, completed, failure.is_some())
        });

        match task.await {
            Ok((staging, completed, failed)) => {
                self.staging = Some(staging);
                for (run, error) in completed {
                    for request in run {
                        let result = match &error {
                            None => Ok(()),
                            Some(msg) => Err(DiskError::WriteFailed(msg.clone())),
                        };
                        request.done.send(result).ok();
                    }
                }
                if failed {
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
            Err(e) => {
                // The blocking task panicked; the staging buffer is gone.
                tracing::error!("disk flush task failed: {}", e);
                self.staging = Some(Staging::new(self.shared.config.write_buffer_size));
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
    }
}

// Groups offset-sorted requests into coalescible runs. Requests separated by
// a gap no larger than `gap_threshold` share a run; the gap bytes are
// read back from the file so one large write covers the span.
pub(crate) fn split_runs(requests: Vec<WriteRequest>, gap_threshold: usize) -> Vec<Vec<WriteRequest>> {
    let mut runs: Vec<Vec<WriteRequest>> = Vec::new();
    let mut end: u64 = 0;

    for request in requests {
        let extend = !runs.is_empty()
            && request.offset >= end
            && (request.offset - end) as usize <= gap_threshold;
        if extend {
            end = end.max(request.offset + request.data.len() as u64);
            if let Some(run) = runs.last_mut() {
                run.push(request);
            }
        } else {
            end = request.offset + request.data.len() as u64;
            runs.push(vec![request]);
        }
    }
    runs
}

// Issues one write for a whole run, staging the payloads (and any gap bytes
// read back from the file) into one contiguous buffer.
fn write_run(path: &Path, run: &[WriteRequest], staging: &mut Staging) -> std::io::Result<usize> {
    use std::io::{Read, Seek, SeekFrom, Write};

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?;

    let start = run[0].offset;
    let last = run.last().expect("runs are non-empty");
    let total = (last.offset + last.data.len() as u64 - start) as usize;
    let buf = staging.slice_mut(total);

    let mut cursor = start;
    for request in run {
        if request.offset > cursor {
            // Fill the gap with current file contents so the single large
            // write cannot clobber data between the requests.
            let gap = (request.offset - cursor) as usize;
            let at = (cursor - start) as usize;
            read_existing(&mut file, cursor, &mut buf[at..at + gap])?;
            cursor = request.offset;
        }
        let at = (cursor - start) as usize;
        buf[at..at + request.data.len()].copy_from_slice(&request.data);
        cursor += request.data.len() as u64;
    }

    file.seek(SeekFrom::Start(start))?;
    file.write_all(&buf[..total])?;
    Ok(total)
}

// Reads file bytes for a gap region; anything past EOF stays zero.
fn read_existing(file: &mut std::fs::File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    buf.fill(0);
    file.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(())
}
