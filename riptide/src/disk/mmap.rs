use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use memmap2::Mmap;
use super::copy_clamped;

// Size-bounded and entry-bounded directory of read-only mappings. The cache
// owns the mapping and the backing file handle; readers get copies.
pub(crate) struct MmapCache {
    entries: HashMap<PathBuf, MmapEntry>,
    total_bytes: usize,
    max_bytes: usize,
    max_entries: usize,
}

struct MmapEntry {
    map: Mmap,
    // Held open for the lifetime of the mapping.
    _file: std::fs::File,
    last_access: Instant,
    size: usize,
}

impl MmapCache {

    pub fn new(max_bytes: usize, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            total_bytes: 0,
            max_bytes,
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    // Copies a range out of the mapped file, creating the mapping on first
    // touch. None means the file is missing, empty, or unmappable; the
    // caller falls back to a plain read.
    pub fn read(&mut self, path: &Path, offset: u64, len: usize) -> Option<Vec<u8>> {
        if !self.entries.contains_key(path) && self.insert(path).is_none() {
            return None;
        }
        let entry = self.entries.get_mut(path)?;
        entry.last_access = Instant::now();
        Some(copy_clamped(&entry.map, offset, len))
    }

    // Creates a mapping without reading; used by warmup.
    pub fn warm(&mut self, path: &Path) -> Option<()> {
        if self.entries.contains_key(path) {
            return Some(());
        }
        self.insert(path).map(|_| ())
    }

    fn insert(&mut self, path: &Path) -> Option<()> {
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) => {
                tracing::debug!("mmap open failed for {:?}: {}", path, e);
                return None;
            }
        };
        let size = file.metadata().ok()?.len() as usize;
        if size == 0 {
            return None;
        }
        let map = match unsafe { Mmap::map(&file) } {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!("mmap failed for {:?}: {}", path, e);
                return None;
            }
        };

        self.entries.insert(
            path.to_path_buf(),
            MmapEntry {
                map,
                _file: file,
                last_access: Instant::now(),
                size,
            },
        );
        self.total_bytes += size;
        tracing::debug!("mmap created for {:?}, {} bytes", path, size);
        Some(())
    }

    pub fn remove(&mut self, path: &Path) {
        if let Some(entry) = self.entries.remove(path) {
            self.total_bytes -= entry.size;
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }

    // Size-aware LRU: evicts the entry with the highest bytes * idle score
    // until both the byte and entry limits hold. Returns entries evicted.
    pub fn evict_to_limits(&mut self) -> usize {
        let mut evicted = 0;
        while self.total_bytes > self.max_bytes || self.entries.len() > self.max_entries {
            let victim = self
                .entries
                .iter()
                .max_by(|(_, a), (_, b)| {
                    score(a).partial_cmp(&score(b)).unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(path, _)| path.clone());

            let Some(path) = victim else { break };
            self.remove(&path);
            evicted += 1;
            tracing::debug!("evicted {:?} from mmap cache", path);
        }
        evicted
    }
}

fn score(entry: &MmapEntry) -> f64 {
    entry.size as f64 * entry.last_access.elapsed().as_secs_f64().max(1e-6)
}

// Caps the cache at a quarter of available memory when that is smaller
// than the configured limit. Detection is best-effort; anywhere it fails,
// the configured size stands.
pub(crate) fn adaptive_cache_size(configured: usize) -> usize {
    match available_memory() {
        Some(available) => configured.min((available / 4).max(16 * 1024 * 1024)),
        None => configured,
    }
}

#[cfg(target_os = "linux")]
fn available_memory() -> Option<usize> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kib: usize = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kib * 1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn available_memory() -> Option<usize> {
    None
}
