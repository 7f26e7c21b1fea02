use std::time::Duration;
use tempfile::tempdir;
use crate::config::{DiskConfig, Preallocation};
use super::*;

fn test_config() -> DiskConfig {
    DiskConfig {
        write_batch_timeout: Duration::from_secs(10),
        write_batch_timeout_adaptive: false,
        mmap_cache_cleanup_interval: Duration::from_millis(50),
        ..DiskConfig::default()
    }
}

#[tokio::test]
async fn test_write_coalescing_single_syscall() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.bin");

    let mut config = test_config();
    config.write_batch_requests = 8;
    let manager = DiskManager::start(config);
    let disk = manager.handle();

    // 8 contiguous 16 KiB blocks; the batch threshold flushes them as one
    // 128 KiB run.
    let mut completions = Vec::new();
    for i in 0..8u64 {
        let data = vec![i as u8; 16 * 1024];
        completions.push(
            disk.write_block(path.clone(), i * 16 * 1024, data, WritePriority::Normal).unwrap(),
        );
    }
    for rx in completions {
        rx.await.unwrap().unwrap();
    }

    let stats = disk.stats();
    assert_eq!(stats.writes, 1);
    assert_eq!(stats.bytes_written, 131_072);

    let on_disk = std::fs::read(&path).unwrap();
    assert_eq!(on_disk.len(), 131_072);
    assert_eq!(on_disk[0], 0);
    assert_eq!(on_disk[7 * 16 * 1024], 7);

    manager.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_gap_coalescing_preserves_existing_bytes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("gap.bin");
    std::fs::write(&path, vec![0xff; 64]).unwrap();

    let mut config = test_config();
    config.write_contiguous_threshold = 16;
    config.write_batch_requests = 2;
    let manager = DiskManager::start(config);
    let disk = manager.handle();

    let a = disk.write_block(path.clone(), 0, vec![1; 8], WritePriority::Normal).unwrap();
    let b = disk.write_block(path.clone(), 18, vec![2; 8], WritePriority::Normal).unwrap();
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    // One coalesced write covering [0, 26); the 10-byte gap kept its old
    // contents.
    assert_eq!(disk.stats().writes, 1);
    let on_disk = std::fs::read(&path).unwrap();
    assert_eq!(&on_disk[..8], &[1; 8]);
    assert_eq!(&on_disk[8..18], &[0xff; 10]);
    assert_eq!(&on_disk[18..26], &[2; 8]);
    assert_eq!(&on_disk[26..], &[0xff; 38]);

    manager.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_stale_writes_flush_on_timeout() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("stale.bin");

    let mut config = test_config();
    config.write_batch_timeout = Duration::from_millis(20);
    let manager = DiskManager::start(config);
    let disk = manager.handle();

    // One lone write below every threshold still reaches disk via the
    // stale sweep.
    let rx = disk.write_block(path.clone(), 0, vec![7; 100], WritePriority::Normal).unwrap();
    tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("stale write never flushed")
        .unwrap()
        .unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), vec![7; 100]);
    manager.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_queue_full_fails_fast() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("full.bin");

    let mut config = test_config();
    config.write_queue_size = 2;
    let manager = DiskManager::start(config);
    let disk = manager.handle();

    // The current-thread test runtime gives the batcher no chance to drain
    // between non-awaiting calls.
    let _a = disk.write_block(path.clone(), 0, vec![0; 8], WritePriority::Normal).unwrap();
    let _b = disk.write_block(path.clone(), 8, vec![0; 8], WritePriority::Normal).unwrap();
    let result = disk.write_block(path.clone(), 16, vec![0; 8], WritePriority::Normal);

    assert!(matches!(result, Err(DiskError::QueueFull)));
    assert_eq!(disk.stats().queue_full_errors, 1);

    manager.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_write_failure_leaves_manager_usable() {
    let dir = tempdir().unwrap();
    // Parent "blocker" is a file, so creating blocker/sub must fail.
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"x").unwrap();
    let bad_path = blocker.join("sub").join("data.bin");
    let good_path = dir.path().join("good.bin");

    let mut config = test_config();
    config.write_batch_requests = 1;
    let manager = DiskManager::start(config);
    let disk = manager.handle();

    let bad = disk.write_block(bad_path, 0, vec![0; 8], WritePriority::Normal).unwrap();
    assert!(matches!(bad.await.unwrap(), Err(DiskError::WriteFailed(_))));

    // The manager keeps serving after a failed flush.
    let good = disk.write_block(good_path.clone(), 0, vec![9; 8], WritePriority::Normal).unwrap();
    tokio::time::timeout(Duration::from_secs(5), good)
        .await
        .expect("write after failure never completed")
        .unwrap()
        .unwrap();
    assert_eq!(std::fs::read(&good_path).unwrap(), vec![9; 8]);

    manager.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_read_block_roundtrip_and_cache() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("read.bin");
    std::fs::write(&path, (0..=255u8).collect::<Vec<_>>()).unwrap();

    let manager = DiskManager::start(test_config());
    let disk = manager.handle();

    let data = disk.read_block(path.clone(), 10, 6).await.unwrap();
    assert_eq!(data, vec![10, 11, 12, 13, 14, 15]);
    assert_eq!(disk.stats().cache_hits, 1);

    // Second read hits the installed mapping again.
    let data = disk.read_block(path.clone(), 250, 100).await.unwrap();
    assert_eq!(data, (250..=255u8).collect::<Vec<_>>());
    assert_eq!(disk.stats().cache_hits, 2);

    manager.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_read_block_missing_file() {
    let dir = tempdir().unwrap();
    let manager = DiskManager::start(test_config());
    let disk = manager.handle();

    let result = disk.read_block(dir.path().join("nope.bin"), 0, 4).await;
    assert!(matches!(result, Err(DiskError::FileNotFound(_))));

    manager.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_read_block_mmap_empty_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty.bin");
    std::fs::write(&path, b"").unwrap();

    let manager = DiskManager::start(test_config());
    let disk = manager.handle();

    let data = disk.read_block_mmap(path, 0, 100).await.unwrap();
    assert!(data.is_empty());
    // Ephemeral reads install no cache entry.
    assert_eq!(disk.shared().mmap.lock().unwrap().len(), 0);

    manager.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_mmap_cache_eviction() {
    let dir = tempdir().unwrap();
    let mut cache = mmap::MmapCache::new(1024 * 1024, 128);

    for i in 0..3 {
        let path = dir.path().join(format!("f{}.bin", i));
        std::fs::write(&path, vec![i as u8; 400 * 1024]).unwrap();
        assert!(cache.read(&path, 0, 16).is_some());
    }
    assert_eq!(cache.len(), 3);
    assert!(cache.total_bytes() > 1024 * 1024);

    let evicted = cache.evict_to_limits();
    assert!(evicted >= 1);
    assert!(cache.total_bytes() <= 1024 * 1024);
    assert!(cache.len() < 3);
}

#[tokio::test]
async fn test_preallocate_strategies() {
    let dir = tempdir().unwrap();

    for (strategy, name) in [
        (Preallocation::Sparse, "sparse.bin"),
        (Preallocation::Full, "full.bin"),
        (Preallocation::Native, "native.bin"),
    ] {
        let mut config = test_config();
        config.preallocate = strategy;
        let manager = DiskManager::start(config);
        let disk = manager.handle();

        let path = dir.path().join(name);
        disk.preallocate(path.clone(), 70_000).await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 70_000);

        manager.shutdown(Duration::from_secs(5)).await;
    }

    // Full zeroes the content.
    let full = std::fs::read(dir.path().join("full.bin")).unwrap();
    assert!(full.iter().all(|&b| b == 0));
}

#[tokio::test]
async fn test_split_runs_grouping() {
    fn request(offset: u64, len: usize) -> WriteRequest {
        let (done, _rx) = tokio::sync::oneshot::channel();
        WriteRequest {
            path: "x".into(),
            offset,
            data: vec![0; len],
            priority: WritePriority::Normal,
            queued_at: std::time::Instant::now(),
            seq: 0,
            done,
        }
    }

    // Contiguous, small gap, large gap.
    let runs = batcher::split_runs(
        vec![request(0, 16), request(16, 16), request(40, 8), request(4096, 8)],
        8,
    );
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].len(), 3);
    assert_eq!(runs[1].len(), 1);

    // Zero threshold keeps only strictly adjacent writes together.
    let runs = batcher::split_runs(vec![request(0, 16), request(17, 16)], 0);
    assert_eq!(runs.len(), 2);
}
