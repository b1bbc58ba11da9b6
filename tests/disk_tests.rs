//! Disk tier persistence, reload validation and compression.

use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;

use vfs_cache_tier::cache::disk::DiskTier;
use vfs_cache_tier::cache::entry::CacheEntry;
use vfs_cache_tier::cache::stats::CacheStats;
use vfs_cache_tier::config::{CompressionConfig, TierConfig};
use vfs_cache_tier::CacheError;

fn tiers(tmp: &TempDir, persistence: bool) -> TierConfig {
    TierConfig {
        disk_path: tmp.path().to_path_buf(),
        disk_capacity_bytes: 10_000,
        disk_persistence: persistence,
        ..TierConfig::default()
    }
}

async fn open(tmp: &TempDir, persistence: bool) -> DiskTier {
    DiskTier::open(
        &tiers(tmp, persistence),
        &CompressionConfig::default(),
        Arc::new(CacheStats::new()),
    )
    .await
    .unwrap()
}

fn entry(key: &str, byte: u8) -> CacheEntry {
    CacheEntry::new(key.into(), Bytes::from(vec![byte; 100]))
}

#[tokio::test]
async fn test_entries_survive_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let disk = open(&tmp, true).await;
        disk.put(entry("a", 1)).await.unwrap();
        disk.put(entry("b", 2)).await.unwrap();
        disk.put(entry("gone", 3)).await.unwrap();
        disk.remove(&"gone".into()).await;
    }

    let disk = open(&tmp, true).await;
    assert_eq!(disk.reload_report().restored, 2);
    assert!(disk.reload_report().corrupted.is_empty());
    assert_eq!(disk.get(&"a".into()).await, Some(Bytes::from(vec![1u8; 100])));
    assert_eq!(disk.get(&"b".into()).await, Some(Bytes::from(vec![2u8; 100])));
    assert!(!disk.contains(&"gone".into()).await);
    assert_eq!(disk.size_bytes().await, 200);
    assert!(disk.check_invariants().await);
}

#[tokio::test]
async fn test_corrupted_entry_dropped_on_reload() {
    let tmp = TempDir::new().unwrap();
    {
        let disk = open(&tmp, true).await;
        disk.put(entry("good", 1)).await.unwrap();
        disk.put(entry("bad", 2)).await.unwrap();
    }

    // `bad` occupies bytes 100..200 of the first segment.
    let segment = tmp.path().join("segment-0.dat");
    let mut bytes = std::fs::read(&segment).unwrap();
    bytes[150] ^= 0xff;
    std::fs::write(&segment, bytes).unwrap();

    let disk = open(&tmp, true).await;
    let report = disk.reload_report();
    assert_eq!(report.restored, 1);
    assert_eq!(report.corrupted.len(), 1);
    assert!(matches!(
        &report.corrupted[0],
        CacheError::CorruptedEntry { key, .. } if key == "bad"
    ));
    assert_eq!(disk.corrupted_count(), 1);
    assert!(disk.get(&"bad".into()).await.is_none());
    assert!(disk.get(&"good".into()).await.is_some());
}

#[tokio::test]
async fn test_without_persistence_starts_empty() {
    let tmp = TempDir::new().unwrap();
    {
        let disk = open(&tmp, false).await;
        disk.put(entry("a", 1)).await.unwrap();
    }
    let disk = open(&tmp, false).await;
    assert!(disk.is_empty().await);
    assert!(!tmp.path().join("segment-0.dat").exists());
}

#[tokio::test]
async fn test_compressed_payloads_accounted_in_stored_bytes() {
    let tmp = TempDir::new().unwrap();
    let compression = CompressionConfig {
        disk_zstd_compression: true,
        zstd_level: 3,
    };
    let disk = DiskTier::open(&tiers(&tmp, true), &compression, Arc::new(CacheStats::new()))
        .await
        .unwrap();

    let payload = Bytes::from(vec![7u8; 4096]);
    disk.put(CacheEntry::new("z".into(), payload.clone())).await.unwrap();
    assert!(disk.size_bytes().await < 4096);
    assert_eq!(disk.get(&"z".into()).await, Some(payload.clone()));
    drop(disk);

    let disk = DiskTier::open(&tiers(&tmp, true), &compression, Arc::new(CacheStats::new()))
        .await
        .unwrap();
    assert_eq!(disk.get(&"z".into()).await, Some(payload));
}

#[tokio::test]
async fn test_segments_rotate_and_dead_ones_are_deleted() {
    let tmp = TempDir::new().unwrap();
    let config = TierConfig {
        segment_size_bytes: 250,
        ..tiers(&tmp, false)
    };
    let disk = DiskTier::open(&config, &CompressionConfig::default(), Arc::new(CacheStats::new()))
        .await
        .unwrap();

    for (i, key) in ["a", "b", "c"].iter().enumerate() {
        disk.put(entry(key, i as u8)).await.unwrap();
    }
    // a and b fill segment 0, c starts segment 1.
    assert!(tmp.path().join("segment-1.dat").exists());

    disk.remove(&"a".into()).await;
    disk.remove(&"b".into()).await;
    assert!(!tmp.path().join("segment-0.dat").exists());
    assert!(disk.get(&"c".into()).await.is_some());
}

fn segment_file_bytes(tmp: &TempDir) -> u64 {
    std::fs::read_dir(tmp.path())
        .unwrap()
        .map(|entry| entry.unwrap())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("segment-"))
        .map(|entry| entry.metadata().unwrap().len())
        .sum()
}

#[tokio::test]
async fn test_segment_files_bounded_under_churn() {
    let tmp = TempDir::new().unwrap();
    let config = TierConfig {
        disk_capacity_bytes: 1000,
        segment_size_bytes: 1000,
        ..tiers(&tmp, false)
    };
    let disk = DiskTier::open(&config, &CompressionConfig::default(), Arc::new(CacheStats::new()))
        .await
        .unwrap();

    // Each round leaves one small survivor behind in otherwise dead space.
    for round in 0..30 {
        for i in 0..90 {
            let key = format!("r{round}-{i}");
            disk.put(CacheEntry::new(key.into(), Bytes::from(vec![i as u8; 10])))
                .await
                .unwrap();
        }
        for i in 1..90 {
            disk.take(&format!("r{round}-{i}").into()).await;
        }
    }

    let bound = 2 * 1000 + 1000;
    assert!(disk.size_bytes().await <= 1000);
    assert!(disk.segment_bytes().await <= bound);
    assert!(segment_file_bytes(&tmp) <= bound, "segment files: {}", segment_file_bytes(&tmp));
    assert!(disk.check_invariants().await);
    assert_eq!(
        disk.get(&"r29-0".into()).await,
        Some(Bytes::from(vec![0u8; 10]))
    );
}

#[tokio::test]
async fn test_index_log_bounded_under_churn() {
    let tmp = TempDir::new().unwrap();
    {
        let disk = open(&tmp, true).await;
        for i in 0..1500u32 {
            let key = format!("k{}", i % 8);
            disk.put(CacheEntry::new(key.into(), Bytes::from(vec![(i % 251) as u8; 100])))
                .await
                .unwrap();
        }
        assert!(disk.check_invariants().await);
    }

    let index = std::fs::read_to_string(tmp.path().join("index.log")).unwrap();
    let lines = index.lines().count() as u64;
    assert!(
        lines <= vfs_cache_tier::cache::disk::INDEX_COMPACT_MIN_LINES + 8,
        "index.log has {lines} lines"
    );

    let disk = open(&tmp, true).await;
    assert_eq!(disk.reload_report().restored, 8);
    for i in 1492..1500u32 {
        let key = format!("k{}", i % 8);
        assert_eq!(
            disk.get(&key.into()).await,
            Some(Bytes::from(vec![(i % 251) as u8; 100]))
        );
    }
}

#[tokio::test]
async fn test_failed_write_rolls_back() {
    let tmp = TempDir::new().unwrap();
    let disk = open(&tmp, false).await;

    // A directory where the segment file should be makes the write fail.
    let segment = tmp.path().join("segment-0.dat");
    std::fs::create_dir(&segment).unwrap();

    let err = disk.put(entry("a", 1)).await.unwrap_err();
    assert!(matches!(err, CacheError::DiskWriteFailed(_)));
    assert!(!disk.contains(&"a".into()).await);
    assert!(disk.is_empty().await);
    assert_eq!(disk.size_bytes().await, 0);
    assert!(disk.check_invariants().await);

    std::fs::remove_dir(&segment).unwrap();
    disk.put(entry("a", 1)).await.unwrap();
    assert_eq!(disk.get(&"a".into()).await, Some(Bytes::from(vec![1u8; 100])));
}
