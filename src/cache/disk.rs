//! Disk tier: the ARC state machine over a bounded on-disk region.
//!
//! The tier lock covers list and index updates only. A write reserves its
//! slot under the lock, performs the I/O unlocked, then confirms under the
//! lock again; a read copies the record location under the lock and reads
//! unlocked. A slow disk therefore never stalls other tier operations.
//!
//! Evicted payloads are dropped (there is no colder tier); their keys stay
//! in the ghost lists for adaptivity.
//!
//! Segment files are append-only. A sealed segment whose live ratio drops
//! below [`COMPACT_LIVE_RATIO`] has its live records rewritten into the
//! active segment and is then deleted, so the files on disk stay within
//! about twice the byte budget plus one segment. The index log is rewritten
//! from the live records once it outgrows them by [`INDEX_COMPACT_FACTOR`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::arc::{Access, ArcParams, ArcPolicy};
use crate::cache::compressor::Compressor;
use crate::cache::entry::{CacheEntry, CacheKey, Tier};
use crate::cache::segment::{checksum, IndexLine, RecordLocation, SegmentAllocator, SegmentStore};
use crate::cache::stats::CacheStats;
use crate::config::{CompressionConfig, TierConfig};
use crate::error::{CacheError, Result};

pub const COMPACT_LIVE_RATIO: f64 = 0.5;
pub const INDEX_COMPACT_FACTOR: u64 = 4;
pub const INDEX_COMPACT_MIN_LINES: u64 = 1024;

#[derive(Debug, Clone)]
struct DiskRecord {
    location: RecordLocation,
    /// False until the payload write is confirmed.
    ready: bool,
    reservation: u64,
    created_at: Instant,
    access_count: u64,
}

struct DiskState {
    policy: ArcPolicy,
    records: HashMap<CacheKey, DiskRecord>,
    allocator: SegmentAllocator,
    next_seq: u64,
}

/// Side effects collected under the lock and applied after it is released.
#[derive(Default)]
struct Deferred {
    dead_segments: Vec<u64>,
    index: Vec<IndexLine>,
    evictions: usize,
}

impl DiskState {
    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Forget a record and release its bytes.
    fn drop_record(&mut self, key: &CacheKey, deferred: &mut Deferred) -> Option<DiskRecord> {
        let record = self.records.remove(key)?;
        if let Some(seg) = self
            .allocator
            .release(record.location.segment, record.location.stored_len)
        {
            deferred.dead_segments.push(seg);
        }
        if record.ready {
            let seq = self.next_seq();
            deferred.index.push(IndexLine {
                seq,
                key: key.clone(),
                location: None,
            });
        }
        Some(record)
    }

    /// One index line per confirmed record, oldest first.
    fn index_snapshot(&self) -> Vec<IndexLine> {
        let mut lines: Vec<IndexLine> = self
            .records
            .iter()
            .filter(|(_, r)| r.ready)
            .map(|(key, r)| IndexLine {
                seq: r.reservation,
                key: key.clone(),
                location: Some(r.location),
            })
            .collect();
        lines.sort_by_key(|line| line.seq);
        lines
    }
}

/// Result of reopening a persistent disk tier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReloadReport {
    pub restored: usize,
    /// Entries dropped because their payload failed validation.
    pub corrupted: Vec<CacheError>,
}

pub struct DiskTier {
    state: Mutex<DiskState>,
    store: SegmentStore,
    compressor: Compressor,
    stats: Arc<CacheStats>,
    corrupted: AtomicU64,
    compacting: AtomicBool,
    reload: ReloadReport,
}

impl DiskTier {
    /// Open the tier. With persistence enabled the index is replayed and
    /// every payload's checksum validated; corrupted entries are dropped.
    pub async fn open(
        tiers: &TierConfig,
        compression: &CompressionConfig,
        stats: Arc<CacheStats>,
    ) -> Result<Self> {
        let (store, live) = SegmentStore::open(&tiers.disk_path, tiers.disk_persistence).await?;

        let first_segment = live
            .iter()
            .filter_map(|line| line.location.map(|loc| loc.segment + 1))
            .max()
            .unwrap_or(0);

        let mut state = DiskState {
            policy: ArcPolicy::new(Tier::Disk, tiers.disk_capacity_bytes),
            records: HashMap::new(),
            allocator: SegmentAllocator::new(tiers.segment_size_bytes, first_segment),
            next_seq: 0,
        };

        let mut report = ReloadReport::default();
        let now = Instant::now();
        for line in live {
            let Some(location) = line.location else { continue };
            let verdict = match store.read_verified(&location).await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(reason)) => Err(reason),
                Err(e) => Err(e.to_string()),
            };
            if let Err(reason) = verdict {
                warn!(key = %line.key, reason = %reason, "Dropping corrupted disk entry");
                report.corrupted.push(CacheError::CorruptedEntry {
                    key: line.key.to_string(),
                    reason,
                });
                continue;
            }

            let admission = match state.policy.admit(line.key.clone(), location.stored_len) {
                Ok(admission) => admission,
                Err(e) => {
                    debug!(key = %line.key, error = %e, "Skipping reloaded entry");
                    continue;
                }
            };
            if admission.list.is_none() {
                continue;
            }
            for victim in admission.evicted {
                if let Some(old) = state.records.remove(&victim) {
                    state
                        .allocator
                        .release(old.location.segment, old.location.stored_len);
                    report.restored -= 1;
                }
            }
            state.allocator.restore(&location);
            let reservation = state.next_seq();
            state.records.insert(
                line.key.clone(),
                DiskRecord {
                    location,
                    ready: true,
                    reservation,
                    created_at: now,
                    access_count: 0,
                },
            );
            report.restored += 1;
        }

        // Compact the index and delete segments nothing points at.
        store.rewrite_index(&state.index_snapshot()).await?;

        let referenced: std::collections::HashSet<u64> =
            state.records.values().map(|r| r.location.segment).collect();
        for segment in store.segments_on_disk().await? {
            if !referenced.contains(&segment) {
                store.delete_segment(segment).await;
            } else if let Ok(len) = store.segment_len(segment).await {
                state.allocator.note_size(segment, len);
            }
        }

        if tiers.disk_persistence {
            info!(
                restored = report.restored,
                corrupted = report.corrupted.len(),
                path = %tiers.disk_path.display(),
                "Disk tier reloaded"
            );
        }

        stats.disk.publish(state.policy.params());
        let corrupted = report.corrupted.len() as u64;
        let tier = Self {
            state: Mutex::new(state),
            store,
            compressor: Compressor::new(compression.clone()),
            stats,
            corrupted: AtomicU64::new(corrupted),
            compacting: AtomicBool::new(false),
            reload: report,
        };
        tier.compact().await;
        Ok(tier)
    }

    pub fn reload_report(&self) -> &ReloadReport {
        &self.reload
    }

    /// Corrupted entries detected since open, reload included.
    pub fn corrupted_count(&self) -> u64 {
        self.corrupted.load(Ordering::Relaxed)
    }

    pub async fn capacity_bytes(&self) -> u64 {
        self.state.lock().await.policy.capacity()
    }

    pub async fn size_bytes(&self) -> u64 {
        self.state.lock().await.policy.resident_bytes()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Bytes allocated in segment files, live or dead.
    pub async fn segment_bytes(&self) -> u64 {
        self.state.lock().await.allocator.footprint()
    }

    pub async fn arc_params(&self) -> ArcParams {
        self.state.lock().await.policy.params()
    }

    pub async fn contains(&self, key: &CacheKey) -> bool {
        self.state
            .lock()
            .await
            .records
            .get(key)
            .is_some_and(|r| r.ready)
    }

    /// Store an entry evicted from memory.
    ///
    /// Fails with `TooLarge` when the stored payload exceeds the tier and
    /// with `DiskWriteFailed` when the I/O fails; in both cases the tier is
    /// left as if the put never happened.
    pub async fn put(&self, entry: CacheEntry) -> Result<()> {
        let (stored, compressed) = self
            .compressor
            .encode(&entry.payload)
            .map_err(|e| CacheError::DiskWriteFailed(e.to_string()))?;
        let stored_len = stored.len() as u64;

        // Reserve.
        let mut deferred = Deferred::default();
        let (location, reservation) = {
            let mut state = self.state.lock().await;
            let admission = state.policy.admit(entry.key.clone(), stored_len)?;
            if admission.list.is_none() {
                return Ok(());
            }
            deferred.evictions = admission.evicted.len();
            for victim in &admission.evicted {
                state.drop_record(victim, &mut deferred);
                debug!(key = %victim, "Evicted from disk");
            }
            // An overwrite replaces the old record.
            state.drop_record(&entry.key, &mut deferred);

            let ((segment, offset), sealed_dead) = state.allocator.allocate(stored_len);
            deferred.dead_segments.extend(sealed_dead);
            let location = RecordLocation {
                segment,
                offset,
                stored_len,
                raw_len: entry.size_bytes,
                checksum: checksum(&stored),
                compressed,
            };
            let reservation = state.next_seq();
            state.records.insert(
                entry.key.clone(),
                DiskRecord {
                    location,
                    ready: false,
                    reservation,
                    created_at: entry.created_at,
                    access_count: entry.access_count,
                },
            );
            self.stats.disk.publish(state.policy.params());
            (location, reservation)
        };
        self.apply(deferred).await;

        // Write.
        let written = self.store.write_at(&location, &stored).await;

        // Confirm or roll back.
        let mut deferred = Deferred::default();
        let outcome = {
            let mut state = self.state.lock().await;
            if let Some(seg) = state.allocator.finish_write(location.segment) {
                deferred.dead_segments.push(seg);
            }
            let ours = state
                .records
                .get(&entry.key)
                .is_some_and(|r| r.reservation == reservation);
            match written {
                Ok(()) if ours => {
                    let seq = state.next_seq();
                    if let Some(record) = state.records.get_mut(&entry.key) {
                        record.ready = true;
                    }
                    deferred.index.push(IndexLine {
                        seq,
                        key: entry.key.clone(),
                        location: Some(location),
                    });
                    Ok(())
                }
                // Evicted or overwritten while the write was in flight.
                Ok(()) => Ok(()),
                Err(e) => {
                    if ours {
                        state.policy.remove(&entry.key);
                        state.drop_record(&entry.key, &mut deferred);
                        self.stats.disk.publish(state.policy.params());
                    }
                    Err(CacheError::DiskWriteFailed(e.to_string()))
                }
            }
        };
        self.apply(deferred).await;
        self.compact().await;

        if outcome.is_ok() {
            debug!(key = %entry.key, bytes = stored_len, compressed, "Stored on disk");
        }
        outcome
    }

    /// Read an entry without moving it. Counts as an access.
    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let record = {
            let mut state = self.state.lock().await;
            let record = state.records.get(key).filter(|r| r.ready).cloned()?;
            if let Access::Hit { .. } = state.policy.access(key) {
                if let Some(r) = state.records.get_mut(key) {
                    r.access_count += 1;
                }
            }
            record
        };
        self.read(key, &record).await.map(Bytes::from)
    }

    /// Read an entry and remove it from the tier so it can be promoted.
    /// The key stays behind as a ghost.
    pub async fn take(&self, key: &CacheKey) -> Option<CacheEntry> {
        let record = {
            let mut state = self.state.lock().await;
            let record = state.records.get(key).filter(|r| r.ready).cloned()?;
            state.policy.access(key);
            record
        };

        let payload = self.read(key, &record).await?;

        let mut deferred = Deferred::default();
        {
            let mut state = self.state.lock().await;
            let still_ours = state
                .records
                .get(key)
                .is_some_and(|r| r.reservation == record.reservation);
            if !still_ours {
                return None;
            }
            state.policy.retire(key);
            state.drop_record(key, &mut deferred);
            self.stats.disk.publish(state.policy.params());
        }
        self.apply(deferred).await;
        self.compact().await;

        let now = Instant::now();
        Some(CacheEntry {
            key: key.clone(),
            size_bytes: payload.len() as u64,
            payload: Bytes::from(payload),
            tier: Tier::Disk,
            created_at: record.created_at,
            last_accessed_at: now,
            access_count: record.access_count + 1,
        })
    }

    /// Drop a key and its ghost history.
    pub async fn remove(&self, key: &CacheKey) -> bool {
        let mut deferred = Deferred::default();
        let removed = {
            let mut state = self.state.lock().await;
            state.policy.remove(key);
            let removed = state.drop_record(key, &mut deferred).is_some();
            self.stats.disk.publish(state.policy.params());
            removed
        };
        self.apply(deferred).await;
        self.compact().await;
        removed
    }

    /// Remove every key starting with `prefix`. Returns the resident ones removed.
    pub async fn remove_prefix(&self, prefix: &[u8]) -> Vec<CacheKey> {
        let mut deferred = Deferred::default();
        let mut removed = Vec::new();
        {
            let mut state = self.state.lock().await;
            for key in state.policy.keys_with_prefix(prefix) {
                state.policy.remove(&key);
                if state.drop_record(&key, &mut deferred).is_some() {
                    removed.push(key);
                }
            }
            self.stats.disk.publish(state.policy.params());
        }
        self.apply(deferred).await;
        self.compact().await;
        removed
    }

    pub async fn check_invariants(&self) -> bool {
        let state = self.state.lock().await;
        state.policy.check_invariants() && state.policy.resident_len() == state.records.len()
    }

    /// Read and decode a record outside the lock. A bad payload whose record
    /// is still current is dropped and reported; one that was replaced while
    /// we were reading is simply a miss.
    async fn read(&self, key: &CacheKey, record: &DiskRecord) -> Option<Vec<u8>> {
        let failure = match self.store.read_verified(&record.location).await {
            Ok(Ok(stored)) => {
                match self
                    .compressor
                    .decode(stored, record.location.compressed, record.location.raw_len)
                {
                    Ok(payload) => return Some(payload),
                    Err(e) => e.to_string(),
                }
            }
            Ok(Err(reason)) => reason,
            Err(e) => e.to_string(),
        };

        let mut deferred = Deferred::default();
        {
            let mut state = self.state.lock().await;
            let current = state
                .records
                .get(key)
                .is_some_and(|r| r.reservation == record.reservation);
            if !current {
                return None;
            }
            state.policy.remove(key);
            state.drop_record(key, &mut deferred);
            self.stats.disk.publish(state.policy.params());
        }
        self.apply(deferred).await;

        self.corrupted.fetch_add(1, Ordering::Relaxed);
        warn!(
            key = %key,
            error = %CacheError::CorruptedEntry { key: key.to_string(), reason: failure },
            "Dropped unreadable disk entry"
        );
        None
    }

    async fn apply(&self, deferred: Deferred) {
        if deferred.evictions > 0 {
            self.stats.disk.record_evictions(deferred.evictions);
        }
        for segment in deferred.dead_segments {
            self.store.delete_segment(segment).await;
        }
        if deferred.index.is_empty() {
            return;
        }
        if let Err(e) = self.store.append_index(&deferred.index).await {
            warn!(error = %e, "Failed to append to disk index");
        }
        self.compact_index().await;
    }

    // ─── Compaction ────────────────────────────────────────────────────────

    /// Rewrite the index log from the live records once superseded lines
    /// dominate it. Skipped while another rewrite or append holds the log.
    async fn compact_index(&self) {
        let (rewrite, lines) = {
            let state = self.state.lock().await;
            let live = state.records.values().filter(|r| r.ready).count() as u64;
            let limit = (live * INDEX_COMPACT_FACTOR).max(INDEX_COMPACT_MIN_LINES);
            if self.store.index_lines() <= limit {
                return;
            }
            // Taken under the tier lock so no line confirmed after the
            // snapshot can be appended before the rewrite lands.
            let Some(rewrite) = self.store.try_begin_rewrite() else {
                return;
            };
            (rewrite, state.index_snapshot())
        };

        let before = self.store.index_lines();
        match rewrite.commit(&lines).await {
            Ok(()) => debug!(before, after = lines.len(), "Compacted disk index"),
            Err(e) => warn!(error = %e, "Failed to compact disk index"),
        }
    }

    /// Move live records out of mostly dead sealed segments until none is
    /// left below [`COMPACT_LIVE_RATIO`]. One pass runs at a time.
    async fn compact(&self) {
        if self.compacting.swap(true, Ordering::AcqRel) {
            return;
        }
        loop {
            let candidate = self
                .state
                .lock()
                .await
                .allocator
                .compaction_candidate(COMPACT_LIVE_RATIO);
            let Some(segment) = candidate else { break };
            if !self.compact_segment(segment).await {
                break;
            }
        }
        self.compacting.store(false, Ordering::Release);
    }

    /// Returns false when compaction should stop for now.
    async fn compact_segment(&self, segment: u64) -> bool {
        let records: Vec<(CacheKey, DiskRecord)> = {
            let state = self.state.lock().await;
            state
                .records
                .iter()
                .filter(|(_, r)| r.ready && r.location.segment == segment)
                .map(|(k, r)| (k.clone(), r.clone()))
                .collect()
        };
        if records.is_empty() {
            warn!(segment, "Compaction candidate has no live records");
            return false;
        }

        debug!(segment, records = records.len(), "Compacting segment");
        for (key, record) in records {
            if !self.relocate(&key, &record).await {
                return false;
            }
        }
        true
    }

    /// Copy one record's stored bytes into the active segment and repoint
    /// it. The old copy stays readable until the move is confirmed.
    async fn relocate(&self, key: &CacheKey, record: &DiskRecord) -> bool {
        let stored = match self.store.read_verified(&record.location).await {
            Ok(Ok(stored)) => stored,
            _ => {
                // Let the read path drop and report it.
                self.read(key, record).await;
                return false;
            }
        };

        let mut deferred = Deferred::default();
        let (location, reservation) = {
            let mut state = self.state.lock().await;
            let current = state
                .records
                .get(key)
                .is_some_and(|r| r.reservation == record.reservation);
            if !current {
                return true;
            }
            let ((segment, offset), sealed_dead) = state.allocator.allocate(record.location.stored_len);
            deferred.dead_segments.extend(sealed_dead);
            let location = RecordLocation {
                segment,
                offset,
                ..record.location
            };
            (location, state.next_seq())
        };
        self.apply(deferred).await;

        let written = self.store.write_at(&location, &stored).await;

        let mut deferred = Deferred::default();
        {
            let mut state = self.state.lock().await;
            if let Some(seg) = state.allocator.finish_write(location.segment) {
                deferred.dead_segments.push(seg);
            }
            let current = state
                .records
                .get(key)
                .is_some_and(|r| r.reservation == record.reservation);
            let moved = written.is_ok() && current;
            let release = if moved {
                if let Some(r) = state.records.get_mut(key) {
                    r.location = location;
                    r.reservation = reservation;
                }
                let seq = state.next_seq();
                deferred.index.push(IndexLine {
                    seq,
                    key: key.clone(),
                    location: Some(location),
                });
                record.location
            } else {
                location
            };
            if let Some(seg) = state.allocator.release(release.segment, release.stored_len) {
                deferred.dead_segments.push(seg);
            }
            if moved {
                debug!(
                    key = %key,
                    from = record.location.segment,
                    to = location.segment,
                    footprint = state.allocator.footprint(),
                    "Relocated disk record"
                );
            }
        }
        self.apply(deferred).await;

        match written {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %key, error = %e, "Compaction write failed");
                false
            }
        }
    }
}
