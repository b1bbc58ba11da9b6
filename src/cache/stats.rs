//! Lock-free statistics counters and the dashboard-facing snapshot.
//!
//! Counters are plain atomics updated on the hot path with `Relaxed`
//! ordering. A snapshot may be slightly stale; it is never authoritative.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::cache::arc::ArcParams;

const WINDOW_MINUTES: u64 = 60;

/// `num / den` clamped to `[0, 1]`, or 0 when nothing was counted.
pub fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        return 0.0;
    }
    (num as f64 / den as f64).clamp(0.0, 1.0)
}

/// Evictions in the trailing hour, kept in one-minute buckets.
pub struct EvictionWindow {
    started: Instant,
    minutes: [AtomicU64; WINDOW_MINUTES as usize],
    counts: [AtomicU64; WINDOW_MINUTES as usize],
    total: AtomicU64,
}

impl EvictionWindow {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            minutes: std::array::from_fn(|_| AtomicU64::new(u64::MAX)),
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            total: AtomicU64::new(0),
        }
    }

    fn current_minute(&self) -> u64 {
        self.started.elapsed().as_secs() / 60
    }

    pub fn record(&self, n: u64) {
        self.record_at(self.current_minute(), n);
    }

    fn record_at(&self, minute: u64, n: u64) {
        if n == 0 {
            return;
        }
        let slot = (minute % WINDOW_MINUTES) as usize;
        // A racing reset may lose a few counts; the window is approximate.
        if self.minutes[slot].swap(minute, Ordering::Relaxed) != minute {
            self.counts[slot].store(0, Ordering::Relaxed);
        }
        self.counts[slot].fetch_add(n, Ordering::Relaxed);
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn last_hour(&self) -> u64 {
        self.last_hour_at(self.current_minute())
    }

    fn last_hour_at(&self, now: u64) -> u64 {
        (0..WINDOW_MINUTES as usize)
            .filter(|&slot| {
                let minute = self.minutes[slot].load(Ordering::Relaxed);
                minute != u64::MAX && minute <= now && now - minute < WINDOW_MINUTES
            })
            .map(|slot| self.counts[slot].load(Ordering::Relaxed))
            .sum()
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl Default for EvictionWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for one byte tier.
#[derive(Default)]
pub struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    size_bytes: AtomicU64,
    item_count: AtomicU64,
    evictions: EvictionWindow,
    arc: [AtomicU64; 10],
}

impl TierCounters {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, n: usize) {
        self.evictions.record(n as u64);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Publish the tier's structural state. Called with the tier lock held
    /// so the published values are a consistent set.
    pub fn publish(&self, params: ArcParams) {
        self.size_bytes
            .store(params.t1_bytes + params.t2_bytes, Ordering::Relaxed);
        self.item_count
            .store((params.t1_len + params.t2_len) as u64, Ordering::Relaxed);
        let values = [
            params.capacity_bytes,
            params.p_bytes,
            params.t1_len as u64,
            params.t2_len as u64,
            params.b1_len as u64,
            params.b2_len as u64,
            params.t1_bytes,
            params.t2_bytes,
            params.b1_bytes,
            params.b2_bytes,
        ];
        for (slot, value) in self.arc.iter().zip(values) {
            slot.store(value, Ordering::Relaxed);
        }
    }

    pub fn arc_params(&self) -> ArcParams {
        let v: Vec<u64> = self.arc.iter().map(|a| a.load(Ordering::Relaxed)).collect();
        ArcParams {
            capacity_bytes: v[0],
            p_bytes: v[1],
            t1_len: v[2] as usize,
            t2_len: v[3] as usize,
            b1_len: v[4] as usize,
            b2_len: v[5] as usize,
            t1_bytes: v[6],
            t2_bytes: v[7],
            b1_bytes: v[8],
            b2_bytes: v[9],
        }
    }

    pub fn snapshot(&self) -> TierStats {
        let hits = self.hits();
        TierStats {
            hit_rate: ratio(hits, hits + self.misses()),
            size_bytes: self.size_bytes.load(Ordering::Relaxed),
            item_count: self.item_count.load(Ordering::Relaxed),
            evictions_per_hour: self.evictions.last_hour() as f64,
        }
    }
}

/// Prefetch outcome counters.
#[derive(Default)]
pub struct PrefetchCounters {
    /// Keys fetched and admitted by prefetch workers.
    pub prefetched: AtomicU64,
    /// Prefetched keys accessed within the hit TTL.
    pub consumed_in_ttl: AtomicU64,
    /// Prefetched keys accessed before they were evicted.
    pub consumed: AtomicU64,
    /// Prefetched keys evicted or expired without an access.
    pub wasted: AtomicU64,
    /// Candidates dropped on queue overflow.
    pub dropped: AtomicU64,
    /// Candidates skipped because they were already resident.
    pub skipped_resident: AtomicU64,
    pub failed: AtomicU64,
}

impl PrefetchCounters {
    pub fn snapshot(&self) -> PrefetchStats {
        let consumed = self.consumed.load(Ordering::Relaxed);
        let wasted = self.wasted.load(Ordering::Relaxed);
        PrefetchStats {
            predictive_accuracy: ratio(
                self.consumed_in_ttl.load(Ordering::Relaxed),
                self.prefetched.load(Ordering::Relaxed),
            ),
            prefetch_efficiency: ratio(consumed, consumed + wasted),
        }
    }
}

/// Semantic cache counters.
#[derive(Default)]
pub struct SemanticCounters {
    pub exact_matches: AtomicU64,
    pub similarity_matches: AtomicU64,
    pub misses: AtomicU64,
    pub dimension_mismatches: AtomicU64,
    similarity_sum_micros: AtomicU64,
    entries: AtomicU64,
    capacity: AtomicU64,
}

impl SemanticCounters {
    pub fn record_match(&self, exact: bool, similarity: f64) {
        if exact {
            self.exact_matches.fetch_add(1, Ordering::Relaxed);
        } else {
            self.similarity_matches.fetch_add(1, Ordering::Relaxed);
        }
        let micros = (similarity.clamp(0.0, 1.0) * 1_000_000.0).round() as u64;
        self.similarity_sum_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn publish(&self, entries: usize, capacity: usize) {
        self.entries.store(entries as u64, Ordering::Relaxed);
        self.capacity.store(capacity as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, model_name: &str, threshold: f64) -> SemanticStats {
        let exact = self.exact_matches.load(Ordering::Relaxed);
        let similar = self.similarity_matches.load(Ordering::Relaxed);
        let matches = exact + similar;
        let entries = self.entries.load(Ordering::Relaxed);
        let average_similarity = if matches == 0 {
            0.0
        } else {
            self.similarity_sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0 / matches as f64
        };
        SemanticStats {
            embedding_model_name: model_name.to_string(),
            similarity_threshold: threshold,
            cache_entries: entries,
            exact_matches: exact,
            similarity_matches: similar,
            cache_utilization: ratio(entries, self.capacity.load(Ordering::Relaxed)),
            average_similarity,
        }
    }
}

/// All counters of one coordinator.
#[derive(Default)]
pub struct CacheStats {
    pub memory: TierCounters,
    pub disk: TierCounters,
    pub prefetch: PrefetchCounters,
    pub semantic: SemanticCounters,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, model_name: &str, threshold: f64) -> StatsSnapshot {
        StatsSnapshot {
            memory: self.memory.snapshot(),
            disk: self.disk.snapshot(),
            prefetcher: self.prefetch.snapshot(),
            semantic_cache: self.semantic.snapshot(model_name, threshold),
            arc: ArcSnapshot {
                memory: self.memory.arc_params(),
                disk: self.disk.arc_params(),
            },
        }
    }
}

// ─── Snapshot (dashboard schema) ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub memory: TierStats,
    pub disk: TierStats,
    pub prefetcher: PrefetchStats,
    pub semantic_cache: SemanticStats,
    pub arc: ArcSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierStats {
    /// hits / (hits + misses), in `[0, 1]`.
    pub hit_rate: f64,
    pub size_bytes: u64,
    pub item_count: u64,
    /// Evictions in the trailing 60 minutes.
    pub evictions_per_hour: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrefetchStats {
    pub predictive_accuracy: f64,
    pub prefetch_efficiency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SemanticStats {
    pub embedding_model_name: String,
    pub similarity_threshold: f64,
    pub cache_entries: u64,
    pub exact_matches: u64,
    pub similarity_matches: u64,
    pub cache_utilization: f64,
    pub average_similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArcSnapshot {
    pub memory: ArcParams,
    pub disk: ArcParams,
}
