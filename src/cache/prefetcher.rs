//! Predictive prefetcher.
//!
//! ```text
//!   get() ──try_send──▶ events ──▶ scheduler task ──▶ PrefetchQueue ──▶ workers
//!                                   │ AccessTracker                     │ FetchGroup::prefetch
//!                                   │ PrefetchPlanner                   │ (single-flight, admits)
//!                                   └ accuracy ledger ◀── Prefetched ───┘
//! ```
//!
//! The scheduler scans on a fixed interval or after enough accesses,
//! whichever comes first. Event sends from the hot path never block; a full
//! channel drops the event.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::entry::CacheKey;
use crate::cache::inflight::{FetchGroup, Fetched};
use crate::cache::stats::CacheStats;
use crate::cache::tiers::TieredStore;
use crate::cache::tracker::AccessTracker;
use crate::config::{PrefetchConfig, TrackerConfig};

/// Messages from the cache to the scheduler task.
#[derive(Debug, Clone)]
pub enum PrefetchEvent {
    Access { key: CacheKey, at: Instant },
    /// Left the memory tier.
    Evicted(CacheKey),
    /// A worker admitted a prefetched key.
    Prefetched { key: CacheKey, at: Instant },
    Invalidated(CacheKey),
    InvalidatedPrefix(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchReason {
    /// Usually accessed shortly after `source`.
    CoAccess,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchCandidate {
    pub key: CacheKey,
    pub score: f64,
    pub reason: PrefetchReason,
    pub source: CacheKey,
}

// ─── Planner ───────────────────────────────────────────────────────────────

/// Ranks what is likely to be accessed next.
#[derive(Debug, Clone)]
pub struct PrefetchPlanner {
    top_k: usize,
}

impl PrefetchPlanner {
    pub fn new(top_k: usize) -> Self {
        Self { top_k }
    }

    /// For every recently accessed source, score its followers by
    /// `score(follower) × co-access count` and keep the top K.
    pub fn plan(
        &self,
        tracker: &AccessTracker,
        sources: &HashSet<CacheKey>,
        now: Instant,
    ) -> Vec<PrefetchCandidate> {
        let mut best: HashMap<CacheKey, PrefetchCandidate> = HashMap::new();
        for source in sources {
            for (follower, count) in tracker.followers(source) {
                if follower == source {
                    continue;
                }
                let score = tracker.score(follower, now) * count as f64;
                if score <= 0.0 {
                    continue;
                }
                let better = best.get(follower).map_or(true, |c| score > c.score);
                if better {
                    best.insert(
                        follower.clone(),
                        PrefetchCandidate {
                            key: follower.clone(),
                            score,
                            reason: PrefetchReason::CoAccess,
                            source: source.clone(),
                        },
                    );
                }
            }
        }

        let mut candidates: Vec<PrefetchCandidate> = best.into_values().collect();
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.key.cmp(&b.key)));
        candidates.truncate(self.top_k);
        candidates
    }
}

// ─── Queue ─────────────────────────────────────────────────────────────────

/// Bounded work queue ordered by score, highest first.
#[derive(Debug)]
pub struct PrefetchQueue {
    items: VecDeque<PrefetchCandidate>,
    depth: usize,
}

impl PrefetchQueue {
    pub fn new(depth: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(depth),
            depth: depth.max(1),
        }
    }

    /// Enqueue a candidate. A key already queued keeps its higher score.
    /// Returns the candidate dropped on overflow, which is always the
    /// lowest-scored one (possibly `candidate` itself).
    pub fn push(&mut self, candidate: PrefetchCandidate) -> Option<PrefetchCandidate> {
        if let Some(pos) = self.items.iter().position(|c| c.key == candidate.key) {
            if self.items[pos].score >= candidate.score {
                return None;
            }
            self.items.remove(pos);
        }

        let pos = self
            .items
            .iter()
            .position(|existing| existing.score < candidate.score)
            .unwrap_or(self.items.len());

        debug!(key = %candidate.key, score = candidate.score, "Queued prefetch");
        self.items.insert(pos, candidate);

        if self.items.len() > self.depth {
            self.items.pop_back()
        } else {
            None
        }
    }

    pub fn pop(&mut self) -> Option<PrefetchCandidate> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn cancel(&mut self, key: &CacheKey) -> bool {
        let before = self.items.len();
        self.items.retain(|c| &c.key != key);
        before != self.items.len()
    }

    /// Drop queued candidates whose key starts with `prefix`.
    pub fn cancel_prefix(&mut self, prefix: &[u8]) -> usize {
        let before = self.items.len();
        self.items.retain(|c| !c.key.starts_with(prefix));
        before - self.items.len()
    }
}

// ─── Accuracy ledger ───────────────────────────────────────────────────────

/// Outstanding prefetched keys, waiting to be consumed or evicted.
struct Ledger {
    hit_ttl: Duration,
    outstanding: HashMap<CacheKey, Instant>,
}

impl Ledger {
    fn on_prefetched(&mut self, key: CacheKey, at: Instant) {
        self.outstanding.insert(key, at);
    }

    fn on_access(&mut self, key: &CacheKey, at: Instant, stats: &CacheStats) {
        if let Some(prefetched_at) = self.outstanding.remove(key) {
            stats.prefetch.consumed.fetch_add(1, Ordering::Relaxed);
            if at.saturating_duration_since(prefetched_at) <= self.hit_ttl {
                stats.prefetch.consumed_in_ttl.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn on_evicted(&mut self, key: &CacheKey, stats: &CacheStats) {
        if self.outstanding.remove(key).is_some() {
            stats.prefetch.wasted.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn forget(&mut self, key: &CacheKey) {
        self.outstanding.remove(key);
    }

    fn forget_prefix(&mut self, prefix: &[u8]) {
        self.outstanding.retain(|k, _| !k.starts_with(prefix));
    }
}

// ─── Runtime ───────────────────────────────────────────────────────────────

/// Everything the scheduler and workers share with the coordinator.
pub struct PrefetchContext {
    pub prefetch: PrefetchConfig,
    pub tracker: TrackerConfig,
    pub store: Arc<TieredStore>,
    /// Single-flight fetches shared with `get`.
    pub fetches: Arc<FetchGroup>,
    pub stats: Arc<CacheStats>,
}

/// Handle to the running scheduler and worker pool.
pub struct Prefetcher {
    queue: Arc<Mutex<PrefetchQueue>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Prefetcher {
    /// Start the scheduler and the worker pool on the current runtime.
    pub fn spawn(
        ctx: PrefetchContext,
        events: mpsc::Receiver<PrefetchEvent>,
        events_tx: mpsc::Sender<PrefetchEvent>,
    ) -> Self {
        let queue = Arc::new(Mutex::new(PrefetchQueue::new(ctx.prefetch.prefetch_queue_depth)));
        let work = Arc::new(Notify::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let ctx = Arc::new(ctx);

        let mut tasks = Vec::with_capacity(ctx.prefetch.prefetch_worker_count + 1);
        for worker in 0..ctx.prefetch.prefetch_worker_count {
            tasks.push(tokio::spawn(run_worker(
                worker,
                ctx.clone(),
                queue.clone(),
                work.clone(),
                events_tx.clone(),
                shutdown_rx.clone(),
            )));
        }
        tasks.push(tokio::spawn(run_scheduler(
            ctx.clone(),
            events,
            queue.clone(),
            work,
            shutdown_rx,
        )));

        info!(
            workers = ctx.prefetch.prefetch_worker_count,
            interval_ms = ctx.prefetch.prefetch_interval_ms,
            queue_depth = ctx.prefetch.prefetch_queue_depth,
            "Prefetcher started"
        );

        Self {
            queue,
            shutdown,
            tasks: Mutex::new(tasks),
        }
    }

    /// Drop queued work for an invalidated key.
    pub async fn cancel(&self, key: &CacheKey) -> bool {
        self.queue.lock().await.cancel(key)
    }

    pub async fn cancel_prefix(&self, prefix: &[u8]) -> usize {
        self.queue.lock().await.cancel_prefix(prefix)
    }

    /// Stop the scheduler and workers and wait for them to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Prefetch task ended abnormally");
            }
        }
    }
}

async fn run_scheduler(
    ctx: Arc<PrefetchContext>,
    mut events: mpsc::Receiver<PrefetchEvent>,
    queue: Arc<Mutex<PrefetchQueue>>,
    work: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tracker = AccessTracker::new(&ctx.tracker);
    let planner = PrefetchPlanner::new(ctx.prefetch.top_k);
    let mut ledger = Ledger {
        hit_ttl: Duration::from_millis(ctx.prefetch.hit_ttl_ms),
        outstanding: HashMap::new(),
    };
    let reap_ttl = Duration::from_secs(ctx.tracker.reap_ttl_seconds);
    let trigger = ctx.prefetch.trigger_after_accesses.max(1);
    let mut since_scan = 0u64;

    let mut ticker = tokio::time::interval(Duration::from_millis(ctx.prefetch.prefetch_interval_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let scan = tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => true,
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    PrefetchEvent::Access { key, at } => {
                        tracker.record_access(&key, at);
                        ledger.on_access(&key, at, &ctx.stats);
                        since_scan += 1;
                    }
                    PrefetchEvent::Evicted(key) => ledger.on_evicted(&key, &ctx.stats),
                    PrefetchEvent::Prefetched { key, at } => ledger.on_prefetched(key, at),
                    PrefetchEvent::Invalidated(key) => ledger.forget(&key),
                    PrefetchEvent::InvalidatedPrefix(prefix) => ledger.forget_prefix(&prefix),
                }
                since_scan >= trigger
            }
        };
        if !scan {
            continue;
        }
        since_scan = 0;

        let now = Instant::now();
        tracker.reap(now);
        // Prefetches nobody touched for a full reap period are written off.
        let before = ledger.outstanding.len();
        ledger
            .outstanding
            .retain(|_, at| now.saturating_duration_since(*at) <= reap_ttl);
        let expired = (before - ledger.outstanding.len()) as u64;
        if expired > 0 {
            ctx.stats.prefetch.wasted.fetch_add(expired, Ordering::Relaxed);
        }

        let sources = tracker.take_sources();
        if sources.is_empty() {
            continue;
        }
        let candidates = planner.plan(&tracker, &sources, now);
        if candidates.is_empty() {
            continue;
        }

        let mut queued = 0;
        {
            let mut queue = queue.lock().await;
            for candidate in candidates {
                queued += 1;
                if let Some(dropped) = queue.push(candidate) {
                    debug!(key = %dropped.key, score = dropped.score, "Prefetch queue full, dropped candidate");
                    ctx.stats.prefetch.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        for _ in 0..queued {
            work.notify_one();
        }
        debug!(sources = sources.len(), queued, "Prefetch scan complete");
    }
    debug!("Prefetch scheduler stopped");
}

async fn run_worker(
    worker: usize,
    ctx: Arc<PrefetchContext>,
    queue: Arc<Mutex<PrefetchQueue>>,
    work: Arc<Notify>,
    events: mpsc::Sender<PrefetchEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = queue.lock().await.pop();
        let Some(candidate) = next else {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = work.notified() => {}
            }
            continue;
        };
        if *shutdown.borrow() {
            break;
        }

        let key = candidate.key;
        if ctx.store.contains(&key).await {
            ctx.stats.prefetch.skipped_resident.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        match ctx.fetches.prefetch(key.clone()).await {
            None => {
                ctx.stats.prefetch.skipped_resident.fetch_add(1, Ordering::Relaxed);
                debug!(worker, key = %key, "Already being fetched");
            }
            Some(Ok(Fetched { value: Some(_), cached: true })) => {
                ctx.stats.prefetch.prefetched.fetch_add(1, Ordering::Relaxed);
                debug!(worker, key = %key, score = candidate.score, source = %candidate.source, "Prefetched");
                let _ = events
                    .send(PrefetchEvent::Prefetched {
                        key,
                        at: Instant::now(),
                    })
                    .await;
            }
            Some(Ok(Fetched { value: Some(_), cached: false })) => {
                debug!(worker, key = %key, "Prefetched value not cached");
            }
            Some(Ok(Fetched { value: None, .. })) => {
                ctx.stats.prefetch.failed.fetch_add(1, Ordering::Relaxed);
                debug!(worker, key = %key, "Prefetch candidate not found in backend");
            }
            Some(Err(e)) => {
                ctx.stats.prefetch.failed.fetch_add(1, Ordering::Relaxed);
                warn!(worker, key = %key, error = %e, "Prefetch fetch failed");
            }
        }
    }
    debug!(worker, "Prefetch worker stopped");
}
