//! The cache façade: one instance per process, passed to every caller.
//!
//! `get` walks memory → disk → semantic (when the query is eligible) →
//! backend. Backend fetches go through a [`FetchGroup`] shared with the
//! prefetch workers, so concurrent misses on one key share a single call.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::backend::{Backend, Embedder};
use crate::cache::disk::DiskTier;
use crate::cache::entry::CacheKey;
use crate::cache::inflight::FetchGroup;
use crate::cache::memory::MemoryTier;
use crate::cache::prefetcher::{PrefetchContext, PrefetchEvent, Prefetcher};
use crate::cache::semantic::{SemanticCache, SemanticHit, SemanticPayload};
use crate::cache::stats::{CacheStats, StatsSnapshot};
use crate::cache::tiers::TieredStore;
use crate::config::Config;
use crate::error::{CacheError, Result};

/// How a semantic-eligible query is described.
#[derive(Debug, Clone, PartialEq)]
pub enum SemanticQuery {
    Embedding(Vec<f32>),
    /// Embedded through the configured [`Embedder`].
    Text(String),
}

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Upper bound on the backend fetch on a miss.
    pub timeout: Option<Duration>,
    /// Marks the query as tolerant of near-duplicate matches.
    pub semantic: Option<SemanticQuery>,
}

impl GetOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_semantic(mut self, query: SemanticQuery) -> Self {
        self.semantic = Some(query);
        self
    }
}

pub struct Coordinator {
    config: Config,
    store: Arc<TieredStore>,
    semantic: Mutex<SemanticCache>,
    embedder: Option<Arc<dyn Embedder>>,
    stats: Arc<CacheStats>,
    fetches: Arc<FetchGroup>,
    events: Option<mpsc::Sender<PrefetchEvent>>,
    prefetcher: Option<Prefetcher>,
}

impl Coordinator {
    /// Validate the configuration, open the tiers and start the prefetcher.
    pub async fn new(config: Config, backend: Arc<dyn Backend>) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(CacheStats::new());

        let (events, events_rx) = if config.prefetch.enabled {
            let (tx, rx) = mpsc::channel(config.prefetch.event_buffer);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let disk = if config.tiers.disk_capacity_bytes > 0 {
            Some(DiskTier::open(&config.tiers, &config.compression, stats.clone()).await?)
        } else {
            None
        };
        let store = Arc::new(TieredStore::new(
            MemoryTier::new(config.tiers.memory_capacity_bytes),
            disk,
            stats.clone(),
            events.clone(),
        ));
        let fetches = Arc::new(FetchGroup::new(backend, store.clone()));

        let prefetcher = match (&events, events_rx) {
            (Some(tx), Some(rx)) => Some(Prefetcher::spawn(
                PrefetchContext {
                    prefetch: config.prefetch.clone(),
                    tracker: config.tracker.clone(),
                    store: store.clone(),
                    fetches: fetches.clone(),
                    stats: stats.clone(),
                },
                rx,
                tx.clone(),
            )),
            _ => None,
        };

        let semantic = SemanticCache::new(&config.semantic);
        stats.semantic.publish(0, semantic.capacity());

        info!(
            memory_bytes = config.tiers.memory_capacity_bytes,
            disk_bytes = config.tiers.disk_capacity_bytes,
            disk_path = %config.tiers.disk_path.display(),
            prefetch = config.prefetch.enabled,
            "Cache coordinator started"
        );

        Ok(Self {
            config,
            store,
            semantic: Mutex::new(semantic),
            embedder: None,
            stats,
            fetches,
            events,
            prefetcher,
        })
    }

    /// Use `embedder` for [`SemanticQuery::Text`] queries.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Look up `key`, fetching from the backend on a miss.
    ///
    /// `Ok(None)` means the backend has no content for the key. Backend
    /// failures and timeouts are returned as errors and never cached.
    pub async fn get(&self, key: impl Into<CacheKey>, opts: GetOptions) -> Result<Option<Bytes>> {
        let key = key.into();
        self.record_access(&key);

        if let Some((payload, tier)) = self.store.lookup(&key).await {
            debug!(key = %key, tier = %tier, "Cache hit");
            return Ok(Some(payload));
        }

        let mut embedding = None;
        if let Some(query) = opts.semantic {
            embedding = self.resolve_embedding(query).await?;
            if let Some((payload, similarity)) = self.semantic_lookup(&key, embedding.as_deref()).await {
                debug!(key = %key, similarity, "Semantic hit");
                return Ok(Some(payload));
            }
        }

        let fetched = self.fetches.fetch(key.clone(), opts.timeout).await?;
        if let (Some(value), Some(embedding), true) = (&fetched.value, embedding, fetched.cached) {
            self.semantic_insert(key, embedding, value.clone()).await;
        }
        Ok(fetched.value)
    }

    /// Insert a value. Fails with `TooLarge` when it exceeds the memory tier.
    pub async fn put(&self, key: impl Into<CacheKey>, value: Bytes) -> Result<()> {
        let key = key.into();
        // A fetch already in flight must not overwrite this value.
        self.fetches.invalidate(&key).await;
        {
            let mut semantic = self.semantic.lock().await;
            if semantic.remove(&key) {
                self.stats.semantic.publish(semantic.len(), semantic.capacity());
            }
        }
        self.store.admit(key, value).await
    }

    /// Drop `key` from every tier and the semantic cache.
    pub async fn invalidate(&self, key: impl Into<CacheKey>) -> bool {
        let key = key.into();
        self.fetches.invalidate(&key).await;

        let removed = self.store.remove(&key).await;
        {
            let mut semantic = self.semantic.lock().await;
            semantic.remove(&key);
            self.stats.semantic.publish(semantic.len(), semantic.capacity());
        }
        if let Some(prefetcher) = &self.prefetcher {
            prefetcher.cancel(&key).await;
        }
        self.notify(PrefetchEvent::Invalidated(key.clone()));

        debug!(key = %key, removed, "Invalidated");
        removed
    }

    /// Drop every key starting with `prefix`. Returns how many resident entries went.
    pub async fn invalidate_prefix(&self, prefix: impl AsRef<[u8]>) -> usize {
        let prefix = prefix.as_ref();
        self.fetches.invalidate_prefix(prefix).await;

        let removed = self.store.remove_prefix(prefix).await;
        {
            let mut semantic = self.semantic.lock().await;
            semantic.remove_prefix(prefix);
            self.stats.semantic.publish(semantic.len(), semantic.capacity());
        }
        if let Some(prefetcher) = &self.prefetcher {
            prefetcher.cancel_prefix(prefix).await;
        }
        self.notify(PrefetchEvent::InvalidatedPrefix(prefix.to_vec()));

        info!(prefix = %String::from_utf8_lossy(prefix), removed, "Invalidated prefix");
        removed
    }

    /// Semantic lookup without a backend fallback. A wrongly sized
    /// embedding degrades to an exact match on `fallback_key`.
    pub async fn semantic_get(
        &self,
        embedding: &[f32],
        fallback_key: impl Into<CacheKey>,
    ) -> Option<(Bytes, f64)> {
        let key = fallback_key.into();
        let embedding = {
            let semantic = self.semantic.lock().await;
            match semantic.check_dimension(embedding) {
                Ok(()) => Some(embedding),
                Err(e) => {
                    self.stats.semantic.dimension_mismatches.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "Falling back to exact semantic match");
                    None
                }
            }
        };
        self.semantic_lookup(&key, embedding).await
    }

    /// Lock-free, possibly slightly stale statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(
            &self.config.semantic.embedding_model_name,
            self.config.semantic.similarity_threshold,
        )
    }

    /// Resident in memory or on disk. Not counted as an access.
    pub async fn contains(&self, key: impl Into<CacheKey>) -> bool {
        self.store.contains(&key.into()).await
    }

    /// Structural consistency of both byte tiers.
    pub async fn check_invariants(&self) -> bool {
        self.store.check_invariants().await
    }

    /// Stop the prefetcher. Cached data stays readable.
    pub async fn shutdown(&self) {
        if let Some(prefetcher) = &self.prefetcher {
            prefetcher.shutdown().await;
        }
        info!("Cache coordinator stopped");
    }

    fn record_access(&self, key: &CacheKey) {
        self.notify(PrefetchEvent::Access {
            key: key.clone(),
            at: Instant::now(),
        });
    }

    /// Never blocks: a full channel drops the event.
    fn notify(&self, event: PrefetchEvent) {
        if let Some(events) = &self.events {
            let _ = events.try_send(event);
        }
    }

    // ─── Semantic path ─────────────────────────────────────────────────────

    async fn resolve_embedding(&self, query: SemanticQuery) -> Result<Option<Vec<f32>>> {
        let embedding = match query {
            SemanticQuery::Embedding(embedding) => embedding,
            SemanticQuery::Text(text) => match &self.embedder {
                Some(embedder) => embedder.embed(&text).await?,
                None => {
                    debug!("No embedder configured, semantic query uses exact match only");
                    return Ok(None);
                }
            },
        };

        let expected = self.config.semantic.embedding_dimension;
        if embedding.len() != expected {
            self.stats.semantic.dimension_mismatches.fetch_add(1, Ordering::Relaxed);
            warn!(
                error = %CacheError::EmbeddingDimensionMismatch { expected, actual: embedding.len() },
                "Falling back to exact semantic match"
            );
            return Ok(None);
        }
        Ok(Some(embedding))
    }

    async fn semantic_lookup(&self, key: &CacheKey, embedding: Option<&[f32]>) -> Option<(Bytes, f64)> {
        let hit: Option<SemanticHit> = {
            let mut semantic = self.semantic.lock().await;
            match embedding {
                Some(embedding) => match semantic.lookup(embedding, Some(key)) {
                    Ok(hit) => hit,
                    Err(e) => {
                        self.stats.semantic.dimension_mismatches.fetch_add(1, Ordering::Relaxed);
                        warn!(key = %key, error = %e, "Semantic lookup rejected");
                        semantic.lookup_exact(key)
                    }
                },
                None => semantic.lookup_exact(key),
            }
        };

        let Some(hit) = hit else {
            self.stats.semantic.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let payload = match hit.payload {
            SemanticPayload::Inline(payload) => Some(payload),
            SemanticPayload::ByKey(source) => {
                let resolved = self.store.lookup(&source).await.map(|(payload, _)| payload);
                if resolved.is_none() {
                    let mut semantic = self.semantic.lock().await;
                    semantic.remove(&hit.key);
                    self.stats.semantic.publish(semantic.len(), semantic.capacity());
                    debug!(key = %hit.key, "Semantic entry payload no longer cached, dropped");
                }
                resolved
            }
        };

        match payload {
            Some(payload) => {
                self.stats.semantic.record_match(hit.exact, hit.similarity);
                Some((payload, hit.similarity))
            }
            None => {
                self.stats.semantic.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn semantic_insert(&self, key: CacheKey, embedding: Vec<f32>, value: Bytes) {
        let mut semantic = self.semantic.lock().await;
        match semantic.insert(key.clone(), embedding, value) {
            Ok(evicted) => {
                if !evicted.is_empty() {
                    debug!(key = %key, evicted = evicted.len(), "Semantic cache full, evicted LRU");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "Semantic insert rejected"),
        }
        self.stats.semantic.publish(semantic.len(), semantic.capacity());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FetchError, FnBackend};
    use std::sync::atomic::AtomicUsize;

    fn config() -> Config {
        let mut config = Config::default();
        config.tiers.memory_capacity_bytes = 1024;
        config.tiers.disk_capacity_bytes = 0;
        config.prefetch.enabled = false;
        config.semantic.embedding_dimension = 4;
        config
    }

    fn counting_backend(calls: Arc<AtomicUsize>) -> Arc<dyn Backend> {
        Arc::new(FnBackend::new(move |key: CacheKey| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if key.as_bytes().starts_with(b"missing") {
                    return Err(FetchError::NotFound);
                }
                Ok(Bytes::from(format!("content:{key}")))
            }
        }))
    }

    #[tokio::test]
    async fn test_miss_fetches_and_caches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Coordinator::new(config(), counting_backend(calls.clone())).await.unwrap();

        let value = cache.get("a", GetOptions::default()).await.unwrap();
        assert_eq!(value, Some(Bytes::from("content:a")));
        let value = cache.get("a", GetOptions::default()).await.unwrap();
        assert_eq!(value, Some(Bytes::from("content:a")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_found_is_none() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Coordinator::new(config(), counting_backend(calls)).await.unwrap();
        assert_eq!(cache.get("missing", GetOptions::default()).await.unwrap(), None);
        assert!(!cache.contains("missing").await);
    }

    #[tokio::test]
    async fn test_put_then_get_skips_backend() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Coordinator::new(config(), counting_backend(calls.clone())).await.unwrap();

        cache.put("k", Bytes::from("local")).await.unwrap();
        assert_eq!(
            cache.get("k", GetOptions::default()).await.unwrap(),
            Some(Bytes::from("local"))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_put_too_large() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Coordinator::new(config(), counting_backend(calls)).await.unwrap();
        let err = cache.put("big", Bytes::from(vec![0u8; 2048])).await.unwrap_err();
        assert!(matches!(err, CacheError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn test_invalidate_refetches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Coordinator::new(config(), counting_backend(calls.clone())).await.unwrap();

        cache.get("a", GetOptions::default()).await.unwrap();
        assert!(cache.invalidate("a").await);
        assert!(!cache.contains("a").await);
        cache.get("a", GetOptions::default()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_backend_failure_not_cached() {
        let backend: Arc<dyn Backend> = Arc::new(FnBackend::new(|_key: CacheKey| async {
            Err(FetchError::Unavailable("down".into()))
        }));
        let cache = Coordinator::new(config(), backend).await.unwrap();

        let err = cache.get("a", GetOptions::default()).await.unwrap_err();
        assert!(matches!(err, CacheError::BackendFetchFailed(FetchError::Unavailable(_))));
        assert!(!cache.contains("a").await);
    }

    #[tokio::test]
    async fn test_fetch_timeout_not_cached() {
        let backend: Arc<dyn Backend> = Arc::new(FnBackend::new(|_key: CacheKey| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Bytes::from("late"))
        }));
        let cache = Coordinator::new(config(), backend).await.unwrap();

        let opts = GetOptions::default().with_timeout(Duration::from_millis(20));
        let err = cache.get("slow", opts).await.unwrap_err();
        assert_eq!(err, CacheError::BackendFetchTimeout);
        assert!(!cache.contains("slow").await);
    }

    #[tokio::test]
    async fn test_semantic_hit_after_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Coordinator::new(config(), counting_backend(calls.clone())).await.unwrap();

        let opts = GetOptions::default()
            .with_semantic(SemanticQuery::Embedding(vec![1.0, 0.0, 0.0, 0.0]));
        cache.get("how do I list files", opts).await.unwrap();

        let hit = cache
            .semantic_get(&[0.99, 0.05, 0.0, 0.0], "list files please")
            .await
            .unwrap();
        assert_eq!(hit.0, Bytes::from("content:how do I list files"));
        assert!(hit.1 >= 0.92);

        let stats = cache.stats();
        assert_eq!(stats.semantic_cache.cache_entries, 1);
        assert_eq!(stats.semantic_cache.similarity_matches, 1);
    }

    #[tokio::test]
    async fn test_semantic_dimension_mismatch_falls_back() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Coordinator::new(config(), counting_backend(calls)).await.unwrap();

        let opts = GetOptions::default().with_semantic(SemanticQuery::Embedding(vec![1.0; 3]));
        let value = cache.get("q", opts).await.unwrap();
        assert_eq!(value, Some(Bytes::from("content:q")));
        assert!(cache.semantic_get(&[1.0; 3], "other").await.is_none());
        assert_eq!(cache.stats().semantic_cache.cache_entries, 0);
    }
}
