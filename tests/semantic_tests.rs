//! Semantic cache behaviour through the coordinator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use vfs_cache_tier::{
    Backend, CacheKey, Config, Coordinator, EmbedError, Embedder, FnBackend, GetOptions, SemanticQuery,
};

fn config() -> Config {
    let mut config = Config::default();
    config.tiers.memory_capacity_bytes = 1 << 20;
    config.tiers.disk_capacity_bytes = 0;
    config.prefetch.enabled = false;
    config.semantic.embedding_dimension = 4;
    config
}

fn backend(calls: Arc<AtomicUsize>) -> Arc<dyn Backend> {
    Arc::new(FnBackend::new(move |key: CacheKey| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from(format!("results for {key}")))
        }
    }))
}

async fn seeded(calls: Arc<AtomicUsize>) -> Coordinator {
    let cache = Coordinator::new(config(), backend(calls)).await.unwrap();
    let opts = GetOptions::default().with_semantic(SemanticQuery::Embedding(vec![1.0, 0.0, 0.0, 0.0]));
    cache.get("search:rust cache", opts).await.unwrap();
    cache
}

#[tokio::test]
async fn test_similarity_exactly_at_threshold_is_hit() {
    let cache = seeded(Arc::new(AtomicUsize::new(0))).await;

    // cos((1,0,0,0), (23,4,4,8)) = 23 / 25 = 0.92
    let (payload, similarity) = cache
        .semantic_get(&[23.0, 4.0, 4.0, 8.0], "search:caching in rust")
        .await
        .expect("similarity at the threshold is a hit");
    assert_eq!(payload, Bytes::from("results for search:rust cache"));
    assert!((similarity - 0.92).abs() < 1e-6);
}

#[tokio::test]
async fn test_similarity_below_threshold_is_miss() {
    let cache = seeded(Arc::new(AtomicUsize::new(0))).await;

    let below = 0.9199f32;
    let query = [below, (1.0 - below * below).sqrt(), 0.0, 0.0];
    assert!(cache.semantic_get(&query, "search:something else").await.is_none());
}

#[tokio::test]
async fn test_semantic_get_serves_without_backend() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = seeded(calls.clone()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A near-duplicate query under a different key is answered semantically.
    let opts = GetOptions::default().with_semantic(SemanticQuery::Embedding(vec![0.98, 0.1, 0.0, 0.0]));
    let value = cache.get("search:rust caches", opts).await.unwrap();
    assert_eq!(value, Some(Bytes::from("results for search:rust cache")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let stats = cache.stats();
    assert_eq!(stats.semantic_cache.similarity_matches, 1);
    assert_eq!(stats.semantic_cache.embedding_model_name, "all-MiniLM-L6-v2");
    assert!(stats.semantic_cache.average_similarity > 0.92);
    assert!(stats.semantic_cache.cache_utilization > 0.0);
}

#[tokio::test]
async fn test_exact_key_match_reports_full_similarity() {
    let cache = seeded(Arc::new(AtomicUsize::new(0))).await;
    let (_, similarity) = cache
        .semantic_get(&[0.0, 0.0, 0.0, 1.0], "search:rust cache")
        .await
        .unwrap();
    assert_eq!(similarity, 1.0);
    assert_eq!(cache.stats().semantic_cache.exact_matches, 1);
}

#[tokio::test]
async fn test_invalidate_drops_semantic_entry() {
    let cache = seeded(Arc::new(AtomicUsize::new(0))).await;
    cache.invalidate("search:rust cache").await;
    assert!(cache.semantic_get(&[1.0, 0.0, 0.0, 0.0], "search:x").await.is_none());
    assert_eq!(cache.stats().semantic_cache.cache_entries, 0);
}

#[tokio::test]
async fn test_large_payload_resolves_through_tiers() {
    let mut config = config();
    config.semantic.inline_payload_max_bytes = 8;
    let cache = Coordinator::new(config, backend(Arc::new(AtomicUsize::new(0)))).await.unwrap();

    let opts = GetOptions::default().with_semantic(SemanticQuery::Embedding(vec![0.0, 1.0, 0.0, 0.0]));
    cache.get("doc", opts).await.unwrap();

    let (payload, _) = cache.semantic_get(&[0.0, 1.0, 0.0, 0.0], "other").await.unwrap();
    assert_eq!(payload, Bytes::from("results for doc"));

    // Once the referenced payload is gone the entry goes with it.
    cache.invalidate("doc").await;
    assert!(cache.semantic_get(&[0.0, 1.0, 0.0, 0.0], "other").await.is_none());
}

struct KeywordEmbedder;

#[async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed(&self, content: &str) -> Result<Vec<f32>, EmbedError> {
        let has = |word: &str| if content.contains(word) { 1.0 } else { 0.0 };
        Ok(vec![has("rust"), has("cache"), has("disk"), 0.1])
    }
}

#[tokio::test]
async fn test_text_query_uses_embedder() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = Coordinator::new(config(), backend(calls.clone()))
        .await
        .unwrap()
        .with_embedder(Arc::new(KeywordEmbedder));

    let opts = |text: &str| GetOptions::default().with_semantic(SemanticQuery::Text(text.to_string()));
    cache.get("q1", opts("rust cache")).await.unwrap();
    let value = cache.get("q2", opts("a rust cache")).await.unwrap();

    assert_eq!(value, Some(Bytes::from("results for q1")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
