//! Semantic cache: embedding-keyed lookup for queries that tolerate
//! near-duplicate matches.
//!
//! Lookup tries the exact key first (similarity 1.0), then scans every
//! stored embedding for the best cosine match. The best match is a hit
//! only when `similarity >= threshold`. Entries are evicted LRU once the
//! entry capacity is reached.
//!
//! Small payloads are kept inline. Larger ones are stored by key and
//! resolved through the byte tiers, so they never count twice against
//! the tier budgets.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use bytes::Bytes;
use tracing::debug;

use crate::cache::entry::CacheKey;
use crate::config::SemanticConfig;
use crate::error::CacheError;

/// Cosine similarity `dot(a, b) / (‖a‖·‖b‖)` with `f32` accumulation.
/// A zero vector has similarity 0 with everything.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[derive(Debug, Clone, PartialEq)]
pub enum SemanticPayload {
    Inline(Bytes),
    /// Resolve through the byte tiers.
    ByKey(CacheKey),
}

#[derive(Debug, Clone)]
pub struct SemanticCacheEntry {
    pub key: CacheKey,
    pub embedding: Vec<f32>,
    pub payload: SemanticPayload,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
    /// Threshold in effect when the entry was stored.
    pub similarity_threshold_used: f64,
    stamp: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SemanticHit {
    pub key: CacheKey,
    pub payload: SemanticPayload,
    pub similarity: f64,
    pub exact: bool,
}

#[derive(Debug)]
pub struct SemanticCache {
    dimension: usize,
    threshold: f64,
    capacity: usize,
    inline_max: usize,
    entries: HashMap<CacheKey, SemanticCacheEntry>,
    lru: BTreeMap<u64, CacheKey>,
    next_stamp: u64,
}

impl SemanticCache {
    pub fn new(config: &SemanticConfig) -> Self {
        Self {
            dimension: config.embedding_dimension,
            threshold: config.similarity_threshold,
            capacity: config.semantic_cache_capacity,
            inline_max: config.inline_payload_max_bytes,
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            next_stamp: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, key: &CacheKey) -> Option<&SemanticCacheEntry> {
        self.entries.get(key)
    }

    pub fn check_dimension(&self, embedding: &[f32]) -> Result<(), CacheError> {
        if embedding.len() != self.dimension {
            return Err(CacheError::EmbeddingDimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }
        Ok(())
    }

    /// Exact-key match only.
    pub fn lookup_exact(&mut self, key: &CacheKey) -> Option<SemanticHit> {
        let payload = self.entries.get(key)?.payload.clone();
        self.touch(key);
        Some(SemanticHit {
            key: key.clone(),
            payload,
            similarity: 1.0,
            exact: true,
        })
    }

    /// Exact key first, then the best cosine match at or above the threshold.
    /// A wrongly sized embedding is rejected once the exact key has missed.
    pub fn lookup(
        &mut self,
        embedding: &[f32],
        exact_key: Option<&CacheKey>,
    ) -> Result<Option<SemanticHit>, CacheError> {
        if let Some(hit) = exact_key.and_then(|key| self.lookup_exact(key)) {
            return Ok(Some(hit));
        }
        self.check_dimension(embedding)?;

        let threshold = self.threshold as f32;
        let best = self
            .entries
            .values()
            .map(|e| (cosine_similarity(embedding, &e.embedding), &e.key))
            .max_by(|a, b| a.0.total_cmp(&b.0));

        match best {
            Some((similarity, key)) if similarity >= threshold => {
                let key = key.clone();
                let (payload, stored_threshold) = match self.entries.get(&key) {
                    Some(entry) => (entry.payload.clone(), entry.similarity_threshold_used),
                    None => return Ok(None),
                };
                self.touch(&key);
                debug!(key = %key, similarity, stored_threshold, "Semantic match");
                Ok(Some(SemanticHit {
                    key,
                    payload,
                    similarity: similarity as f64,
                    exact: false,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Store an embedding for `key`. Returns the keys evicted to make room.
    pub fn insert(
        &mut self,
        key: CacheKey,
        embedding: Vec<f32>,
        payload: Bytes,
    ) -> Result<Vec<CacheKey>, CacheError> {
        self.check_dimension(&embedding)?;
        if self.capacity == 0 {
            return Ok(Vec::new());
        }

        self.remove(&key);
        let mut evicted = Vec::new();
        while self.entries.len() >= self.capacity {
            let Some((_, victim)) = self.lru.pop_first() else { break };
            self.entries.remove(&victim);
            debug!(key = %victim, "Evicted semantic entry");
            evicted.push(victim);
        }

        let payload = if payload.len() > self.inline_max {
            SemanticPayload::ByKey(key.clone())
        } else {
            SemanticPayload::Inline(payload)
        };
        let stamp = self.bump();
        let now = Instant::now();
        self.lru.insert(stamp, key.clone());
        self.entries.insert(
            key.clone(),
            SemanticCacheEntry {
                key,
                embedding,
                payload,
                created_at: now,
                last_accessed_at: now,
                similarity_threshold_used: self.threshold,
                stamp,
            },
        );
        Ok(evicted)
    }

    pub fn remove(&mut self, key: &CacheKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.lru.remove(&entry.stamp);
                true
            }
            None => false,
        }
    }

    pub fn remove_prefix(&mut self, prefix: &[u8]) -> usize {
        let keys: Vec<CacheKey> = self
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.iter().filter(|k| self.remove(k)).count()
    }

    fn touch(&mut self, key: &CacheKey) {
        let stamp = self.bump();
        if let Some(entry) = self.entries.get_mut(key) {
            self.lru.remove(&entry.stamp);
            entry.stamp = stamp;
            entry.last_accessed_at = Instant::now();
            self.lru.insert(stamp, key.clone());
        }
    }

    fn bump(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        stamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> SemanticCache {
        SemanticCache::new(&SemanticConfig {
            semantic_cache_capacity: capacity,
            embedding_dimension: 4,
            ..SemanticConfig::default()
        })
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_exact_key_hit() {
        let mut cache = cache(10);
        cache
            .insert("q".into(), vec![1.0, 0.0, 0.0, 0.0], Bytes::from("answer"))
            .unwrap();
        let hit = cache
            .lookup(&[0.0, 1.0, 0.0, 0.0], Some(&"q".into()))
            .unwrap()
            .unwrap();
        assert!(hit.exact);
        assert_eq!(hit.similarity, 1.0);
        assert_eq!(hit.payload, SemanticPayload::Inline(Bytes::from("answer")));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let mut cache = cache(10);
        cache
            .insert("q".into(), vec![1.0, 0.0, 0.0, 0.0], Bytes::from("answer"))
            .unwrap();

        // cos = 23 / 25 = 0.92 exactly.
        let hit = cache.lookup(&[23.0, 4.0, 4.0, 8.0], None).unwrap().unwrap();
        assert!(!hit.exact);
        assert!((hit.similarity - 0.92).abs() < 1e-6);

        let below = 0.9199f32;
        let query = [below, (1.0 - below * below).sqrt(), 0.0, 0.0];
        assert!(cache.lookup(&query, None).unwrap().is_none());
    }

    #[test]
    fn test_entry_records_threshold() {
        let mut cache = SemanticCache::new(&SemanticConfig {
            embedding_dimension: 4,
            similarity_threshold: 0.85,
            ..SemanticConfig::default()
        });
        cache
            .insert("q".into(), vec![1.0, 0.0, 0.0, 0.0], Bytes::from("answer"))
            .unwrap();
        let entry = cache.entry(&"q".into()).unwrap();
        assert_eq!(entry.similarity_threshold_used, 0.85);
        assert_eq!(entry.key, CacheKey::from("q"));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut cache = cache(10);
        assert_eq!(
            cache.insert("q".into(), vec![1.0; 3], Bytes::new()),
            Err(CacheError::EmbeddingDimensionMismatch { expected: 4, actual: 3 })
        );
        assert!(cache.lookup(&[1.0; 5], None).is_err());
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = cache(2);
        cache.insert("a".into(), vec![1.0, 0.0, 0.0, 0.0], Bytes::new()).unwrap();
        cache.insert("b".into(), vec![0.0, 1.0, 0.0, 0.0], Bytes::new()).unwrap();
        // Touch a so b is the LRU.
        assert!(cache.lookup_exact(&"a".into()).is_some());

        let evicted = cache
            .insert("c".into(), vec![0.0, 0.0, 1.0, 0.0], Bytes::new())
            .unwrap();
        assert_eq!(evicted, vec![CacheKey::from("b")]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_large_payload_stored_by_key() {
        let mut cache = SemanticCache::new(&SemanticConfig {
            embedding_dimension: 4,
            inline_payload_max_bytes: 8,
            ..SemanticConfig::default()
        });
        cache
            .insert("big".into(), vec![1.0, 0.0, 0.0, 0.0], Bytes::from(vec![0u8; 9]))
            .unwrap();
        let hit = cache.lookup_exact(&"big".into()).unwrap();
        assert_eq!(hit.payload, SemanticPayload::ByKey("big".into()));
    }

    #[test]
    fn test_remove_prefix() {
        let mut cache = cache(10);
        cache.insert("/s/1".into(), vec![1.0, 0.0, 0.0, 0.0], Bytes::new()).unwrap();
        cache.insert("/s/2".into(), vec![1.0, 0.0, 0.0, 0.0], Bytes::new()).unwrap();
        cache.insert("/t/1".into(), vec![1.0, 0.0, 0.0, 0.0], Bytes::new()).unwrap();
        assert_eq!(cache.remove_prefix(b"/s/"), 2);
        assert_eq!(cache.len(), 1);
    }
}
