//! Memory tier: ARC over RAM-resident entries.
//!
//! The tier is a plain single-threaded structure; the coordinator wraps it
//! in one exclusive lock. Evicted entries are returned to the caller so the
//! payload can be handed to the disk tier outside that lock.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::debug;

use crate::cache::arc::{Access, ArcParams, ArcPolicy, ListKind};
use crate::cache::entry::{CacheEntry, CacheKey, Tier};
use crate::error::Result;

pub struct MemoryTier {
    policy: ArcPolicy,
    entries: HashMap<CacheKey, CacheEntry>,
}

impl MemoryTier {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            policy: ArcPolicy::new(Tier::Memory, capacity_bytes),
            entries: HashMap::new(),
        }
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.policy.capacity()
    }

    /// Bytes currently resident.
    pub fn size_bytes(&self) -> u64 {
        self.policy.resident_bytes()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn list_of(&self, key: &CacheKey) -> Option<ListKind> {
        self.policy.list_of(key)
    }

    pub fn arc_params(&self) -> ArcParams {
        self.policy.params()
    }

    /// Look up a key, promoting T1 hits to T2.
    pub fn get(&mut self, key: &CacheKey) -> Option<Bytes> {
        match self.policy.access(key) {
            Access::Hit { promoted } => {
                let entry = self.entries.get_mut(key)?;
                entry.touch();
                if promoted {
                    debug!(key = %key, "Promoted T1 -> T2");
                }
                Some(entry.payload.clone())
            }
            Access::Ghost(_) | Access::Miss => None,
        }
    }

    /// Insert a payload. Returns the entries displaced to make room,
    /// LRU first; the caller cascades them to the next tier.
    pub fn put(&mut self, key: CacheKey, payload: Bytes) -> Result<Vec<CacheEntry>> {
        self.insert_entry(CacheEntry::new(key, payload))
    }

    /// Insert an entry arriving from another tier, keeping its bookkeeping.
    pub fn insert_entry(&mut self, entry: CacheEntry) -> Result<Vec<CacheEntry>> {
        let admission = self.policy.admit(entry.key.clone(), entry.size_bytes)?;

        let mut evicted = Vec::with_capacity(admission.evicted.len());
        for victim in admission.evicted {
            if let Some(old) = self.entries.remove(&victim) {
                debug!(key = %victim, bytes = old.size_bytes, "Evicted from memory");
                evicted.push(old);
            }
        }

        if admission.list.is_some() {
            let mut entry = entry.move_to(Tier::Memory);
            if let Some(previous) = self.entries.remove(&entry.key) {
                entry.created_at = previous.created_at;
                entry.access_count = previous.access_count;
            }
            entry.touch();
            self.entries.insert(entry.key.clone(), entry);
        }

        Ok(evicted)
    }

    /// Drop a key from the tier, forgetting its ghost history too.
    pub fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        self.policy.remove(key);
        self.entries.remove(key)
    }

    /// Remove every key starting with `prefix`. Returns the resident ones removed.
    pub fn remove_prefix(&mut self, prefix: &[u8]) -> Vec<CacheKey> {
        let mut removed = Vec::new();
        for key in self.policy.keys_with_prefix(prefix) {
            if self.remove(&key).is_some() {
                removed.push(key);
            }
        }
        removed
    }

    pub fn check_invariants(&self) -> bool {
        self.policy.check_invariants() && self.policy.resident_len() == self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: usize) -> Bytes {
        Bytes::from(vec![7u8; n])
    }

    #[test]
    fn test_put_get() {
        let mut tier = MemoryTier::new(1024);
        tier.put("a".into(), payload(10)).unwrap();
        assert_eq!(tier.get(&"a".into()), Some(payload(10)));
        assert_eq!(tier.size_bytes(), 10);
        assert_eq!(tier.list_of(&"a".into()), Some(ListKind::T2));
    }

    #[test]
    fn test_eviction_returns_payload() {
        let mut tier = MemoryTier::new(200);
        tier.put("a".into(), payload(100)).unwrap();
        tier.put("b".into(), payload(100)).unwrap();
        let evicted = tier.put("c".into(), payload(100)).unwrap();

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, CacheKey::from("a"));
        assert_eq!(evicted[0].payload, payload(100));
        assert_eq!(tier.len(), 2);
        assert!(tier.get(&"a".into()).is_none());
        assert!(tier.check_invariants());
    }

    #[test]
    fn test_zero_capacity_never_caches() {
        let mut tier = MemoryTier::new(0);
        let evicted = tier.put("a".into(), payload(1)).unwrap();
        assert!(evicted.is_empty());
        assert!(tier.get(&"a".into()).is_none());
        assert!(tier.is_empty());
    }

    #[test]
    fn test_too_large_is_rejected() {
        let mut tier = MemoryTier::new(100);
        tier.put("small".into(), payload(50)).unwrap();
        assert!(tier.put("big".into(), payload(101)).is_err());
        assert!(tier.contains(&"small".into()));
    }

    #[test]
    fn test_remove_prefix() {
        let mut tier = MemoryTier::new(1024);
        tier.put("/docs/a".into(), payload(1)).unwrap();
        tier.put("/docs/b".into(), payload(1)).unwrap();
        tier.put("/img/c".into(), payload(1)).unwrap();

        let mut removed = tier.remove_prefix(b"/docs/");
        removed.sort();
        assert_eq!(removed, vec![CacheKey::from("/docs/a"), CacheKey::from("/docs/b")]);
        assert_eq!(tier.len(), 1);
        assert!(tier.check_invariants());
    }

    #[test]
    fn test_overwrite_keeps_single_copy() {
        let mut tier = MemoryTier::new(1024);
        tier.put("a".into(), payload(10)).unwrap();
        tier.put("a".into(), payload(20)).unwrap();
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.size_bytes(), 20);
        assert_eq!(tier.get(&"a".into()), Some(payload(20)));
    }
}
