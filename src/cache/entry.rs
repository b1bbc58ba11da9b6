//! Cache keys, entries and tier identifiers.
//!
//! An entry is owned by exactly one tier at a time. Moving it between
//! tiers moves the [`CacheEntry`] value itself.

use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifies which byte tier holds an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Tier 0: RAM (hot).
    Memory,
    /// Tier 1: local disk (warm).
    Disk,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Memory => write!(f, "memory"),
            Tier::Disk => write!(f, "disk"),
        }
    }
}

/// Opaque, byte-comparable cache key (a CID or a normalized path).
///
/// Cloning is cheap: the bytes are reference counted.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(Bytes);

impl CacheKey {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.0.starts_with(prefix)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self(Bytes::from(s))
    }
}

impl From<&[u8]> for CacheKey {
    fn from(b: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for CacheKey {
    fn from(b: Vec<u8>) -> Self {
        Self(Bytes::from(b))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            Err(_) => {
                for b in self.0.iter() {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({self})")
    }
}

/// A cached blob plus its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,

    pub payload: Bytes,

    /// Logical (uncompressed) payload size.
    pub size_bytes: u64,

    /// Tier currently holding this entry.
    pub tier: Tier,

    pub created_at: Instant,

    pub last_accessed_at: Instant,

    pub access_count: u64,
}

impl CacheEntry {
    /// Create a fresh entry that lands in the memory tier.
    pub fn new(key: CacheKey, payload: Bytes) -> Self {
        let now = Instant::now();
        Self {
            size_bytes: payload.len() as u64,
            key,
            payload,
            tier: Tier::Memory,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
        }
    }

    /// Record an access, updating timestamp and counter.
    pub fn touch(&mut self) {
        self.last_accessed_at = Instant::now();
        self.access_count += 1;
    }

    /// Hand the entry to another tier.
    pub fn move_to(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_display() {
        assert_eq!(Tier::Memory.to_string(), "memory");
        assert_eq!(Tier::Disk.to_string(), "disk");
    }

    #[test]
    fn test_key_display() {
        assert_eq!(CacheKey::from("bafy/readme.md").to_string(), "bafy/readme.md");
        assert_eq!(CacheKey::from(vec![0xff, 0x01]).to_string(), "ff01");
    }

    #[test]
    fn test_key_prefix() {
        let key = CacheKey::from("/docs/a.txt");
        assert!(key.starts_with(b"/docs/"));
        assert!(!key.starts_with(b"/img/"));
    }

    #[test]
    fn test_entry_touch() {
        let mut entry = CacheEntry::new("k".into(), Bytes::from_static(b"abc"));
        assert_eq!(entry.size_bytes, 3);
        assert_eq!(entry.access_count, 0);
        entry.touch();
        entry.touch();
        assert_eq!(entry.access_count, 2);
        assert_eq!(entry.move_to(Tier::Disk).tier, Tier::Disk);
    }
}
