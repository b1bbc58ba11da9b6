//! Byte-weighted Adaptive Replacement Cache (ARC) state machine.
//!
//! Both byte tiers run the same policy, each with its own capacity `C` and
//! target `p`. The policy tracks keys and sizes only; the owning tier keeps
//! the payloads and acts on the keys this module reports as evicted.
//!
//! Every key known to the policy carries exactly one [`ListKind`] tag:
//!
//! ```text
//!   T1  resident, seen once          B1  ghost of a T1 eviction
//!   T2  resident, seen twice or more B2  ghost of a T2 eviction
//! ```
//!
//! Sizes are in bytes, so `|X|` below means the byte total of list `X`.
//! Invariants, checked by [`ArcPolicy::check_invariants`]:
//! - `|T1| + |T2| <= C`
//! - `|B1| + |B2| <= C`
//! - `|T1| + |B1| <= C`
//! - `0 <= p <= C`
//!
//! Lists are ordered by a monotonic stamp: the smallest stamp is the LRU end.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::cache::entry::{CacheKey, Tier};
use crate::error::CacheError;

/// Which ARC list a key currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ListKind {
    T1,
    T2,
    B1,
    B2,
}

impl ListKind {
    const ALL: [ListKind; 4] = [ListKind::T1, ListKind::T2, ListKind::B1, ListKind::B2];

    fn index(self) -> usize {
        match self {
            ListKind::T1 => 0,
            ListKind::T2 => 1,
            ListKind::B1 => 2,
            ListKind::B2 => 3,
        }
    }

    /// Whether a key tagged with this list has its payload resident.
    pub fn is_resident(self) -> bool {
        matches!(self, ListKind::T1 | ListKind::T2)
    }

    /// The ghost list that records evictions from this list.
    pub fn ghost(self) -> ListKind {
        match self {
            ListKind::T1 | ListKind::B1 => ListKind::B1,
            ListKind::T2 | ListKind::B2 => ListKind::B2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    list: ListKind,
    stamp: u64,
    size: u64,
}

/// Outcome of [`ArcPolicy::access`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Resident. `promoted` is true when the key just moved T1 → T2.
    Hit { promoted: bool },
    /// Not resident, but remembered in a ghost list.
    Ghost(ListKind),
    Miss,
}

/// Outcome of [`ArcPolicy::admit`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Admission {
    /// List the key landed in; None when the tier is a pass-through.
    pub list: Option<ListKind>,
    /// Keys whose payloads must leave the tier, LRU first.
    pub evicted: Vec<CacheKey>,
}

/// Point-in-time ARC parameters for the stats snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArcParams {
    pub capacity_bytes: u64,
    pub p_bytes: u64,
    pub t1_len: usize,
    pub t2_len: usize,
    pub b1_len: usize,
    pub b2_len: usize,
    pub t1_bytes: u64,
    pub t2_bytes: u64,
    pub b1_bytes: u64,
    pub b2_bytes: u64,
}

/// The ARC directory for one tier.
#[derive(Debug)]
pub struct ArcPolicy {
    tier: Tier,
    capacity: u64,
    p: u64,
    directory: HashMap<CacheKey, Slot>,
    lists: [BTreeMap<u64, CacheKey>; 4],
    bytes: [u64; 4],
    next_stamp: u64,
}

impl ArcPolicy {
    pub fn new(tier: Tier, capacity: u64) -> Self {
        Self {
            tier,
            capacity,
            p: 0,
            directory: HashMap::new(),
            lists: Default::default(),
            bytes: [0; 4],
            next_stamp: 0,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Target byte size for T1.
    pub fn p(&self) -> u64 {
        self.p
    }

    pub fn bytes(&self, list: ListKind) -> u64 {
        self.bytes[list.index()]
    }

    pub fn len(&self, list: ListKind) -> usize {
        self.lists[list.index()].len()
    }

    /// Bytes held in T1 + T2.
    pub fn resident_bytes(&self) -> u64 {
        self.bytes(ListKind::T1) + self.bytes(ListKind::T2)
    }

    /// Number of keys in T1 + T2.
    pub fn resident_len(&self) -> usize {
        self.len(ListKind::T1) + self.len(ListKind::T2)
    }

    pub fn list_of(&self, key: &CacheKey) -> Option<ListKind> {
        self.directory.get(key).map(|slot| slot.list)
    }

    pub fn is_resident(&self, key: &CacheKey) -> bool {
        self.list_of(key).is_some_and(ListKind::is_resident)
    }

    /// Record a lookup. A T1 hit is promoted to T2; any hit moves to MRU.
    /// Ghost hits do not adapt `p` here: adaptation happens when the payload
    /// is admitted again.
    pub fn access(&mut self, key: &CacheKey) -> Access {
        let Some(slot) = self.directory.get(key).copied() else {
            return Access::Miss;
        };
        match slot.list {
            ListKind::T1 => {
                self.relink(key, slot, ListKind::T2);
                Access::Hit { promoted: true }
            }
            ListKind::T2 => {
                self.relink(key, slot, ListKind::T2);
                Access::Hit { promoted: false }
            }
            ghost => Access::Ghost(ghost),
        }
    }

    /// Admit `key` with `size` bytes, running REPLACE until it fits.
    ///
    /// - resident key: treated as another access, lands in T2
    /// - B1 ghost: grow `p`, land in T2
    /// - B2 ghost: shrink `p`, land in T2
    /// - unknown key: land in T1
    pub fn admit(&mut self, key: CacheKey, size: u64) -> Result<Admission, CacheError> {
        if self.capacity == 0 {
            return Ok(Admission::default());
        }
        if size > self.capacity {
            return Err(CacheError::TooLarge {
                tier: self.tier,
                size,
                capacity: self.capacity,
            });
        }

        let mut in_b2 = false;
        let target = match self.directory.get(&key).copied() {
            Some(slot) if slot.list.is_resident() => {
                self.unlink(&key, slot);
                ListKind::T2
            }
            Some(slot) => {
                in_b2 = slot.list == ListKind::B2;
                self.adapt(slot.list, slot.size);
                self.unlink(&key, slot);
                ListKind::T2
            }
            None => ListKind::T1,
        };

        let mut evicted = Vec::new();
        while self.resident_bytes() + size > self.capacity {
            match self.replace(in_b2) {
                Some(victim) => evicted.push(victim),
                None => break,
            }
        }

        self.link(key, target, size);
        self.trim_ghosts();
        debug_assert!(self.check_invariants());

        Ok(Admission {
            list: Some(target),
            evicted,
        })
    }

    /// Forget a key entirely, ghosts included.
    pub fn remove(&mut self, key: &CacheKey) -> Option<ListKind> {
        let slot = self.directory.get(key).copied()?;
        self.unlink(key, slot);
        Some(slot.list)
    }

    /// Move a resident key to its ghost list without a REPLACE, e.g. when
    /// the payload is promoted to a faster tier. Returns the ghost list used.
    pub fn retire(&mut self, key: &CacheKey) -> Option<ListKind> {
        let slot = self.directory.get(key).copied()?;
        if !slot.list.is_resident() {
            return None;
        }
        let ghost = slot.list.ghost();
        self.relink(key, slot, ghost);
        self.trim_ghosts();
        Some(ghost)
    }

    /// All keys (resident and ghost) starting with `prefix`.
    pub fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<CacheKey> {
        self.directory
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn params(&self) -> ArcParams {
        ArcParams {
            capacity_bytes: self.capacity,
            p_bytes: self.p,
            t1_len: self.len(ListKind::T1),
            t2_len: self.len(ListKind::T2),
            b1_len: self.len(ListKind::B1),
            b2_len: self.len(ListKind::B2),
            t1_bytes: self.bytes(ListKind::T1),
            t2_bytes: self.bytes(ListKind::T2),
            b1_bytes: self.bytes(ListKind::B1),
            b2_bytes: self.bytes(ListKind::B2),
        }
    }

    pub fn check_invariants(&self) -> bool {
        let c = self.capacity;
        let t1 = self.bytes(ListKind::T1);
        let t2 = self.bytes(ListKind::T2);
        let b1 = self.bytes(ListKind::B1);
        let b2 = self.bytes(ListKind::B2);

        let listed: usize = self.lists.iter().map(BTreeMap::len).sum();
        let sized = ListKind::ALL.iter().all(|&list| {
            self.lists[list.index()]
                .values()
                .filter_map(|k| self.directory.get(k))
                .map(|slot| slot.size)
                .sum::<u64>()
                == self.bytes(list)
        });

        t1 + t2 <= c
            && b1 + b2 <= c
            && t1 + b1 <= c
            && self.p <= c
            && listed == self.directory.len()
            && sized
    }

    /// ARC REPLACE: evict the LRU of T1 or T2 into its ghost list.
    fn replace(&mut self, in_b2: bool) -> Option<CacheKey> {
        let t1 = self.bytes(ListKind::T1);
        let t1_nonempty = self.len(ListKind::T1) > 0;
        let t2_nonempty = self.len(ListKind::T2) > 0;

        let from = if t1_nonempty && (t1 > self.p || (in_b2 && t1 == self.p) || !t2_nonempty) {
            ListKind::T1
        } else if t2_nonempty {
            ListKind::T2
        } else {
            return None;
        };

        let (_, victim) = self.lists[from.index()].first_key_value()?;
        let victim = victim.clone();
        let slot = *self.directory.get(&victim)?;
        self.relink(&victim, slot, from.ghost());
        Some(victim)
    }

    /// Adjust `p` on a ghost hit. Deltas are scaled by the ghost's size so
    /// that one "entry" of adaptation is worth the bytes it represents.
    fn adapt(&mut self, ghost: ListKind, size: u64) {
        let b1 = self.bytes(ListKind::B1);
        let b2 = self.bytes(ListKind::B2);
        match ghost {
            ListKind::B1 => {
                let ratio = if b1 == 0 { 1 } else { (b2 / b1).max(1) };
                self.p = self.p.saturating_add(ratio.saturating_mul(size)).min(self.capacity);
            }
            ListKind::B2 => {
                let ratio = if b2 == 0 { 1 } else { (b1 / b2).max(1) };
                self.p = self.p.saturating_sub(ratio.saturating_mul(size));
            }
            _ => {}
        }
    }

    fn trim_ghosts(&mut self) {
        while self.bytes(ListKind::T1) + self.bytes(ListKind::B1) > self.capacity
            && self.len(ListKind::B1) > 0
        {
            self.drop_lru(ListKind::B1);
        }
        while self.bytes(ListKind::B1) + self.bytes(ListKind::B2) > self.capacity {
            let from = if self.len(ListKind::B2) > 0 {
                ListKind::B2
            } else {
                ListKind::B1
            };
            if !self.drop_lru(from) {
                break;
            }
        }
    }

    fn drop_lru(&mut self, list: ListKind) -> bool {
        let Some((_, key)) = self.lists[list.index()].pop_first() else {
            return false;
        };
        if let Some(slot) = self.directory.remove(&key) {
            self.bytes[list.index()] -= slot.size;
        }
        true
    }

    fn link(&mut self, key: CacheKey, list: ListKind, size: u64) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.lists[list.index()].insert(stamp, key.clone());
        self.bytes[list.index()] += size;
        self.directory.insert(key, Slot { list, stamp, size });
    }

    fn unlink(&mut self, key: &CacheKey, slot: Slot) {
        self.lists[slot.list.index()].remove(&slot.stamp);
        self.bytes[slot.list.index()] -= slot.size;
        self.directory.remove(key);
    }

    /// Move a key to the MRU end of `list`.
    fn relink(&mut self, key: &CacheKey, slot: Slot, list: ListKind) {
        self.unlink(key, slot);
        self.link(key.clone(), list, slot.size);
    }
}
