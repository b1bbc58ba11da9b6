//! The two byte tiers wired together: memory evictions cascade to disk,
//! disk hits are promoted back to memory.
//!
//! Shared by the coordinator and the prefetch workers. The memory lock is
//! never held across disk I/O.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::cache::disk::DiskTier;
use crate::cache::entry::{CacheEntry, CacheKey, Tier};
use crate::cache::memory::MemoryTier;
use crate::cache::prefetcher::PrefetchEvent;
use crate::cache::stats::CacheStats;
use crate::error::{CacheError, Result};

pub struct TieredStore {
    memory: Mutex<MemoryTier>,
    disk: Option<DiskTier>,
    stats: Arc<CacheStats>,
    events: Option<mpsc::Sender<PrefetchEvent>>,
}

impl TieredStore {
    pub fn new(
        memory: MemoryTier,
        disk: Option<DiskTier>,
        stats: Arc<CacheStats>,
        events: Option<mpsc::Sender<PrefetchEvent>>,
    ) -> Self {
        stats.memory.publish(memory.arc_params());
        Self {
            memory: Mutex::new(memory),
            disk,
            stats,
            events,
        }
    }

    pub fn disk(&self) -> Option<&DiskTier> {
        self.disk.as_ref()
    }

    /// Memory, then disk. A disk hit is promoted to memory.
    pub async fn lookup(&self, key: &CacheKey) -> Option<(Bytes, Tier)> {
        if let Some(payload) = self.memory_get(key).await {
            self.stats.memory.record_hit();
            return Some((payload, Tier::Memory));
        }
        self.stats.memory.record_miss();

        let Some(disk) = &self.disk else {
            return None;
        };
        match self.promote(disk, key).await {
            Some(payload) => {
                self.stats.disk.record_hit();
                Some((payload, Tier::Disk))
            }
            None => {
                // A concurrent lookup may have promoted it meanwhile.
                if let Some(payload) = self.memory_get(key).await {
                    self.stats.memory.record_hit();
                    return Some((payload, Tier::Memory));
                }
                self.stats.disk.record_miss();
                None
            }
        }
    }

    async fn memory_get(&self, key: &CacheKey) -> Option<Bytes> {
        let mut memory = self.memory.lock().await;
        let payload = memory.get(key);
        if payload.is_some() {
            self.stats.memory.publish(memory.arc_params());
        }
        payload
    }

    async fn promote(&self, disk: &DiskTier, key: &CacheKey) -> Option<Bytes> {
        if self.memory.lock().await.capacity_bytes() == 0 {
            return disk.get(key).await;
        }

        let entry = disk.take(key).await?;
        let payload = entry.payload.clone();
        debug!(key = %key, from = %Tier::Disk, to = %Tier::Memory, "Promoting entry");

        let admitted = {
            let mut memory = self.memory.lock().await;
            let result = memory.insert_entry(entry.clone());
            self.stats.memory.publish(memory.arc_params());
            result
        };
        match admitted {
            Ok(evicted) => self.cascade(evicted).await,
            Err(e) => {
                // Too large for memory: put it back where it came from.
                debug!(key = %key, error = %e, "Promotion rejected, keeping on disk");
                self.write_disk(disk, entry.move_to(Tier::Disk)).await;
            }
        }
        Some(payload)
    }

    /// Insert into memory, cascading whatever it displaces to disk.
    /// With a zero-capacity memory tier the entry goes straight to disk.
    pub async fn admit(&self, key: CacheKey, payload: Bytes) -> Result<()> {
        let (evicted, passthrough) = {
            let mut memory = self.memory.lock().await;
            let passthrough = memory.capacity_bytes() == 0;
            let evicted = memory.put(key.clone(), payload.clone())?;
            self.stats.memory.publish(memory.arc_params());
            (evicted, passthrough)
        };
        self.cascade(evicted).await;

        if let Some(disk) = &self.disk {
            if passthrough {
                self.write_disk(disk, CacheEntry::new(key, payload).move_to(Tier::Disk))
                    .await;
            } else if disk.contains(&key).await {
                // An entry lives in one tier at a time; the older disk copy goes.
                disk.remove(&key).await;
            }
        }
        Ok(())
    }

    async fn cascade(&self, evicted: Vec<CacheEntry>) {
        if evicted.is_empty() {
            return;
        }
        self.stats.memory.record_evictions(evicted.len());

        for entry in evicted {
            if let Some(events) = &self.events {
                let _ = events.try_send(PrefetchEvent::Evicted(entry.key.clone()));
            }
            match &self.disk {
                Some(disk) => {
                    debug!(key = %entry.key, from = %Tier::Memory, to = %Tier::Disk, "Demoting entry");
                    self.write_disk(disk, entry.move_to(Tier::Disk)).await;
                }
                None => debug!(key = %entry.key, "Evicted from memory"),
            }
        }
    }

    /// Disk writes are best effort: a failure leaves the entry uncached.
    async fn write_disk(&self, disk: &DiskTier, entry: CacheEntry) {
        let key = entry.key.clone();
        match disk.put(entry).await {
            Ok(()) => {}
            Err(CacheError::TooLarge { size, capacity, .. }) => {
                debug!(key = %key, size, capacity, "Entry too large for disk tier");
            }
            Err(e) => warn!(key = %key, error = %e, "Dropping entry after disk write failure"),
        }
    }

    /// Resident in either tier. Does not count as an access.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        if self.memory.lock().await.contains(key) {
            return true;
        }
        match &self.disk {
            Some(disk) => disk.contains(key).await,
            None => false,
        }
    }

    pub async fn remove(&self, key: &CacheKey) -> bool {
        let in_memory = {
            let mut memory = self.memory.lock().await;
            let removed = memory.remove(key).is_some();
            self.stats.memory.publish(memory.arc_params());
            removed
        };
        let on_disk = match &self.disk {
            Some(disk) => disk.remove(key).await,
            None => false,
        };
        in_memory || on_disk
    }

    /// Remove every key with the prefix. Returns how many resident entries went.
    pub async fn remove_prefix(&self, prefix: &[u8]) -> usize {
        let in_memory = {
            let mut memory = self.memory.lock().await;
            let removed = memory.remove_prefix(prefix);
            self.stats.memory.publish(memory.arc_params());
            removed.len()
        };
        let on_disk = match &self.disk {
            Some(disk) => disk.remove_prefix(prefix).await.len(),
            None => 0,
        };
        in_memory + on_disk
    }

    /// Memory-only lookup that does not touch ARC state or counters.
    pub async fn peek_memory(&self, key: &CacheKey) -> bool {
        self.memory.lock().await.contains(key)
    }

    pub async fn check_invariants(&self) -> bool {
        let memory_ok = self.memory.lock().await.check_invariants();
        let disk_ok = match &self.disk {
            Some(disk) => disk.check_invariants().await,
            None => true,
        };
        memory_ok && disk_ok
    }
}
