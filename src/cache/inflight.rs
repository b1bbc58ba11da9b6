//! Single-flight backend fetches, shared by `get` and the prefetch workers.
//!
//! At most one backend fetch per key is in flight. It runs on its own task,
//! so a waiter that gives up (timeout or a dropped future) never cancels it
//! for the others. `put` and invalidation mark the matching in-flight fetch
//! stale: its waiters still get the value, but it is not cached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::backend::{Backend, FetchError};
use crate::cache::entry::CacheKey;
use crate::cache::tiers::TieredStore;
use crate::error::{CacheError, Result};

#[derive(Debug, Clone)]
pub struct Fetched {
    /// `None` when the backend has no content for the key.
    pub value: Option<Bytes>,
    /// Whether the value made it into the tiers.
    pub cached: bool,
}

type SharedFetch = Shared<BoxFuture<'static, Result<Fetched>>>;

struct PendingFetch {
    id: u64,
    fetch: SharedFetch,
    stale: Arc<AtomicBool>,
}

type PendingMap = Arc<Mutex<HashMap<CacheKey, PendingFetch>>>;

pub struct FetchGroup {
    backend: Arc<dyn Backend>,
    store: Arc<TieredStore>,
    pending: PendingMap,
    next_id: AtomicU64,
}

impl FetchGroup {
    pub fn new(backend: Arc<dyn Backend>, store: Arc<TieredStore>) -> Self {
        Self {
            backend,
            store,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Join the in-flight fetch for `key`, or start one. `timeout` bounds
    /// the wait, and also the backend call when this starts it.
    pub async fn fetch(&self, key: CacheKey, timeout: Option<Duration>) -> Result<Fetched> {
        let fetch = {
            let mut pending = self.pending.lock().await;
            match pending.get(&key) {
                Some(inflight) => {
                    debug!(key = %key, "Joining in-flight fetch");
                    inflight.fetch.clone()
                }
                None => self.start(&mut pending, key, timeout),
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, fetch)
                .await
                .unwrap_or(Err(CacheError::BackendFetchTimeout)),
            None => fetch.await,
        }
    }

    /// Start a fetch only if none is in flight for `key`. Returns `None`
    /// when one already is; its leader accounts for the result.
    pub async fn prefetch(&self, key: CacheKey) -> Option<Result<Fetched>> {
        let fetch = {
            let mut pending = self.pending.lock().await;
            if pending.contains_key(&key) {
                return None;
            }
            self.start(&mut pending, key, None)
        };
        Some(fetch.await)
    }

    /// Detach the in-flight fetch for `key` so its value is not cached.
    pub async fn invalidate(&self, key: &CacheKey) {
        if let Some(inflight) = self.pending.lock().await.remove(key) {
            inflight.stale.store(true, Ordering::Release);
            debug!(key = %key, "In-flight fetch marked stale");
        }
    }

    pub async fn invalidate_prefix(&self, prefix: &[u8]) {
        self.pending.lock().await.retain(|key, inflight| {
            if key.starts_with(prefix) {
                inflight.stale.store(true, Ordering::Release);
                false
            } else {
                true
            }
        });
    }

    pub async fn in_flight(&self) -> usize {
        self.pending.lock().await.len()
    }

    fn start(
        &self,
        pending: &mut HashMap<CacheKey, PendingFetch>,
        key: CacheKey,
        timeout: Option<Duration>,
    ) -> SharedFetch {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stale = Arc::new(AtomicBool::new(false));
        let fetch = self.spawn(id, key.clone(), timeout, stale.clone());
        pending.insert(
            key,
            PendingFetch {
                id,
                fetch: fetch.clone(),
                stale,
            },
        );
        fetch
    }

    fn spawn(&self, id: u64, key: CacheKey, timeout: Option<Duration>, stale: Arc<AtomicBool>) -> SharedFetch {
        let backend = self.backend.clone();
        let store = self.store.clone();
        let pending = self.pending.clone();

        let task = tokio::spawn(async move {
            let result = match timeout {
                Some(limit) => tokio::time::timeout(limit, backend.fetch(&key)).await.ok(),
                None => Some(backend.fetch(&key).await),
            };

            // Filling under the pending lock orders it against `put` and
            // invalidation of the same key.
            let mut pending = pending.lock().await;
            let outcome = match result {
                None => {
                    warn!(key = %key, "Backend fetch timed out");
                    Err(CacheError::BackendFetchTimeout)
                }
                Some(Err(FetchError::NotFound)) => {
                    debug!(key = %key, "Backend has no content");
                    Ok(Fetched {
                        value: None,
                        cached: false,
                    })
                }
                Some(Err(e)) => {
                    warn!(key = %key, error = %e, "Backend fetch failed");
                    Err(CacheError::BackendFetchFailed(e))
                }
                Some(Ok(payload)) => {
                    let cached = if stale.load(Ordering::Acquire) {
                        debug!(key = %key, "Invalidated during fetch, not caching");
                        false
                    } else {
                        match store.admit(key.clone(), payload.clone()).await {
                            Ok(()) => true,
                            Err(e) => {
                                debug!(key = %key, error = %e, "Fetched value not cached");
                                false
                            }
                        }
                    };
                    Ok(Fetched {
                        value: Some(payload),
                        cached,
                    })
                }
            };

            if pending.get(&key).is_some_and(|p| p.id == id) {
                pending.remove(&key);
            }
            outcome
        });

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(CacheError::BackendFetchFailed(FetchError::Other(e.to_string()))),
            }
        }
        .boxed()
        .shared()
    }
}
