//! Access pattern tracker: per-key access history and a directional
//! co-access model.
//!
//! Each key keeps a ring of its most recent access instants. Its score
//! sums one exponentially decayed term per remembered access, so it grows
//! with frequency and fades with age:
//!
//! ```text
//!   score(k, now) = Σ 0.5 ^ ((now - t_i) / half_life)
//! ```
//!
//! When `b` is accessed within `co_access_window` after `a`, the pair
//! `a → b` is counted. The prefetch planner uses these counts to predict
//! what follows an access.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::cache::entry::CacheKey;
use crate::config::TrackerConfig;

/// Upper bound on accesses remembered for co-access pairing.
const RECENT_LIMIT: usize = 1024;

#[derive(Debug)]
struct KeyHistory {
    ring: VecDeque<Instant>,
    followers: HashMap<CacheKey, u64>,
}

impl KeyHistory {
    fn last_access(&self) -> Option<Instant> {
        self.ring.back().copied()
    }
}

#[derive(Debug)]
pub struct AccessTracker {
    ring_capacity: usize,
    half_life: Duration,
    reap_ttl: Duration,
    window: Duration,
    max_followers: usize,
    keys: HashMap<CacheKey, KeyHistory>,
    recent: VecDeque<(Instant, CacheKey)>,
    /// Keys accessed since the planner last drained them.
    sources: HashSet<CacheKey>,
}

impl AccessTracker {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            ring_capacity: config.ring_capacity.max(1),
            half_life: Duration::from_secs(config.half_life_secs.max(1)),
            reap_ttl: Duration::from_secs(config.reap_ttl_seconds),
            window: Duration::from_millis(config.co_access_window_ms),
            max_followers: config.max_followers_per_key.max(1),
            keys: HashMap::new(),
            recent: VecDeque::new(),
            sources: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn record_access(&mut self, key: &CacheKey, at: Instant) {
        while let Some((t, _)) = self.recent.front() {
            if at.saturating_duration_since(*t) > self.window || self.recent.len() >= RECENT_LIMIT {
                self.recent.pop_front();
            } else {
                break;
            }
        }

        let leaders: HashSet<CacheKey> = self
            .recent
            .iter()
            .filter(|(_, k)| k != key)
            .map(|(_, k)| k.clone())
            .collect();
        for leader in leaders {
            if let Some(history) = self.keys.get_mut(&leader) {
                *history.followers.entry(key.clone()).or_insert(0) += 1;
                if history.followers.len() > self.max_followers {
                    if let Some(weakest) = history
                        .followers
                        .iter()
                        .filter(|(k, _)| *k != key)
                        .min_by_key(|(_, count)| **count)
                        .map(|(k, _)| k.clone())
                    {
                        history.followers.remove(&weakest);
                    }
                }
            }
        }

        let history = self.keys.entry(key.clone()).or_insert_with(|| KeyHistory {
            ring: VecDeque::with_capacity(self.ring_capacity),
            followers: HashMap::new(),
        });
        if history.ring.len() == self.ring_capacity {
            history.ring.pop_front();
        }
        history.ring.push_back(at);

        self.recent.push_back((at, key.clone()));
        self.sources.insert(key.clone());
    }

    /// Decayed access frequency. 0 for unknown keys.
    pub fn score(&self, key: &CacheKey, now: Instant) -> f64 {
        let Some(history) = self.keys.get(key) else {
            return 0.0;
        };
        let half_life = self.half_life.as_secs_f64();
        history
            .ring
            .iter()
            .map(|t| {
                let age = now.saturating_duration_since(*t).as_secs_f64();
                0.5f64.powf(age / half_life)
            })
            .sum()
    }

    /// How often `follower` was accessed shortly after `leader`.
    pub fn co_access_count(&self, leader: &CacheKey, follower: &CacheKey) -> u64 {
        self.keys
            .get(leader)
            .and_then(|h| h.followers.get(follower))
            .copied()
            .unwrap_or(0)
    }

    pub fn followers(&self, leader: &CacheKey) -> impl Iterator<Item = (&CacheKey, u64)> {
        self.keys
            .get(leader)
            .into_iter()
            .flat_map(|h| h.followers.iter().map(|(k, c)| (k, *c)))
    }

    /// Keys accessed since the last call.
    pub fn take_sources(&mut self) -> HashSet<CacheKey> {
        std::mem::take(&mut self.sources)
    }

    /// Forget keys idle for longer than the reap TTL. Returns how many went.
    pub fn reap(&mut self, now: Instant) -> usize {
        let ttl = self.reap_ttl;
        let before = self.keys.len();
        self.keys.retain(|_, h| {
            h.last_access()
                .is_some_and(|t| now.saturating_duration_since(t) <= ttl)
        });
        let reaped = before - self.keys.len();
        if reaped > 0 {
            let keys = &self.keys;
            let mut pruned = HashMap::new();
            for (leader, history) in keys {
                let dead: Vec<CacheKey> = history
                    .followers
                    .keys()
                    .filter(|f| !keys.contains_key(*f))
                    .cloned()
                    .collect();
                if !dead.is_empty() {
                    pruned.insert(leader.clone(), dead);
                }
            }
            for (leader, dead) in pruned {
                if let Some(history) = self.keys.get_mut(&leader) {
                    for follower in dead {
                        history.followers.remove(&follower);
                    }
                }
            }
            self.sources.retain(|k| self.keys.contains_key(k));
            debug!(reaped, remaining = self.keys.len(), "Reaped idle access history");
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> AccessTracker {
        AccessTracker::new(&TrackerConfig::default())
    }

    #[test]
    fn test_score_decays_with_half_life() {
        let mut t = tracker();
        let t0 = Instant::now();
        t.record_access(&"a".into(), t0);

        assert!((t.score(&"a".into(), t0) - 1.0).abs() < 1e-9);
        let later = t0 + Duration::from_secs(600);
        assert!((t.score(&"a".into(), later) - 0.5).abs() < 1e-9);
        assert_eq!(t.score(&"unknown".into(), later), 0.0);
    }

    #[test]
    fn test_score_grows_with_frequency() {
        let mut t = tracker();
        let t0 = Instant::now();
        t.record_access(&"once".into(), t0);
        for i in 0..5 {
            t.record_access(&"often".into(), t0 + Duration::from_secs(i * 10));
        }
        let now = t0 + Duration::from_secs(60);
        assert!(t.score(&"often".into(), now) > t.score(&"once".into(), now));
    }

    #[test]
    fn test_ring_is_bounded() {
        let config = TrackerConfig {
            ring_capacity: 4,
            ..TrackerConfig::default()
        };
        let mut t = AccessTracker::new(&config);
        let t0 = Instant::now();
        for _ in 0..10 {
            t.record_access(&"a".into(), t0);
        }
        assert!((t.score(&"a".into(), t0) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_co_access_is_directional_and_windowed() {
        let mut t = tracker();
        let t0 = Instant::now();
        t.record_access(&"a".into(), t0);
        t.record_access(&"b".into(), t0 + Duration::from_secs(1));
        // Outside the 5s window.
        t.record_access(&"c".into(), t0 + Duration::from_secs(10));

        assert_eq!(t.co_access_count(&"a".into(), &"b".into()), 1);
        assert_eq!(t.co_access_count(&"b".into(), &"a".into()), 0);
        assert_eq!(t.co_access_count(&"a".into(), &"c".into()), 0);
    }

    #[test]
    fn test_followers_bounded() {
        let config = TrackerConfig {
            max_followers_per_key: 2,
            ..TrackerConfig::default()
        };
        let mut t = AccessTracker::new(&config);
        let t0 = Instant::now();
        t.record_access(&"a".into(), t0);
        for f in ["x", "y", "z"] {
            t.record_access(&f.into(), t0);
        }
        assert_eq!(t.followers(&"a".into()).count(), 2);
    }

    #[test]
    fn test_reap_removes_idle_keys() {
        let mut t = tracker();
        let t0 = Instant::now();
        t.record_access(&"old".into(), t0);
        t.record_access(&"new".into(), t0 + Duration::from_secs(86_000));

        let reaped = t.reap(t0 + Duration::from_secs(86_401));
        assert_eq!(reaped, 1);
        assert_eq!(t.len(), 1);
        assert_eq!(t.score(&"old".into(), t0), 0.0);
    }

    #[test]
    fn test_take_sources_drains() {
        let mut t = tracker();
        let t0 = Instant::now();
        t.record_access(&"a".into(), t0);
        t.record_access(&"b".into(), t0);
        assert_eq!(t.take_sources().len(), 2);
        assert!(t.take_sources().is_empty());
    }
}
