//! Tiered cache management.
//!
//! - [`entry`]: CacheKey, CacheEntry, Tier definitions
//! - [`arc`]: byte-weighted ARC state machine shared by both tiers
//! - [`memory`], [`disk`]: the byte tiers
//! - [`segment`], [`compressor`]: on-disk layout and payload encoding
//! - [`tiers`]: cascade on eviction, promotion on disk hits
//! - [`inflight`]: single-flight backend fetches
//! - [`tracker`], [`prefetcher`]: access history and predictive prefetch
//! - [`semantic`]: embedding-similarity cache
//! - [`stats`]: lock-free counters and the stats snapshot
//! - [`coordinator`]: the public façade

pub mod arc;
pub mod compressor;
pub mod coordinator;
pub mod disk;
pub mod entry;
pub mod inflight;
pub mod memory;
pub mod prefetcher;
pub mod segment;
pub mod semantic;
pub mod stats;
pub mod tiers;
pub mod tracker;
