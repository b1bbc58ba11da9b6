//! vfs-cache-tier: tiered cache and predictive prefetch for a
//! content-addressed virtual filesystem.
//!
//! Payloads move through two byte tiers, each run by its own ARC policy:
//!   Memory (hot) → Disk (warm) → backend (source of truth)
//!
//! A semantic cache answers near-duplicate queries by embedding similarity,
//! and a background prefetcher warms keys that usually follow recent ones.

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod server;

pub use backend::{Backend, DirectoryBackend, EmbedError, Embedder, FetchError, FnBackend};
pub use cache::coordinator::{Coordinator, GetOptions, SemanticQuery};
pub use cache::entry::{CacheKey, Tier};
pub use cache::stats::StatsSnapshot;
pub use config::Config;
pub use error::{CacheError, Result};
