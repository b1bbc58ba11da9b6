//! Error taxonomy for the cache engine.
//!
//! Tier-internal failures (disk I/O, corrupted payloads) are recovered
//! locally by the tier that hit them; only backend and embedding failures
//! reach the original caller of [`crate::cache::coordinator::Coordinator::get`].

use thiserror::Error;

use crate::backend::{EmbedError, FetchError};
use crate::cache::entry::Tier;
use crate::config::ConfigError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    /// The value is larger than the whole tier. Not retried.
    #[error("value of {size} bytes exceeds {tier} tier capacity of {capacity} bytes")]
    TooLarge { tier: Tier, size: u64, capacity: u64 },

    /// A disk write failed. The memory copy stays authoritative.
    #[error("disk write failed: {0}")]
    DiskWriteFailed(String),

    #[error("backend fetch failed: {0}")]
    BackendFetchFailed(#[from] FetchError),

    #[error("backend fetch timed out")]
    BackendFetchTimeout,

    #[error("embedding has {actual} dimensions, expected {expected}")]
    EmbeddingDimensionMismatch { expected: usize, actual: usize },

    #[error("embedding failed: {0}")]
    EmbeddingFailed(#[from] EmbedError),

    /// A reloaded payload did not match its recorded checksum.
    #[error("corrupted disk entry {key}: {reason}")]
    CorruptedEntry { key: String, reason: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}

impl From<ConfigError> for CacheError {
    fn from(err: ConfigError) -> Self {
        CacheError::InvalidConfig(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
