//! Runtime configuration for vfs-cache-tier.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Every section falls back to its defaults for missing fields; unknown
//! fields are rejected so typos do not silently run with defaults.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "vfs-cache-tier", about = "Tiered cache and prefetch engine for a content-addressed VFS")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Stats HTTP listen address. Overrides `server.listen`.
    #[arg(long)]
    pub listen: Option<String>,

    /// Directory the demo backend reads content from.
    #[arg(long, default_value = ".")]
    pub backend_root: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub tiers: TierConfig,
    pub compression: CompressionConfig,
    pub tracker: TrackerConfig,
    pub prefetch: PrefetchConfig,
    pub semantic: SemanticConfig,
    pub server: ServerConfig,
}

/// Tier capacities and the disk location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TierConfig {
    /// Memory tier budget in bytes. 0 turns the tier into a pass-through.
    pub memory_capacity_bytes: u64,

    /// Disk tier budget in bytes (stored, i.e. post-compression). 0 disables the tier.
    pub disk_capacity_bytes: u64,

    /// Directory holding segment files and the index log.
    pub disk_path: PathBuf,

    /// Reload disk contents across restarts.
    pub disk_persistence: bool,

    /// A new segment file starts when the active one would exceed this.
    pub segment_size_bytes: u64,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            memory_capacity_bytes: 256 * 1024 * 1024, // 256 MiB
            disk_capacity_bytes: 4 * 1024 * 1024 * 1024, // 4 GiB
            disk_path: PathBuf::from("/tmp/vfs-cache"),
            disk_persistence: false,
            segment_size_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Compression of payloads written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompressionConfig {
    /// Apply zstd compression when writing to disk.
    pub disk_zstd_compression: bool,

    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            disk_zstd_compression: false,
            zstd_level: 3,
        }
    }
}

/// Access pattern tracker tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackerConfig {
    /// Access timestamps kept per key.
    pub ring_capacity: usize,

    /// Half-life of an access's contribution to a key's score.
    pub half_life_secs: u64,

    /// Keys idle for longer than this are forgotten.
    pub reap_ttl_seconds: u64,

    /// Accesses this close together count as co-accesses.
    pub co_access_window_ms: u64,

    /// Followers remembered per key.
    pub max_followers_per_key: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 32,
            half_life_secs: 600,
            reap_ttl_seconds: 86_400,
            co_access_window_ms: 5_000,
            max_followers_per_key: 64,
        }
    }
}

/// Predictive prefetch settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrefetchConfig {
    pub enabled: bool,

    /// Period of the prefetch scan.
    pub prefetch_interval_ms: u64,

    /// Accesses since the last scan that trigger an early one.
    pub trigger_after_accesses: u64,

    /// Candidates produced per scan.
    pub top_k: usize,

    /// Bounded work queue depth; overflow drops the lowest score.
    pub prefetch_queue_depth: usize,

    pub prefetch_worker_count: usize,

    /// Capacity of the access event channel feeding the tracker.
    pub event_buffer: usize,

    /// A prefetched key accessed within this window counts as a hit.
    pub hit_ttl_ms: u64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefetch_interval_ms: 30_000,
            trigger_after_accesses: 64,
            top_k: 10,
            prefetch_queue_depth: 100,
            prefetch_worker_count: 2,
            event_buffer: 4096,
            hit_ttl_ms: 600_000,
        }
    }
}

/// Semantic cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SemanticConfig {
    /// Minimum cosine similarity for a hit, inclusive.
    pub similarity_threshold: f64,

    /// Maximum entries before LRU eviction.
    pub semantic_cache_capacity: usize,

    pub embedding_dimension: usize,

    /// Reported in stats only.
    pub embedding_model_name: String,

    /// Larger payloads are stored by key and resolved through the byte tiers.
    pub inline_payload_max_bytes: usize,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.92,
            semantic_cache_capacity: 10_000,
            embedding_dimension: 384,
            embedding_model_name: "all-MiniLM-L6-v2".to_string(),
            inline_payload_max_bytes: 4096,
        }
    }
}

/// Stats HTTP server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9464".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when
    /// the file does not exist. The result is validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            Self::from_json(&data).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        let threshold = self.semantic.similarity_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(invalid(
                "semantic.similarity_threshold",
                format!("{threshold} is outside [0, 1]"),
            ));
        }
        if self.semantic.embedding_dimension == 0 {
            return Err(invalid("semantic.embedding_dimension", "must be positive"));
        }
        if !(1..=22).contains(&self.compression.zstd_level) {
            return Err(invalid(
                "compression.zstd_level",
                format!("{} is outside 1..=22", self.compression.zstd_level),
            ));
        }
        if self.tiers.segment_size_bytes == 0 {
            return Err(invalid("tiers.segment_size_bytes", "must be positive"));
        }
        if self.tracker.ring_capacity == 0 {
            return Err(invalid("tracker.ring_capacity", "must be positive"));
        }
        if self.tracker.half_life_secs == 0 {
            return Err(invalid("tracker.half_life_secs", "must be positive"));
        }
        if self.prefetch.prefetch_interval_ms == 0 {
            return Err(invalid("prefetch.prefetch_interval_ms", "must be positive"));
        }
        if self.prefetch.prefetch_queue_depth == 0 {
            return Err(invalid("prefetch.prefetch_queue_depth", "must be positive"));
        }
        if self.prefetch.event_buffer == 0 {
            return Err(invalid("prefetch.event_buffer", "must be positive"));
        }
        if self.prefetch.enabled && self.prefetch.prefetch_worker_count == 0 {
            return Err(invalid(
                "prefetch.prefetch_worker_count",
                "must be positive while prefetch is enabled",
            ));
        }
        Ok(())
    }
}
