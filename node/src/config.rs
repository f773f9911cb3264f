//! Node configuration with TOML file support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::block_processor::BlockProcessorConfig;
use crate::NodeError;
use quill_consensus::{HintedSchedulerConfig, VoteCacheConfig};

/// Configuration for a Quill node.
///
/// Can be loaded from a TOML file via [`NodeConfig::from_toml_file`] or
/// built programmatically (e.g. for tests).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Dev-network mode: relaxed vote filtering and short election
    /// timings, for single-machine testing.
    #[serde(default)]
    pub dev_network: bool,

    /// Maximum blocks queued in the block processor before ingress is
    /// dropped.
    #[serde(default = "default_processor_full_size")]
    pub processor_full_size: usize,

    /// Upper bound on blocks committed per ledger write transaction.
    #[serde(default = "default_batch_max_count")]
    pub batch_max_count: usize,

    /// Per-batch deadline in milliseconds.
    #[serde(default = "default_batch_max_time_ms")]
    pub batch_max_time_ms: u64,

    /// How long a blocking block submission waits for its result, in
    /// milliseconds.
    #[serde(default = "default_add_timeout_ms")]
    pub add_timeout_ms: u64,

    /// Maximum concurrent elections.
    #[serde(default = "default_max_elections")]
    pub max_elections: usize,

    /// Maximum entries in the vote cache.
    #[serde(default = "default_vote_cache_size")]
    pub vote_cache_size: usize,

    /// Vote-cache tally threshold for hinted elections, as a percent of
    /// trended online weight.
    #[serde(default = "default_hinting_threshold_percent")]
    pub hinting_threshold_percent: u8,

    /// Online weight assumed for quorum when none is measured, in raw
    /// units.
    #[serde(default = "default_trended_weight")]
    pub trended_weight: u128,

    /// Quorum delta as a percent of trended online weight.
    #[serde(default = "default_quorum_percent")]
    pub quorum_percent: u8,

    /// Log format: "human" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Log level filter: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Whether to enable Prometheus metrics.
    #[serde(default)]
    pub enable_metrics: bool,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_processor_full_size() -> usize {
    65536
}

fn default_batch_max_count() -> usize {
    256
}

fn default_batch_max_time_ms() -> u64 {
    500
}

fn default_add_timeout_ms() -> u64 {
    30_000
}

fn default_max_elections() -> usize {
    5000
}

fn default_vote_cache_size() -> usize {
    65536
}

fn default_hinting_threshold_percent() -> u8 {
    10
}

fn default_trended_weight() -> u128 {
    1_000_000
}

fn default_quorum_percent() -> u8 {
    67
}

fn default_log_format() -> String {
    "human".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// ── Impl ───────────────────────────────────────────────────────────────

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| NodeError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| NodeError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// The quorum delta in raw units.
    pub fn quorum_delta(&self) -> u128 {
        self.trended_weight / 100 * self.quorum_percent as u128
    }

    pub fn processor_config(&self) -> BlockProcessorConfig {
        BlockProcessorConfig {
            full_size: self.processor_full_size,
            batch_max_count: self.batch_max_count,
            batch_max_time: Duration::from_millis(self.batch_max_time_ms),
            add_timeout: Duration::from_millis(self.add_timeout_ms),
        }
    }

    pub fn vote_cache_config(&self) -> VoteCacheConfig {
        VoteCacheConfig {
            max_size: self.vote_cache_size,
            ..Default::default()
        }
    }

    pub fn hinted_config(&self) -> HintedSchedulerConfig {
        HintedSchedulerConfig {
            hinting_threshold_percent: self.hinting_threshold_percent,
            ..Default::default()
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            dev_network: false,
            processor_full_size: default_processor_full_size(),
            batch_max_count: default_batch_max_count(),
            batch_max_time_ms: default_batch_max_time_ms(),
            add_timeout_ms: default_add_timeout_ms(),
            max_elections: default_max_elections(),
            vote_cache_size: default_vote_cache_size(),
            hinting_threshold_percent: default_hinting_threshold_percent(),
            trended_weight: default_trended_weight(),
            quorum_percent: default_quorum_percent(),
            log_format: default_log_format(),
            log_level: default_log_level(),
            enable_metrics: false,
        }
    }
}
