use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrellisError};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| TrellisError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| TrellisError::Config(e.to_string()))
    }
}

/// Run-wide retry budget and backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total retries shared by all nodes in one run.
    #[serde(default = "default_max_total_retries")]
    pub max_total_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Uniform jitter ratio: delays scale by [1-jitter, 1+jitter].
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_total_retries: default_max_total_retries(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_total_retries() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter() -> f64 {
    0.2
}

/// How checkpoints for a run are retained.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Never prune.
    All,
    /// Replace the prior checkpoint on every save.
    #[default]
    LatestOnly,
    /// Keep the most recent `keep` checkpoints.
    PruneOld { keep: u64 },
}

/// Checkpoint / resume configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_enabled")]
    pub enabled: bool,
    /// Checkpoint after every N committed nodes (1 = every node).
    #[serde(default = "default_every_n_steps")]
    pub every_n_steps: u64,
    #[serde(default)]
    pub retention: RetentionPolicy,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            every_n_steps: default_every_n_steps(),
            retention: RetentionPolicy::default(),
        }
    }
}

fn default_checkpoint_enabled() -> bool {
    true
}
fn default_every_n_steps() -> u64 {
    1
}

/// Runtime guardrails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Per-stream ceiling on in-flight executions.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: usize,
    /// Completed results kept per stream before eviction.
    #[serde(default = "default_result_cache_size")]
    pub result_cache_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: default_max_concurrent(),
            result_cache_size: default_result_cache_size(),
        }
    }
}

fn default_max_concurrent() -> usize {
    8
}
fn default_result_cache_size() -> usize {
    64
}

/// Persistence backend tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file path. None = in-memory (tests, ephemeral runs).
    #[serde(default)]
    pub path: Option<String>,
    /// Interval at which buffered writes are flushed.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// How long a cached read stays valid.
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            flush_interval_ms: default_flush_interval_ms(),
            cache_ttl_ms: default_cache_ttl_ms(),
        }
    }
}

fn default_flush_interval_ms() -> u64 {
    1_000
}
fn default_cache_ttl_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.retry.max_total_retries, 5);
        assert_eq!(cfg.retry.base_delay_ms, 500);
        assert!(cfg.checkpoint.enabled);
        assert_eq!(cfg.checkpoint.every_n_steps, 1);
        assert_eq!(cfg.checkpoint.retention, RetentionPolicy::LatestOnly);
        assert_eq!(cfg.runtime.max_concurrent_executions, 8);
        assert!(cfg.store.path.is_none());
    }

    #[test]
    fn test_partial_toml() {
        let cfg = EngineConfig::from_toml(
            r#"
            [retry]
            max_total_retries = 2
            base_delay_ms = 10

            [checkpoint]
            retention = { policy = "prune_old", keep = 3 }

            [runtime]
            max_concurrent_executions = 2
            "#,
        )
        .unwrap();

        assert_eq!(cfg.retry.max_total_retries, 2);
        assert_eq!(cfg.retry.base_delay_ms, 10);
        // Unset fields fall back to defaults
        assert_eq!(cfg.retry.multiplier, 2.0);
        assert_eq!(cfg.checkpoint.retention, RetentionPolicy::PruneOld { keep: 3 });
        assert_eq!(cfg.runtime.max_concurrent_executions, 2);
        assert_eq!(cfg.store.flush_interval_ms, 1_000);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = EngineConfig::from_toml("retry = 7").unwrap_err();
        assert!(matches!(err, TrellisError::Config(_)));
    }
}
