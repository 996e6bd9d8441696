//! Service configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! `aggregator.toml` next to the working directory, then `AGGREGATOR_*`
//! environment variables.

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServiceConfig {
    /// Fallback tracing filter when `RUST_LOG` is unset.
    pub log_filter: String,

    // Storage locations
    pub log_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub snapshot_dir: PathBuf,

    // Pub/sub sink
    pub topic: String,
    pub topic_dir: PathBuf,

    // Trigger and delivery
    pub trigger_interval_secs: u64,
    pub poll_interval_ms: u64,
    pub max_delivery_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,

    // State snapshots
    pub snapshot_every_records: u64,
    pub snapshots_retained: usize,
    pub compress_snapshots: bool,

    /// Address for the health/metrics HTTP server; empty disables it.
    pub http_bind: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
            log_dir: PathBuf::from("data/records"),
            checkpoint_dir: PathBuf::from("data/checkpoints"),
            snapshot_dir: PathBuf::from("data/snapshots"),
            topic: "cal_avg_crypto_currency".to_string(),
            topic_dir: PathBuf::from("data/topics"),
            trigger_interval_secs: 10,
            poll_interval_ms: 200,
            max_delivery_attempts: 5,
            retry_base_ms: 500,
            retry_max_ms: 10_000,
            snapshot_every_records: 100_000,
            snapshots_retained: 3,
            compress_snapshots: true,
            http_bind: "127.0.0.1:9100".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Load from `aggregator.toml` (optional) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("aggregator")
    }

    /// Load with an explicit config file stem (extension inferred).
    pub fn load_from(file_stem: &str) -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Config::builder()
            .set_default("log_filter", d.log_filter)?
            .set_default("log_dir", d.log_dir.to_string_lossy().to_string())?
            .set_default("checkpoint_dir", d.checkpoint_dir.to_string_lossy().to_string())?
            .set_default("snapshot_dir", d.snapshot_dir.to_string_lossy().to_string())?
            .set_default("topic", d.topic)?
            .set_default("topic_dir", d.topic_dir.to_string_lossy().to_string())?
            .set_default("trigger_interval_secs", d.trigger_interval_secs)?
            .set_default("poll_interval_ms", d.poll_interval_ms)?
            .set_default("max_delivery_attempts", d.max_delivery_attempts)?
            .set_default("retry_base_ms", d.retry_base_ms)?
            .set_default("retry_max_ms", d.retry_max_ms)?
            .set_default("snapshot_every_records", d.snapshot_every_records)?
            .set_default("snapshots_retained", d.snapshots_retained as u64)?
            .set_default("compress_snapshots", d.compress_snapshots)?
            .set_default("http_bind", d.http_bind)?
            .add_source(File::with_name(file_stem).required(false))
            .add_source(Environment::with_prefix("AGGREGATOR"))
            .build()?;

        let loaded: ServiceConfig = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trigger_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "trigger_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_delivery_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_delivery_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry_base_ms > self.retry_max_ms {
            return Err(ConfigError::Invalid(format!(
                "retry_base_ms ({}) exceeds retry_max_ms ({})",
                self.retry_base_ms, self.retry_max_ms
            )));
        }
        if self.topic.trim().is_empty() {
            return Err(ConfigError::Invalid("topic must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn trigger_interval(&self) -> Duration {
        Duration::from_secs(self.trigger_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.trigger_interval(), Duration::from_secs(10));
        assert_eq!(config.topic, "cal_avg_crypto_currency");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let tmp = TempDir::new().unwrap();
        let stem = tmp.path().join("absent");
        let config = ServiceConfig::load_from(stem.to_str().unwrap()).unwrap();
        assert_eq!(config.max_delivery_attempts, 5);
        assert_eq!(config.retry_max_ms, 10_000);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("custom.toml");
        std::fs::write(
            &path,
            "trigger_interval_secs = 3\ntopic = \"averages\"\nhttp_bind = \"\"\n",
        )
        .unwrap();

        let stem = tmp.path().join("custom");
        let config = ServiceConfig::load_from(stem.to_str().unwrap()).unwrap();
        assert_eq!(config.trigger_interval_secs, 3);
        assert_eq!(config.topic, "averages");
        assert!(config.http_bind.is_empty());
        assert_eq!(config.poll_interval_ms, 200);
    }

    #[test]
    fn test_rejects_zero_interval() {
        let config = ServiceConfig {
            trigger_interval_secs: 0,
            ..ServiceConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let config = ServiceConfig {
            max_delivery_attempts: 0,
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let config = ServiceConfig {
            retry_base_ms: 20_000,
            retry_max_ms: 1_000,
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
