use drover_core::{DroverError, DroverResult, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Control-plane configuration.
///
/// Every field has a serde default, so a partial (or empty) TOML document is
/// valid. Heartbeat interval and liveness timeout are independent knobs: the
/// defaults (30s / 90s) tolerate two missed heartbeats before an agent ages
/// out of the active set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Where the SQLite store lives. `None` selects an in-memory store,
    /// which is only useful for tests and local experiments.
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    /// Seconds between heartbeat samples.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Seconds without a heartbeat after which an agent counts as dead.
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,
    /// Per-topic buffer size of the change-notification feed.
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,
    /// Backoff policy applied to automatically retried queue entries.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_heartbeat_interval_secs() -> u64 {
    drover_core::DEFAULT_HEARTBEAT_INTERVAL.as_secs()
}

fn default_liveness_timeout_secs() -> u64 {
    drover_core::DEFAULT_LIVENESS_TIMEOUT.as_secs()
}

fn default_feed_capacity() -> usize {
    drover_store::DEFAULT_FEED_CAPACITY
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            liveness_timeout_secs: default_liveness_timeout_secs(),
            feed_capacity: default_feed_capacity(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ControlPlaneConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(raw: &str) -> DroverResult<Self> {
        toml::from_str(raw).map_err(|e| DroverError::Config(e.to_string()))
    }

    /// Loads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> DroverResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// The heartbeat interval as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// The liveness timeout as a [`Duration`].
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_gets_defaults() {
        let config = ControlPlaneConfig::from_toml_str("").unwrap();
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.liveness_timeout_secs, 90);
        assert!(config.store_path.is_none());
        assert_eq!(config.retry.base_delay_secs, 5);
    }

    #[test]
    fn test_partial_document_overrides() {
        let config = ControlPlaneConfig::from_toml_str(
            r#"
            store_path = "/var/lib/drover/drover.db"
            liveness_timeout_secs = 120

            [retry]
            base_delay_secs = 2
            jitter = false
            "#,
        )
        .unwrap();
        assert_eq!(
            config.store_path.as_deref(),
            Some(Path::new("/var/lib/drover/drover.db"))
        );
        assert_eq!(config.liveness_timeout_secs, 120);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.retry.base_delay_secs, 2);
        assert!(!config.retry.jitter);
    }

    #[test]
    fn test_malformed_document_is_config_error() {
        let err = ControlPlaneConfig::from_toml_str("liveness_timeout_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, DroverError::Config(_)));
    }
}
