//! Queue configuration.

use serde::{Deserialize, Serialize};

use crate::backoff::RetryBackoff;

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Execution budget for jobs that do not set their own.
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    /// Ownership lease stamped on every claim, in seconds. Jobs whose
    /// lease has expired can be re-queued by `reap_expired`.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Delay policy for retried jobs.
    #[serde(default)]
    pub backoff: RetryBackoff,

    /// How often idle workers poll for new jobs, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum random jitter added to idle polls, in milliseconds.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_lease_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_jitter_ms() -> u64 {
    100
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: default_max_attempts(),
            lease_secs: default_lease_secs(),
            backoff: RetryBackoff::default(),
            poll_interval_ms: default_poll_interval_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.default_max_attempts, 3);
        assert_eq!(config.lease_secs, 300);
        assert!(matches!(config.backoff, RetryBackoff::Exponential { .. }));
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let config: QueueConfig =
            serde_json::from_str(r#"{"lease_secs": 60, "backoff": {"strategy": "none"}}"#).unwrap();
        assert_eq!(config.lease_secs, 60);
        assert_eq!(config.backoff, RetryBackoff::None);
        assert_eq!(config.default_max_attempts, 3);
        assert_eq!(config.poll_interval_ms, 1000);
    }
}
