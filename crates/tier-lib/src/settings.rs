//! Configuration sections shared by the manager and the agent

use crate::outbox::OutboxConfig;
use crate::transport::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// `transport` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub retry_max: u32,
    pub retry_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            retry_max: policy.retry_max,
            retry_interval_secs: policy.retry_interval.as_secs(),
            timeout_secs: policy.timeout.as_secs(),
        }
    }
}

impl TransportSettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_max: self.retry_max,
            retry_interval: Duration::from_secs(self.retry_interval_secs),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// `outbox` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxSettings {
    pub enabled: bool,
    /// Defaults to `<data_dir>/outbox`
    pub dir: Option<PathBuf>,
    pub rotation_hours: u64,
    pub sweep_interval_secs: u64,
    pub send_timeout_secs: u64,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            rotation_hours: 24,
            sweep_interval_secs: 60,
            send_timeout_secs: 10,
        }
    }
}

impl OutboxSettings {
    pub fn config(&self) -> OutboxConfig {
        OutboxConfig {
            enabled: self.enabled,
            rotation: Duration::from_secs(self.rotation_hours * 60 * 60),
            send_timeout: Duration::from_secs(self.send_timeout_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn dir_under(&self, data_dir: &Path) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| data_dir.join("outbox"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_defaults_match_policy() {
        assert_eq!(TransportSettings::default().policy(), RetryPolicy::default());
    }

    #[test]
    fn test_partial_outbox_section() {
        let settings: OutboxSettings =
            serde_json::from_str(r#"{"enabled": false, "rotation_hours": 2}"#).unwrap();
        assert!(!settings.enabled);
        assert_eq!(settings.config().rotation, Duration::from_secs(7200));
        assert_eq!(settings.sweep_interval_secs, 60);
        assert_eq!(
            settings.dir_under(Path::new("/var/lib/tierwatch")),
            PathBuf::from("/var/lib/tierwatch/outbox")
        );
    }
}
