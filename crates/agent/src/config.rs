//! Agent configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tier_lib::collector::ReportConfig;
use tier_lib::settings::{OutboxSettings, TransportSettings};
use tier_lib::transport::Endpoint;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Name this host is known by at the manager
    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default = "default_manager_host")]
    pub manager_host: String,

    #[serde(default = "default_manager_port")]
    pub manager_port: u16,

    /// Port for threshold updates pushed by the manager
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Port for health and metrics
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Root of the proc filesystem
    #[serde(default = "default_proc_path")]
    pub proc_path: PathBuf,

    /// Metrics report interval in seconds
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,

    #[serde(default = "default_report_jitter")]
    pub report_jitter_secs: u64,

    /// Days of local history kept for local evaluation
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default)]
    pub transport: TransportSettings,

    #[serde(default)]
    pub outbox: OutboxSettings,
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_manager_host() -> String {
    "127.0.0.1".to_string()
}

fn default_manager_port() -> u16 {
    7070
}

fn default_listen_port() -> u16 {
    7071
}

fn default_health_port() -> u16 {
    7072
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/tierwatch/agent")
}

fn default_proc_path() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_report_interval() -> u64 {
    60
}

fn default_report_jitter() -> u64 {
    5
}

fn default_retention_days() -> u32 {
    7
}

impl AgentConfig {
    /// Load configuration from an optional TOML file and `TIER_AGENT_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("TIER_AGENT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read agent configuration")?;

        config
            .try_deserialize()
            .context("Invalid agent configuration")
    }

    pub fn manager(&self) -> Endpoint {
        Endpoint::new(self.manager_host.clone(), self.manager_port)
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    pub fn report(&self) -> ReportConfig {
        ReportConfig {
            interval: Duration::from_secs(self.report_interval_secs),
            jitter: Duration::from_secs(self.report_jitter_secs),
            retention_days: self.retention_days,
        }
    }
}
