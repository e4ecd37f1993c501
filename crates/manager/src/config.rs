//! Manager configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tier_lib::actions::CommandTemplates;
use tier_lib::lifecycle::ConfirmationSettings;
use tier_lib::settings::{OutboxSettings, TransportSettings};
use tier_lib::transport::{ListenerOptions, DEFAULT_MAX_LINE_BYTES};

/// Manager configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Port for envelopes from agents and operators
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Port for health, metrics and the query API
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Root of the record store and default outbox directory
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Concurrent notice handlers
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Longest accepted envelope line in bytes
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,

    /// Days of resource history kept per host
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Port agents listen on for threshold updates
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,

    /// JSON tier catalog; without it no host resolves and tier changes are abandoned
    #[serde(default)]
    pub catalog_file: Option<PathBuf>,

    #[serde(default)]
    pub transport: TransportSettings,

    #[serde(default)]
    pub outbox: OutboxSettings,

    #[serde(default)]
    pub confirmation: ConfirmationConfig,

    #[serde(default)]
    pub actions: ActionsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    pub initial_delay_secs: u64,
    pub interval_secs: u64,
    pub max_retries: u32,
    pub pool_size: usize,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        let defaults = ConfirmationSettings::default();
        Self {
            initial_delay_secs: defaults.initial_delay.as_secs(),
            interval_secs: defaults.interval.as_secs(),
            max_retries: defaults.max_retries,
            pool_size: defaults.pool_size,
        }
    }
}

impl ConfirmationConfig {
    pub fn settings(&self) -> ConfirmationSettings {
        ConfirmationSettings {
            initial_delay: Duration::from_secs(self.initial_delay_secs),
            interval: Duration::from_secs(self.interval_secs),
            max_retries: self.max_retries,
            pool_size: self.pool_size,
        }
    }
}

/// Command templates for external actions
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActionsConfig {
    pub timeout_secs: u64,
    #[serde(flatten)]
    pub commands: CommandTemplates,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            commands: CommandTemplates::default(),
        }
    }
}

fn default_listen_port() -> u16 {
    7070
}

fn default_api_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/tierwatch/manager")
}

fn default_worker_pool_size() -> usize {
    16
}

fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}

fn default_retention_days() -> u32 {
    7
}

fn default_agent_port() -> u16 {
    7071
}

impl ManagerConfig {
    /// Load configuration from an optional TOML file and the environment.
    ///
    /// Environment variables use the `TIER_MANAGER_` prefix and `__` between
    /// nested keys, e.g. `TIER_MANAGER_OUTBOX__ENABLED=false`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("TIER_MANAGER_CONFIG").map(PathBuf::from));

        let mut builder = config::Config::builder();
        if let Some(path) = &path {
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("TIER_MANAGER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read manager configuration")?;

        config
            .try_deserialize()
            .context("Invalid manager configuration")
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    pub fn listener_options(&self) -> ListenerOptions {
        ListenerOptions::new(self.worker_pool_size).with_max_line_bytes(self.max_line_bytes)
    }
}
