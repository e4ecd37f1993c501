//! Tierwatch CLI
//!
//! Sends lifecycle notices and threshold updates to the tier manager and
//! queries instance status, resource history and thresholds.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{notify, status, thresholds};

const DEFAULT_MANAGER: &str = "127.0.0.1:7070";
const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";

/// Tierwatch CLI
#[derive(Parser)]
#[command(name = "tierctl")]
#[command(author, version, about = "CLI for the tierwatch tier scaling manager", long_about = None)]
pub struct Cli {
    /// Manager envelope address, host:port (can also be set via TIERCTL_MANAGER env var)
    #[arg(long, env = "TIERCTL_MANAGER")]
    pub manager: Option<String>,

    /// Manager query API URL (can also be set via TIERCTL_API_URL env var)
    #[arg(long, env = "TIERCTL_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short, value_enum)]
    pub format: Option<output::OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send a lifecycle notice for a host
    Notify {
        /// Notice to send
        #[arg(value_enum)]
        notice: notify::Notice,

        /// Host name
        host: String,
    },

    /// Manage scaling thresholds
    #[command(subcommand)]
    Thresholds(ThresholdCommands),

    /// Show instance status
    Status {
        /// Host name (all hosts if not specified)
        host: Option<String>,
    },

    /// Show resource history of a host
    History {
        /// Host name
        host: String,

        /// Trailing window in minutes
        #[arg(long, default_value_t = 60)]
        minutes: u32,
    },
}

#[derive(Subcommand)]
pub enum ThresholdCommands {
    /// Update thresholds; unspecified values keep their current setting
    Set {
        /// Host name
        host: String,

        #[command(flatten)]
        overrides: thresholds::ThresholdOverrides,
    },

    /// Show stored thresholds
    Get {
        /// Host name
        host: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let file = config::Config::load()?;

    let format = match cli.format {
        Some(format) => format,
        None => match file.default_format.as_deref() {
            Some(name) => name.parse().map_err(anyhow::Error::msg)?,
            None => output::OutputFormat::default(),
        },
    };
    let manager_addr = cli
        .manager
        .or(file.manager)
        .unwrap_or_else(|| DEFAULT_MANAGER.to_string());
    let api_url = cli
        .api_url
        .or(file.api_url)
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());

    // Initialize client
    let client = client::ApiClient::new(&api_url)?;

    // Execute command
    match cli.command {
        Commands::Notify { notice, host } => {
            let manager = commands::parse_endpoint(&manager_addr)?;
            notify::send_notice(&manager, notice, &host, format).await?;
        }
        Commands::Thresholds(threshold_cmd) => match threshold_cmd {
            ThresholdCommands::Set { host, overrides } => {
                let manager = commands::parse_endpoint(&manager_addr)?;
                thresholds::set_thresholds(&client, &manager, &host, &overrides, format).await?;
            }
            ThresholdCommands::Get { host } => {
                thresholds::get_thresholds(&client, &host, format).await?;
            }
        },
        Commands::Status { host } => {
            status::show_status(&client, host.as_deref(), format).await?;
        }
        Commands::History { host, minutes } => {
            status::show_history(&client, &host, minutes, format).await?;
        }
    }

    Ok(())
}
