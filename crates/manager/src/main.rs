//! Tier Manager - fleet tier scaling manager
//!
//! Receives lifecycle and metrics envelopes from host agents, evaluates
//! thresholds, drives tier changes and serves the query API.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tier_lib::{health::components, shutdown_channel, transport, StructuredLogger};
use tier_manager::{api, app::Manager, config::ManagerConfig};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const MANAGER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "tier-manager", version, about = "Fleet tier scaling manager")]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "TIER_MANAGER_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting tier-manager");

    let args = Args::parse();
    let config = ManagerConfig::load(args.config.as_deref())?;
    info!(data_dir = %config.data_dir.display(), "Manager configured");

    let logger = StructuredLogger::new("tier-manager");
    let (trigger, shutdown) = shutdown_channel();
    let manager = Manager::open(&config, shutdown, logger.clone()).await?;

    let listen_addr = format!("0.0.0.0:{}", config.listen_port);
    let listener = transport::listen(
        listen_addr.as_str(),
        manager.router.clone(),
        config.listener_options(),
    )
    .await
    .with_context(|| format!("Failed to listen on {}", listen_addr))?;
    logger.log_startup(MANAGER_VERSION, &listener.local_addr().to_string());

    // Start health, metrics and query server
    let app_state = Arc::new(api::AppState::new(
        manager.health.clone(),
        manager.repo.clone(),
    ));
    let api_port = config.api_port;
    tokio::spawn(async move {
        if let Err(e) = api::serve(api_port, app_state).await {
            error!(error = %format!("{:#}", e), "API server stopped");
        }
    });

    manager.health.set_ready(true).await;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");

    manager.health.set_ready(false).await;
    manager
        .health
        .set_unhealthy(components::LISTENER, "Shutting down")
        .await;
    trigger.trigger();
    listener.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}
