//! Tier Agent - host metrics reporter
//!
//! Runs on every monitored host: announces itself to the manager, reports
//! CPU and memory utilisation, and keeps the thresholds the manager pushes.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tier_lib::{
    collector::{ProcCollector, ReportLoopBuilder},
    handlers::{StoreHealthHandler, ThresholdHandler},
    health::{components, HealthRegistry},
    outbox::{FileOutboxStore, Outbox},
    shutdown_channel,
    store::FileStore,
    transport::{self, ListenerOptions, Messenger, TcpTransport},
    Envelope, MessageRouter, NoticeKind, Payload, Repository, StructuredLogger,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "tier-agent", version, about = "Host agent for the tier scaling manager")]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "TIER_AGENT_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting tier-agent");

    let args = Args::parse();
    let config = config::AgentConfig::load(args.config.as_deref())?;
    info!(hostname = %config.hostname, manager = %config.manager(), "Agent configured");

    let logger = StructuredLogger::new(&config.hostname);
    let (trigger, shutdown) = shutdown_channel();

    let health = HealthRegistry::new();
    for component in [
        components::LISTENER,
        components::OUTBOX,
        components::STORE,
        components::COLLECTOR,
    ] {
        health.register(component).await;
    }

    let store = FileStore::open(config.store_dir()).context("Failed to open local store")?;
    let repo = Repository::new(Arc::new(store));

    let tcp = Arc::new(TcpTransport::new(shutdown.clone()));
    let outbox = Arc::new(
        Outbox::new(
            Arc::new(FileOutboxStore::new(config.outbox.dir_under(&config.data_dir))),
            tcp.clone(),
            config.outbox.config(),
        )
        .with_logger(logger.clone())
        .with_health(health.clone()),
    );
    outbox.spawn_sweep_timer(config.outbox.sweep_interval(), shutdown.clone());
    let messenger = Arc::new(
        Messenger::new(tcp, config.transport.policy()).with_outbox(outbox),
    );

    // Thresholds pushed by the manager
    let router = MessageRouter::builder(&[NoticeKind::Threshold])
        .route(
            NoticeKind::Threshold,
            StoreHealthHandler::wrap(
                Arc::new(ThresholdHandler::local(repo.clone())),
                health.clone(),
            ),
        )
        .build()
        .context("Invalid notice routing")?;
    let listen_addr = format!("0.0.0.0:{}", config.listen_port);
    let listener = transport::listen(
        listen_addr.as_str(),
        Arc::new(router),
        ListenerOptions::new(2),
    )
    .await
    .with_context(|| format!("Failed to listen on {}", listen_addr))?;
    logger.log_startup(AGENT_VERSION, &listener.local_addr().to_string());

    let manager = config.manager();
    let announce = |kind: NoticeKind| {
        let messenger = messenger.clone();
        let manager = manager.clone();
        let hostname = config.hostname.clone();
        async move {
            let Some(payload) = Payload::lifecycle(kind) else {
                return;
            };
            let delivery = messenger
                .send(&manager, &Envelope::new(hostname, AGENT_VERSION, payload))
                .await;
            if !delivery.is_delivered() {
                warn!(kind = %kind, "Lifecycle notice not delivered");
            }
        }
    };
    announce(NoticeKind::Up).await;

    let report_loop = ReportLoopBuilder::new()
        .collector(Arc::new(ProcCollector::with_proc_path(config.proc_path.clone())))
        .repository(repo)
        .messenger(messenger.clone())
        .manager(manager.clone())
        .hostname(config.hostname.clone())
        .agent_version(AGENT_VERSION)
        .health(health.clone())
        .interval(config.report().interval)
        .jitter(config.report().jitter)
        .retention_days(config.retention_days)
        .build()?;
    let report_handle = tokio::spawn(report_loop.run(shutdown));

    let health_port = config.health_port;
    let server_health = health.clone();
    tokio::spawn(async move {
        if let Err(e) = api::serve(health_port, server_health).await {
            error!(error = %format!("{:#}", e), "Health server stopped");
        }
    });
    health.set_ready(true).await;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health.set_ready(false).await;
    health
        .set_unhealthy(components::LISTENER, "Shutting down")
        .await;

    announce(NoticeKind::Down).await;
    trigger.trigger();
    listener.shutdown().await;
    if let Err(e) = report_handle.await {
        warn!(error = %e, "Report loop ended abnormally");
    }
    info!("Shutdown complete");

    Ok(())
}
