//! Wiring of the manager's store, router, transport and coordinator

use crate::config::ManagerConfig;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tier_lib::{
    actions::{ActionRunner, CommandActions},
    handlers::{LifecycleHandler, MetricsHandler, StoreHealthHandler, ThresholdHandler},
    health::{components, HealthRegistry},
    lifecycle::{ConfirmationLoop, LifecycleCoordinator, StaticTierCatalog, TierCatalog},
    outbox::{FileOutboxStore, Outbox},
    store::FileStore,
    transport::{Messenger, TcpTransport},
    InstanceStatus, MessageRouter, NoticeKind, Repository, ShutdownSignal, StructuredLogger,
    ThresholdConfig,
};
use tracing::{info, warn};

/// Running services shared by the listener, the API and the sweep timer
pub struct Manager {
    pub repo: Repository,
    pub router: Arc<MessageRouter>,
    pub messenger: Arc<Messenger>,
    pub outbox: Arc<Outbox>,
    pub health: HealthRegistry,
}

impl Manager {
    /// Open the on-disk store and catalog named by `config`
    pub async fn open(
        config: &ManagerConfig,
        shutdown: ShutdownSignal,
        logger: StructuredLogger,
    ) -> Result<Self> {
        let store = FileStore::open(config.store_dir()).context("Failed to open record store")?;
        let repo = Repository::new(Arc::new(store));

        for compacted in [
            repo.compact_latest::<InstanceStatus>(),
            repo.compact_latest::<ThresholdConfig>(),
        ] {
            match compacted {
                Ok(dropped) => info!(dropped, "Compacted record store"),
                Err(e) => warn!(error = %e, "Failed to compact record store"),
            }
        }

        let catalog = match &config.catalog_file {
            Some(path) => StaticTierCatalog::from_file(path)?,
            None => {
                warn!("No tier catalog configured, tier changes will be abandoned");
                StaticTierCatalog::new()
            }
        };
        let actions = CommandActions::new(
            config.actions.commands.clone(),
            Duration::from_secs(config.actions.timeout_secs),
        );

        Self::assemble(
            config,
            repo,
            Arc::new(catalog),
            Arc::new(actions),
            shutdown,
            logger,
        )
        .await
    }

    /// Build the manager from explicit collaborators
    pub async fn assemble(
        config: &ManagerConfig,
        repo: Repository,
        catalog: Arc<dyn TierCatalog>,
        actions: Arc<dyn ActionRunner>,
        shutdown: ShutdownSignal,
        logger: StructuredLogger,
    ) -> Result<Self> {
        let health = HealthRegistry::new();
        for component in [
            components::LISTENER,
            components::OUTBOX,
            components::STORE,
            components::SCHEDULER,
        ] {
            health.register(component).await;
        }

        let transport = Arc::new(TcpTransport::new(shutdown.clone()));
        let outbox = Arc::new(
            Outbox::new(
                Arc::new(FileOutboxStore::new(config.outbox.dir_under(&config.data_dir))),
                transport.clone(),
                config.outbox.config(),
            )
            .with_logger(logger.clone())
            .with_health(health.clone()),
        );
        outbox.spawn_sweep_timer(config.outbox.sweep_interval(), shutdown.clone());
        let messenger = Arc::new(
            Messenger::new(transport, config.transport.policy()).with_outbox(outbox.clone()),
        );

        let confirmations = Arc::new(
            ConfirmationLoop::new(
                repo.clone(),
                actions.clone(),
                config.confirmation.settings(),
                shutdown,
            )
            .with_logger(logger.clone())
            .with_health(health.clone()),
        );
        let coordinator = Arc::new(LifecycleCoordinator::new(
            repo.clone(),
            catalog,
            actions,
            confirmations,
            logger.clone(),
        ));

        let router = MessageRouter::builder(&NoticeKind::ALL)
            .route_all(
                &NoticeKind::LIFECYCLE,
                StoreHealthHandler::wrap(
                    Arc::new(LifecycleHandler::new(coordinator.clone())),
                    health.clone(),
                ),
            )
            .route(
                NoticeKind::Metrics,
                StoreHealthHandler::wrap(
                    Arc::new(MetricsHandler::new(
                        repo.clone(),
                        coordinator,
                        config.retention_days,
                        logger,
                    )),
                    health.clone(),
                ),
            )
            .route(
                NoticeKind::Threshold,
                StoreHealthHandler::wrap(
                    Arc::new(ThresholdHandler::forwarding(
                        repo.clone(),
                        messenger.clone(),
                        config.agent_port,
                    )),
                    health.clone(),
                ),
            )
            .build()
            .context("Invalid notice routing")?;

        Ok(Self {
            repo,
            router: Arc::new(router),
            messenger,
            outbox,
            health,
        })
    }
}
