//! Notice handlers registered with the message router

use crate::engine::{MetricSample, ThresholdEngine};
use crate::envelope::{Envelope, Payload};
use crate::health::{components, HealthRegistry};
use crate::lifecycle::LifecycleCoordinator;
use crate::models::{ChangeRequest, ResourceHistorySample, ScalingMode, ThresholdConfig};
use crate::observability::{ScalerMetrics, StructuredLogger};
use crate::router::NoticeHandler;
use crate::store::{Repository, StoreError};
use crate::transport::{Endpoint, Messenger};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// INSTALL, UNINSTALL, UP and DOWN
pub struct LifecycleHandler {
    coordinator: Arc<LifecycleCoordinator>,
}

impl LifecycleHandler {
    pub fn new(coordinator: Arc<LifecycleCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl NoticeHandler for LifecycleHandler {
    async fn handle(&self, envelope: Envelope) -> Result<()> {
        self.coordinator.record_notice(&envelope).await?;
        Ok(())
    }
}

/// Evaluates METRICS reports, records them and drives tier changes
pub struct MetricsHandler {
    repo: Repository,
    engine: ThresholdEngine,
    coordinator: Arc<LifecycleCoordinator>,
    retention_days: u32,
    metrics: ScalerMetrics,
    logger: StructuredLogger,
}

impl MetricsHandler {
    pub fn new(
        repo: Repository,
        coordinator: Arc<LifecycleCoordinator>,
        retention_days: u32,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            engine: ThresholdEngine::new(repo.clone()),
            repo,
            coordinator,
            retention_days,
            metrics: ScalerMetrics::new(),
            logger,
        }
    }

    fn mode(&self, hostname: &str) -> ScalingMode {
        match self.repo.most_recent::<ThresholdConfig>(hostname) {
            Ok(Some(config)) => config.settings.mode,
            _ => ScalingMode::Auto,
        }
    }
}

#[async_trait]
impl NoticeHandler for MetricsHandler {
    async fn handle(&self, envelope: Envelope) -> Result<()> {
        let Payload::Metrics(report) = &envelope.payload else {
            bail!("expected a METRICS payload, got {}", envelope.kind());
        };
        let hostname = envelope.instance_name.as_str();
        let sample = MetricSample::from(report);

        // History is read before the live sample is recorded
        let decision = self.engine.evaluate(hostname, &sample);
        if report.change_request.is_some() && report.change_request != decision {
            debug!(
                hostname,
                agent = ?report.change_request,
                manager = ?decision,
                "Agent and manager decisions differ"
            );
        }

        self.repo
            .append(&ResourceHistorySample {
                hostname: hostname.to_string(),
                timestamp: envelope.timestamp,
                cpu_usage: sample.cpu,
                memory_usage: sample.memory,
                change_request: decision,
            })
            .with_context(|| format!("Failed to record metrics of {}", hostname))?;
        if let Err(e) = self
            .repo
            .prune_older_than::<ResourceHistorySample>(hostname, self.retention_days)
        {
            warn!(hostname, error = %e, "Failed to prune resource history");
        }

        let Some(direction) = decision else {
            return Ok(());
        };
        self.metrics.inc_decision(direction);
        if direction == ChangeRequest::Within {
            return Ok(());
        }
        self.logger
            .log_scale_decision(hostname, direction, sample.cpu, sample.memory);

        if self.mode(hostname) == ScalingMode::Manual {
            info!(hostname, direction = %direction, "Manual scaling mode, tier change not started");
            return Ok(());
        }

        self.coordinator
            .change_tier(hostname, direction)
            .await
            .with_context(|| format!("Failed to start tier change for {}", hostname))?;
        Ok(())
    }
}

/// Stores THRESHOLD updates, optionally forwarding them to the host's agent
pub struct ThresholdHandler {
    repo: Repository,
    forward: Option<(Arc<Messenger>, u16)>,
}

impl ThresholdHandler {
    /// Store only; used by the agent
    pub fn local(repo: Repository) -> Self {
        Self { repo, forward: None }
    }

    /// Store and forward to `<instance>:<agent_port>`; used by the manager
    pub fn forwarding(repo: Repository, messenger: Arc<Messenger>, agent_port: u16) -> Self {
        Self {
            repo,
            forward: Some((messenger, agent_port)),
        }
    }
}

#[async_trait]
impl NoticeHandler for ThresholdHandler {
    async fn handle(&self, envelope: Envelope) -> Result<()> {
        let Payload::Threshold(settings) = &envelope.payload else {
            bail!("expected a THRESHOLD payload, got {}", envelope.kind());
        };
        let hostname = envelope.instance_name.as_str();

        self.repo
            .append(&ThresholdConfig {
                hostname: hostname.to_string(),
                settings: settings.clone(),
                updated_at: Utc::now(),
            })
            .with_context(|| format!("Failed to store thresholds of {}", hostname))?;
        info!(
            hostname,
            continuity = settings.continuity,
            mode = ?settings.mode,
            "Threshold configuration updated"
        );

        if let Some((messenger, agent_port)) = &self.forward {
            let agent = Endpoint::new(hostname, *agent_port);
            let delivery = messenger.send(&agent, &envelope).await;
            debug!(hostname, agent = %agent, delivered = delivery.is_delivered(), "Forwarded thresholds");
        }
        Ok(())
    }
}

/// Reports the `store` component from the outcome of the wrapped handler.
///
/// An error whose chain holds a [`StoreError`] marks the store unhealthy;
/// a successful dispatch marks it healthy again. Other errors leave it as is.
pub struct StoreHealthHandler {
    inner: Arc<dyn NoticeHandler>,
    health: HealthRegistry,
}

impl StoreHealthHandler {
    pub fn wrap(inner: Arc<dyn NoticeHandler>, health: HealthRegistry) -> Arc<Self> {
        Arc::new(Self { inner, health })
    }
}

#[async_trait]
impl NoticeHandler for StoreHealthHandler {
    async fn handle(&self, envelope: Envelope) -> Result<()> {
        let result = self.inner.handle(envelope).await;
        match &result {
            Ok(()) => self.health.set_healthy(components::STORE).await,
            Err(e) => {
                let store_message = e
                    .chain()
                    .find_map(|c| c.downcast_ref::<StoreError>())
                    .map(|store_error| store_error.to_string());
                if let Some(store_message) = store_message {
                    self.health
                        .set_unhealthy(components::STORE, store_message)
                        .await;
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionError, ActionRunner};
    use crate::envelope::MetricsReport;
    use crate::lifecycle::{
        ConfirmationLoop, ConfirmationSettings, MachineInfo, StaticTierCatalog,
    };
    use crate::models::{ThresholdSettings, TierNames};
    use crate::shutdown::ShutdownSignal;
    use crate::transport::{Delivery, EnvelopeSender, RetryPolicy};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingActions {
        applied: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ActionRunner for CountingActions {
        async fn install(&self, _hostname: &str) -> Result<(), ActionError> {
            Ok(())
        }

        async fn uninstall(&self, _hostname: &str) -> Result<(), ActionError> {
            Ok(())
        }

        async fn apply_tier_change(&self, _hostname: &str, tier: &str) -> Result<(), ActionError> {
            self.applied.lock().unwrap().push(tier.to_string());
            Ok(())
        }

        async fn tier_change_complete(&self, _hostname: &str, _tier: &str) -> Result<bool, ActionError> {
            Ok(false)
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(Endpoint, Envelope)>>,
    }

    #[async_trait]
    impl EnvelopeSender for RecordingSender {
        async fn send(&self, endpoint: &Endpoint, envelope: &Envelope, _policy: &RetryPolicy) -> Delivery {
            self.sent.lock().unwrap().push((endpoint.clone(), envelope.clone()));
            Delivery::Delivered { attempts: 1 }
        }
    }

    fn metrics_handler(repo: &Repository, actions: Arc<CountingActions>) -> MetricsHandler {
        let catalog = StaticTierCatalog::new();
        catalog.insert_machine(
            "web-01",
            MachineInfo {
                machine_type: "n2".to_string(),
                region: "eu".to_string(),
                current_tier: None,
            },
        );
        catalog.insert_tier_link("n2", "eu", "l1");
        catalog.insert_tier_names(
            "l1",
            TierNames {
                high: "big".to_string(),
                standard: "mid".to_string(),
                micro: "small".to_string(),
            },
        );
        let confirmations = Arc::new(ConfirmationLoop::new(
            repo.clone(),
            actions.clone(),
            ConfirmationSettings {
                initial_delay: Duration::from_secs(60),
                ..ConfirmationSettings::default()
            },
            ShutdownSignal::never(),
        ));
        let coordinator = Arc::new(LifecycleCoordinator::new(
            repo.clone(),
            Arc::new(catalog),
            actions,
            confirmations,
            StructuredLogger::new("test"),
        ));
        MetricsHandler::new(repo.clone(), coordinator, 7, StructuredLogger::new("test"))
    }

    fn thresholds(repo: &Repository, continuity: u32, mode: ScalingMode) {
        let settings = ThresholdSettings {
            continuity,
            mode,
            ..ThresholdSettings::default()
        };
        repo.append(&ThresholdConfig {
            hostname: "web-01".to_string(),
            settings,
            updated_at: Utc::now(),
        })
        .unwrap();
    }

    fn metrics(cpu: f64) -> Envelope {
        Envelope::new(
            "web-01",
            "1.0.0",
            Payload::Metrics(MetricsReport {
                cpu_usage: Some(cpu),
                memory_usage: Some(50.0),
                change_request: None,
            }),
        )
    }

    #[tokio::test]
    async fn test_metrics_recorded_and_sustained_breach_changes_tier() {
        let repo = Repository::in_memory();
        let actions = Arc::new(CountingActions::default());
        let handler = metrics_handler(&repo, actions.clone());
        thresholds(&repo, 2, ScalingMode::Auto);

        handler.handle(metrics(85.0)).await.unwrap();
        assert!(actions.applied.lock().unwrap().is_empty());

        handler.handle(metrics(90.0)).await.unwrap();
        assert_eq!(*actions.applied.lock().unwrap(), vec!["big"]);

        let history: Vec<ResourceHistorySample> = repo.last_n("web-01", 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].change_request, Some(ChangeRequest::Upper));
        assert_eq!(history[1].change_request, None);
    }

    #[tokio::test]
    async fn test_manual_mode_does_not_change_tier() {
        let repo = Repository::in_memory();
        let actions = Arc::new(CountingActions::default());
        let handler = metrics_handler(&repo, actions.clone());
        thresholds(&repo, 1, ScalingMode::Manual);

        handler.handle(metrics(95.0)).await.unwrap();

        assert!(actions.applied.lock().unwrap().is_empty());
        let history: Vec<ResourceHistorySample> = repo.last_n("web-01", 10).unwrap();
        assert_eq!(history[0].change_request, Some(ChangeRequest::Upper));
    }

    #[tokio::test]
    async fn test_metrics_handler_rejects_other_payloads() {
        let repo = Repository::in_memory();
        let handler = metrics_handler(&repo, Arc::new(CountingActions::default()));
        assert!(handler
            .handle(Envelope::new("web-01", "1.0.0", Payload::Up))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_threshold_handler_stores_and_forwards() {
        let repo = Repository::in_memory();
        let sender = Arc::new(RecordingSender::default());
        let messenger = Arc::new(Messenger::new(sender.clone(), RetryPolicy::default()));
        let handler = ThresholdHandler::forwarding(repo.clone(), messenger, 7071);

        let mut settings = ThresholdSettings::default();
        settings.continuity = 5;
        handler
            .handle(Envelope::new("web-01", "cli", Payload::Threshold(settings.clone())))
            .await
            .unwrap();

        let stored: ThresholdConfig = repo.most_recent("web-01").unwrap().unwrap();
        assert_eq!(stored.settings, settings);

        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.to_string(), "web-01:7071");
    }

    #[tokio::test]
    async fn test_local_threshold_handler_does_not_forward() {
        let repo = Repository::in_memory();
        let handler = ThresholdHandler::local(repo.clone());
        handler
            .handle(Envelope::new(
                "web-01",
                "1.0.0",
                Payload::Threshold(ThresholdSettings::default()),
            ))
            .await
            .unwrap();
        assert!(repo.most_recent::<ThresholdConfig>("web-01").unwrap().is_some());
    }

    struct FailingStore;

    #[async_trait]
    impl NoticeHandler for FailingStore {
        async fn handle(&self, _envelope: Envelope) -> Result<()> {
            Err(StoreError::Io {
                path: "/var/lib/tierwatch/store".into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            })
            .context("Failed to record metrics of web-01")
        }
    }

    struct Rejecting;

    #[async_trait]
    impl NoticeHandler for Rejecting {
        async fn handle(&self, _envelope: Envelope) -> Result<()> {
            bail!("unexpected payload")
        }
    }

    #[tokio::test]
    async fn test_store_failure_marks_store_unhealthy() {
        use crate::health::ComponentStatus;

        let health = HealthRegistry::new();
        health.register(components::STORE).await;
        health.set_ready(true).await;

        let failing = StoreHealthHandler::wrap(Arc::new(FailingStore), health.clone());
        assert!(failing.handle(metrics(10.0)).await.is_err());
        assert_eq!(health.health().await.status, ComponentStatus::Unhealthy);
        assert!(!health.readiness().await.ready);

        let repo = Repository::in_memory();
        let working =
            StoreHealthHandler::wrap(Arc::new(ThresholdHandler::local(repo)), health.clone());
        working
            .handle(Envelope::new(
                "web-01",
                "1.0.0",
                Payload::Threshold(ThresholdSettings::default()),
            ))
            .await
            .unwrap();
        assert_eq!(health.health().await.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_other_errors_leave_store_health_alone() {
        use crate::health::ComponentStatus;

        let health = HealthRegistry::new();
        health.register(components::STORE).await;

        let handler = StoreHealthHandler::wrap(Arc::new(Rejecting), health.clone());
        assert!(handler.handle(metrics(10.0)).await.is_err());
        assert_eq!(health.health().await.status, ComponentStatus::Healthy);
    }
}
