//! Metrics reporting loop
//!
//! Periodically samples the host, evaluates the sample against local
//! thresholds, records it in the local history and sends it to the manager.

use super::HostCollector;
use crate::engine::{MetricSample, ThresholdEngine};
use crate::envelope::{Envelope, MetricsReport, Payload};
use crate::health::{components, HealthRegistry};
use crate::models::{ChangeRequest, ResourceHistorySample, ThresholdConfig};
use crate::shutdown::ShutdownSignal;
use crate::store::Repository;
use crate::transport::{Delivery, Endpoint, Messenger};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ReportConfig {
    /// Base reporting interval (default: 60 seconds)
    pub interval: Duration,
    /// Maximum jitter added to the interval (default: 5 seconds)
    pub jitter: Duration,
    /// Days of local history to keep
    pub retention_days: u32,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            jitter: Duration::from_secs(5),
            retention_days: 7,
        }
    }
}

pub struct ReportLoop {
    collector: Arc<dyn HostCollector>,
    repo: Repository,
    engine: ThresholdEngine,
    messenger: Arc<Messenger>,
    manager: Endpoint,
    hostname: String,
    agent_version: String,
    health: Option<HealthRegistry>,
    config: ReportConfig,
}

impl ReportLoop {
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            manager = %self.manager,
            hostname = %self.hostname,
            "Starting metrics reporting loop"
        );

        let mut ticker = interval(self.current_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    match self.report_once().await {
                        Ok(delivery) => {
                            debug!(
                                delivered = delivery.is_delivered(),
                                elapsed_ms = start.elapsed().as_millis(),
                                "Report cycle complete"
                            );
                            self.set_collector_health(None).await;
                        }
                        Err(e) => {
                            warn!(error = %format!("{:#}", e), "Report cycle failed");
                            self.set_collector_health(Some(e.to_string())).await;
                        }
                    }

                    // Re-jitter every cycle
                    ticker = interval(self.current_interval());
                    ticker.tick().await;
                }
                _ = shutdown.triggered() => {
                    info!("Shutting down metrics reporting loop");
                    break;
                }
            }
        }
    }

    fn current_interval(&self) -> Duration {
        let jitter_ms = rand_jitter(self.config.jitter.as_millis() as u64);
        self.config.interval + Duration::from_millis(jitter_ms)
    }

    async fn set_collector_health(&self, failure: Option<String>) {
        let Some(health) = &self.health else {
            return;
        };
        match failure {
            None => health.set_healthy(components::COLLECTOR).await,
            Some(message) => health.set_degraded(components::COLLECTOR, message).await,
        }
    }

    /// Local decision, or `None` while no thresholds were received yet
    fn evaluate_locally(&self, sample: &MetricSample) -> Option<ChangeRequest> {
        match self.repo.most_recent::<ThresholdConfig>(&self.hostname) {
            Ok(Some(_)) => self.engine.evaluate(&self.hostname, sample),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Failed to read local thresholds");
                None
            }
        }
    }

    /// One collect, evaluate, record and send cycle
    pub async fn report_once(&self) -> Result<Delivery> {
        let sample = self.collector.collect().await?;
        let change_request = self.evaluate_locally(&sample);

        let record = ResourceHistorySample {
            hostname: self.hostname.clone(),
            timestamp: Utc::now(),
            cpu_usage: sample.cpu,
            memory_usage: sample.memory,
            change_request,
        };
        if let Err(e) = self.repo.append(&record) {
            warn!(error = %e, "Failed to record local history");
        }
        if let Err(e) = self
            .repo
            .prune_older_than::<ResourceHistorySample>(&self.hostname, self.config.retention_days)
        {
            warn!(error = %e, "Failed to prune local history");
        }

        let envelope = Envelope::new(
            self.hostname.clone(),
            self.agent_version.clone(),
            Payload::Metrics(MetricsReport {
                cpu_usage: sample.cpu,
                memory_usage: sample.memory,
                change_request,
            }),
        );

        Ok(self.messenger.send(&self.manager, &envelope).await)
    }
}

/// Generate a random jitter value between 0 and max_ms.
/// Drawn from the OS random source so agents started together drift apart.
fn rand_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }

    (uuid::Uuid::new_v4().as_u128() % u128::from(max_ms)) as u64
}

/// Builder for the reporting loop
#[derive(Default)]
pub struct ReportLoopBuilder {
    collector: Option<Arc<dyn HostCollector>>,
    repo: Option<Repository>,
    messenger: Option<Arc<Messenger>>,
    manager: Option<Endpoint>,
    hostname: Option<String>,
    agent_version: String,
    health: Option<HealthRegistry>,
    config: ReportConfig,
}

impl ReportLoopBuilder {
    pub fn new() -> Self {
        Self {
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        }
    }

    pub fn collector(mut self, collector: Arc<dyn HostCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Local store holding thresholds and history
    pub fn repository(mut self, repo: Repository) -> Self {
        self.repo = Some(repo);
        self
    }

    pub fn messenger(mut self, messenger: Arc<Messenger>) -> Self {
        self.messenger = Some(messenger);
        self
    }

    pub fn manager(mut self, manager: Endpoint) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn agent_version(mut self, version: impl Into<String>) -> Self {
        self.agent_version = version.into();
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.config.jitter = jitter;
        self
    }

    pub fn retention_days(mut self, days: u32) -> Self {
        self.config.retention_days = days;
        self
    }

    pub fn build(self) -> Result<ReportLoop> {
        let collector = self
            .collector
            .ok_or_else(|| anyhow::anyhow!("Collector is required"))?;
        let repo = self
            .repo
            .ok_or_else(|| anyhow::anyhow!("Repository is required"))?;
        let messenger = self
            .messenger
            .ok_or_else(|| anyhow::anyhow!("Messenger is required"))?;
        let manager = self
            .manager
            .ok_or_else(|| anyhow::anyhow!("Manager endpoint is required"))?;
        let hostname = self
            .hostname
            .filter(|h| !h.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Hostname is required"))?;

        Ok(ReportLoop {
            collector,
            engine: ThresholdEngine::new(repo.clone()),
            repo,
            messenger,
            manager,
            hostname,
            agent_version: self.agent_version,
            health: self.health,
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_config_default() {
        let config = ReportConfig::default();
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.jitter, Duration::from_secs(5));
        assert_eq!(config.retention_days, 7);
    }

    #[test]
    fn test_rand_jitter() {
        assert!(rand_jitter(1000) < 1000);
        assert_eq!(rand_jitter(0), 0);
    }

    #[test]
    fn test_rand_jitter_varies_between_calls() {
        let draws: std::collections::HashSet<u64> =
            (0..32).map(|_| rand_jitter(1_000_000)).collect();
        assert!(draws.len() > 1);
    }

    #[test]
    fn test_builder_missing_collector() {
        let result = ReportLoopBuilder::new()
            .repository(Repository::in_memory())
            .hostname("web-01")
            .build();

        let err = result.err().unwrap();
        assert_eq!(err.to_string(), "Collector is required");
    }
}
