//! Outbox for envelopes the transport could not deliver
//!
//! Entries are persisted after a failed send and retried by a resend sweep.
//! Only one sweep runs at a time per outbox; triggers that arrive while a
//! sweep is active are dropped. A sweep walks entries oldest first, drops
//! those past the rotation age, and stops at the first entry that still
//! cannot be delivered so ordering toward a destination is kept.

mod store;

pub use store::{FileOutboxStore, MemoryOutboxStore, OutboxStore};

use crate::envelope::Envelope;
use crate::health::{components, HealthRegistry};
use crate::observability::{ScalerMetrics, StructuredLogger};
use crate::shutdown::ShutdownSignal;
use crate::store::StoreResult;
use crate::transport::{Endpoint, EnvelopeSender, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// An undelivered envelope and where it was going
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub endpoint: Endpoint,
    pub envelope: Envelope,
}

impl OutboxEntry {
    pub fn new(endpoint: Endpoint, envelope: Envelope) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            endpoint,
            envelope,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// When false, failed sends are dropped instead of persisted
    pub enabled: bool,
    /// Entries older than this are deleted without a delivery attempt
    pub rotation: Duration,
    /// Timeout of each single-attempt resend
    pub send_timeout: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rotation: Duration::from_secs(24 * 60 * 60),
            send_timeout: Duration::from_secs(10),
        }
    }
}

/// Summary of one resend sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub delivered: usize,
    pub expired: usize,
    /// The sweep stopped at an entry that could not be delivered
    pub halted: bool,
}

/// Clears the single-flight flag when the sweep ends, however it ends
struct SweepGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for SweepGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct Outbox {
    store: Arc<dyn OutboxStore>,
    sender: Arc<dyn EnvelopeSender>,
    config: OutboxConfig,
    sweeping: Arc<AtomicBool>,
    metrics: ScalerMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl Outbox {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        sender: Arc<dyn EnvelopeSender>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            store,
            sender,
            config,
            sweeping: Arc::new(AtomicBool::new(false)),
            metrics: ScalerMetrics::new(),
            logger: StructuredLogger::new("outbox"),
            health: None,
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Report the `outbox` component after every sweep: degraded while a
    /// sweep halts with entries left, unhealthy when the store cannot be listed
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Store an undelivered envelope. Returns `false` when archiving is disabled.
    pub fn persist(&self, endpoint: &Endpoint, envelope: &Envelope) -> StoreResult<bool> {
        if !self.config.enabled {
            debug!(envelope_id = %envelope.id, "Outbox disabled, dropping envelope");
            return Ok(false);
        }

        self.store
            .put(&OutboxEntry::new(endpoint.clone(), envelope.clone()))?;
        if let Ok(pending) = self.store.list() {
            self.metrics.set_outbox_pending(pending.len());
        }
        Ok(true)
    }

    /// Pending entries, oldest first
    pub fn pending(&self) -> StoreResult<Vec<OutboxEntry>> {
        self.store.list()
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeping.load(Ordering::Acquire)
    }

    fn try_begin(&self) -> Option<SweepGuard> {
        self.sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SweepGuard {
                flag: Arc::clone(&self.sweeping),
            })
    }

    /// Start a background sweep unless one is already running.
    /// Returns whether a sweep was started.
    pub fn trigger_resend(self: &Arc<Self>) -> bool {
        let Some(guard) = self.try_begin() else {
            debug!("Resend sweep already running, trigger dropped");
            return false;
        };

        let outbox = Arc::clone(self);
        tokio::spawn(async move {
            outbox.run_sweep(guard).await;
        });
        true
    }

    /// Sweep in the calling task. `None` if another sweep holds the flag.
    pub async fn sweep(&self) -> Option<SweepReport> {
        let guard = self.try_begin()?;
        Some(self.run_sweep(guard).await)
    }

    /// Trigger a resend every `every` until shutdown, so entries are retried
    /// even when no fresh send succeeds
    pub fn spawn_sweep_timer(
        self: &Arc<Self>,
        every: Duration,
        mut shutdown: ShutdownSignal,
    ) -> JoinHandle<()> {
        let outbox = Arc::clone(self);
        tokio::spawn(async move {
            while shutdown.sleep(every).await {
                outbox.trigger_resend();
            }
            debug!("Outbox sweep timer stopped");
        })
    }

    async fn run_sweep(&self, _guard: SweepGuard) -> SweepReport {
        let mut report = SweepReport::default();

        let entries = match self.store.list() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Failed to list outbox entries");
                report.halted = true;
                if let Some(health) = &self.health {
                    health
                        .set_unhealthy(components::OUTBOX, format!("Outbox unreadable: {}", e))
                        .await;
                }
                return report;
            }
        };
        if entries.is_empty() {
            self.metrics.set_outbox_pending(0);
            self.report_health(0).await;
            return report;
        }

        let total = entries.len();
        let policy = RetryPolicy::single_attempt(self.config.send_timeout);
        let now = Utc::now();

        for entry in entries {
            let expired = now
                .signed_duration_since(entry.created_at)
                .to_std()
                .map(|age| age > self.config.rotation)
                .unwrap_or(false);

            if expired {
                debug!(entry_id = %entry.id, created_at = %entry.created_at, "Dropping expired outbox entry");
                if let Err(e) = self.store.remove(&entry) {
                    warn!(entry_id = %entry.id, error = %e, "Failed to remove expired outbox entry");
                    report.halted = true;
                    break;
                }
                report.expired += 1;
                continue;
            }

            let delivery = self
                .sender
                .send(&entry.endpoint, &entry.envelope, &policy)
                .await;
            if !delivery.is_delivered() {
                report.halted = true;
                break;
            }

            if let Err(e) = self.store.remove(&entry) {
                // Delivered but still on disk; it will be sent again next sweep
                warn!(entry_id = %entry.id, error = %e, "Failed to remove delivered outbox entry");
                report.halted = true;
                break;
            }
            report.delivered += 1;
        }

        self.metrics.inc_outbox_resent(report.delivered);
        self.metrics.inc_outbox_expired(report.expired);
        let pending = total - report.delivered - report.expired;
        self.metrics.set_outbox_pending(pending);
        self.logger
            .log_outbox_sweep(report.delivered, report.expired, report.halted);
        self.report_health(pending).await;

        report
    }

    async fn report_health(&self, pending: usize) {
        let Some(health) = &self.health else {
            return;
        };
        if pending == 0 {
            health.set_healthy(components::OUTBOX).await;
        } else {
            health
                .set_degraded(
                    components::OUTBOX,
                    format!("{} envelopes awaiting delivery", pending),
                )
                .await;
        }
    }
}
