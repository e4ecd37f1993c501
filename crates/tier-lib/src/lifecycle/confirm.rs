//! Tier change confirmation loop
//!
//! After a tier change is requested the loop polls the completion check.
//! Each poll is its own delayed task carrying the poll state; a negative
//! answer resubmits the state with one attempt fewer. The first positive
//! answer persists the new current tier.

use crate::actions::ActionRunner;
use crate::health::{components, HealthRegistry};
use crate::models::{AgentStatus, InstanceStatus};
use crate::observability::{ScalerMetrics, StructuredLogger};
use crate::shutdown::ShutdownSignal;
use crate::store::Repository;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub struct ConfirmationSettings {
    /// Wait before the first poll
    pub initial_delay: Duration,
    /// Wait between polls
    pub interval: Duration,
    /// Re-polls after the first poll
    pub max_retries: u32,
    /// Concurrent poll ticks
    pub pool_size: usize,
}

impl Default for ConfirmationSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(60),
            interval: Duration::from_secs(30),
            max_retries: 10,
            pool_size: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Confirmed { polls: u32 },
    /// Retry budget exhausted, nothing persisted
    Abandoned { polls: u32 },
    /// Scheduler shut down before a verdict
    Cancelled,
}

/// Handle to a running confirmation loop; dropping it does not stop the loop
#[derive(Debug)]
pub struct TierChangeTicket {
    hostname: String,
    target_tier: String,
    rx: oneshot::Receiver<ConfirmationOutcome>,
}

impl TierChangeTicket {
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn target_tier(&self) -> &str {
        &self.target_tier
    }

    pub async fn outcome(self) -> ConfirmationOutcome {
        self.rx.await.unwrap_or(ConfirmationOutcome::Cancelled)
    }
}

/// State carried from one poll to the next
struct TierChangePoll {
    hostname: String,
    target_tier: String,
    attempts_left: u32,
    polls: u32,
    done: Option<oneshot::Sender<ConfirmationOutcome>>,
}

impl TierChangePoll {
    fn finish(mut self, outcome: ConfirmationOutcome) {
        if let Some(done) = self.done.take() {
            let _ = done.send(outcome);
        }
    }
}

pub struct ConfirmationLoop {
    repo: Repository,
    actions: Arc<dyn ActionRunner>,
    settings: ConfirmationSettings,
    permits: Arc<Semaphore>,
    shutdown: ShutdownSignal,
    metrics: ScalerMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl ConfirmationLoop {
    pub fn new(
        repo: Repository,
        actions: Arc<dyn ActionRunner>,
        settings: ConfirmationSettings,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            repo,
            actions,
            permits: Arc::new(Semaphore::new(settings.pool_size.max(1))),
            settings,
            shutdown,
            metrics: ScalerMetrics::new(),
            logger: StructuredLogger::new("confirmation"),
            health: None,
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Report the `scheduler` component (degraded after an abandoned change)
    /// and the `store` component (unhealthy when a confirmed tier is not saved)
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Start polling for `hostname` reaching `target_tier`
    pub fn start(self: &Arc<Self>, hostname: &str, target_tier: &str) -> TierChangeTicket {
        let (tx, rx) = oneshot::channel();
        let poll = TierChangePoll {
            hostname: hostname.to_string(),
            target_tier: target_tier.to_string(),
            attempts_left: self.settings.max_retries,
            polls: 0,
            done: Some(tx),
        };
        self.submit(poll, self.settings.initial_delay);

        TierChangeTicket {
            hostname: hostname.to_string(),
            target_tier: target_tier.to_string(),
            rx,
        }
    }

    fn submit(self: &Arc<Self>, poll: TierChangePoll, delay: Duration) {
        let scheduler = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if !shutdown.sleep(delay).await {
                debug!(hostname = %poll.hostname, "Confirmation cancelled by shutdown");
                poll.finish(ConfirmationOutcome::Cancelled);
                return;
            }
            let Ok(_permit) = Arc::clone(&scheduler.permits).acquire_owned().await else {
                poll.finish(ConfirmationOutcome::Cancelled);
                return;
            };
            scheduler.tick(poll).await;
        });
    }

    async fn tick(self: &Arc<Self>, mut poll: TierChangePoll) {
        poll.polls += 1;

        let complete = match self
            .actions
            .tier_change_complete(&poll.hostname, &poll.target_tier)
            .await
        {
            Ok(complete) => complete,
            Err(e) => {
                warn!(hostname = %poll.hostname, error = %e, "Completion check failed");
                false
            }
        };

        if complete {
            let saved = self.persist_current_tier(&poll.hostname, &poll.target_tier);
            if let Some(health) = &self.health {
                health.set_healthy(components::SCHEDULER).await;
                if let Err(e) = saved {
                    health.set_unhealthy(components::STORE, e).await;
                }
            }
            self.metrics.inc_tier_change("confirmed");
            self.logger
                .log_tier_change_confirmed(&poll.hostname, &poll.target_tier, poll.polls);
            let polls = poll.polls;
            poll.finish(ConfirmationOutcome::Confirmed { polls });
            return;
        }

        if poll.attempts_left == 0 {
            self.metrics.inc_tier_change("abandoned");
            self.logger.log_tier_change_abandoned(
                &poll.hostname,
                Some(&poll.target_tier),
                "confirmation retries exhausted",
            );
            if let Some(health) = &self.health {
                health
                    .set_degraded(
                        components::SCHEDULER,
                        format!(
                            "Tier change of {} to {} abandoned",
                            poll.hostname, poll.target_tier
                        ),
                    )
                    .await;
            }
            let polls = poll.polls;
            poll.finish(ConfirmationOutcome::Abandoned { polls });
            return;
        }

        poll.attempts_left -= 1;
        debug!(
            hostname = %poll.hostname,
            tier = %poll.target_tier,
            attempts_left = poll.attempts_left,
            "Tier change not complete, polling again"
        );
        self.submit(poll, self.settings.interval);
    }

    /// Returns the store error text when the tier could not be saved
    fn persist_current_tier(&self, hostname: &str, tier: &str) -> Result<(), String> {
        let prior = match self.repo.most_recent::<InstanceStatus>(hostname) {
            Ok(prior) => prior,
            Err(e) => {
                error!(hostname, error = %e, "Failed to load instance status");
                return Err(e.to_string());
            }
        };

        let mut record =
            prior.unwrap_or_else(|| InstanceStatus::new(hostname, AgentStatus::Up, true));
        record.current_tier = Some(tier.to_string());
        record.updated_at = Utc::now();

        self.repo.append(&record).map_err(|e| {
            error!(hostname, tier, error = %e, "Failed to persist confirmed tier");
            e.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionError;
    use crate::shutdown::shutdown_channel;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Answers completion checks from a script, then keeps repeating `false`
    struct ScriptedActions {
        answers: Mutex<VecDeque<bool>>,
        checks: Mutex<u32>,
    }

    impl ScriptedActions {
        fn new(answers: &[bool]) -> Self {
            Self {
                answers: Mutex::new(answers.iter().copied().collect()),
                checks: Mutex::new(0),
            }
        }

        fn checks(&self) -> u32 {
            *self.checks.lock().unwrap()
        }
    }

    #[async_trait]
    impl ActionRunner for ScriptedActions {
        async fn install(&self, _hostname: &str) -> Result<(), ActionError> {
            Ok(())
        }

        async fn uninstall(&self, _hostname: &str) -> Result<(), ActionError> {
            Ok(())
        }

        async fn apply_tier_change(&self, _hostname: &str, _tier: &str) -> Result<(), ActionError> {
            Ok(())
        }

        async fn tier_change_complete(&self, _hostname: &str, _tier: &str) -> Result<bool, ActionError> {
            *self.checks.lock().unwrap() += 1;
            Ok(self.answers.lock().unwrap().pop_front().unwrap_or(false))
        }
    }

    fn fast_settings(max_retries: u32) -> ConfirmationSettings {
        ConfirmationSettings {
            initial_delay: Duration::from_millis(5),
            interval: Duration::from_millis(5),
            max_retries,
            pool_size: 2,
        }
    }

    fn seeded_repo() -> Repository {
        let repo = Repository::in_memory();
        let mut status = InstanceStatus::new("web-01", AgentStatus::Up, true);
        status.current_tier = Some("n2-standard-4".to_string());
        repo.append(&status).unwrap();
        repo
    }

    fn status_records(repo: &Repository) -> Vec<InstanceStatus> {
        repo.last_n("web-01", 100).unwrap()
    }

    #[tokio::test]
    async fn test_confirms_after_negative_polls() {
        let repo = seeded_repo();
        let actions = Arc::new(ScriptedActions::new(&[false, false, true]));
        let confirmations = Arc::new(ConfirmationLoop::new(
            repo.clone(),
            actions.clone(),
            fast_settings(5),
            ShutdownSignal::never(),
        ));

        let outcome = confirmations.start("web-01", "n2-highcpu-8").outcome().await;

        assert_eq!(outcome, ConfirmationOutcome::Confirmed { polls: 3 });
        assert_eq!(actions.checks(), 3);
        let records = status_records(&repo);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].current_tier.as_deref(), Some("n2-highcpu-8"));
        assert_eq!(records[0].agent_status, AgentStatus::Up);
    }

    #[tokio::test]
    async fn test_abandons_after_retry_budget() {
        let repo = seeded_repo();
        let actions = Arc::new(ScriptedActions::new(&[]));
        let confirmations = Arc::new(ConfirmationLoop::new(
            repo.clone(),
            actions.clone(),
            fast_settings(2),
            ShutdownSignal::never(),
        ));

        let outcome = confirmations.start("web-01", "e2-micro").outcome().await;

        assert_eq!(outcome, ConfirmationOutcome::Abandoned { polls: 3 });
        assert_eq!(actions.checks(), 3);
        assert_eq!(status_records(&repo).len(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_change_degrades_scheduler() {
        use crate::health::ComponentStatus;

        let health = HealthRegistry::new();
        health.register(components::SCHEDULER).await;
        let actions = Arc::new(ScriptedActions::new(&[]));
        let confirmations = Arc::new(
            ConfirmationLoop::new(
                seeded_repo(),
                actions.clone(),
                fast_settings(0),
                ShutdownSignal::never(),
            )
            .with_health(health.clone()),
        );

        let outcome = confirmations.start("web-01", "e2-micro").outcome().await;
        assert_eq!(outcome, ConfirmationOutcome::Abandoned { polls: 1 });
        let report = health.health().await;
        assert_eq!(report.status, ComponentStatus::Degraded);
        assert_eq!(
            report.components[components::SCHEDULER].message.as_deref(),
            Some("Tier change of web-01 to e2-micro abandoned")
        );

        actions.answers.lock().unwrap().push_back(true);
        let outcome = confirmations.start("web-01", "e2-micro").outcome().await;
        assert_eq!(outcome, ConfirmationOutcome::Confirmed { polls: 1 });
        assert_eq!(health.health().await.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_poll() {
        let repo = seeded_repo();
        let actions = Arc::new(ScriptedActions::new(&[true]));
        let (trigger, signal) = shutdown_channel();
        let confirmations = Arc::new(ConfirmationLoop::new(
            repo.clone(),
            actions.clone(),
            ConfirmationSettings {
                initial_delay: Duration::from_secs(30),
                ..fast_settings(0)
            },
            signal,
        ));

        let ticket = confirmations.start("web-01", "e2-micro");
        assert_eq!(ticket.target_tier(), "e2-micro");
        trigger.trigger();

        assert_eq!(ticket.outcome().await, ConfirmationOutcome::Cancelled);
        assert_eq!(actions.checks(), 0);
        assert_eq!(status_records(&repo).len(), 1);
    }
}
