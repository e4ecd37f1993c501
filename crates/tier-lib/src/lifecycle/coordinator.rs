use super::catalog::TierCatalog;
use super::confirm::{ConfirmationLoop, TierChangeTicket};
use crate::actions::ActionRunner;
use crate::envelope::{Envelope, NoticeKind};
use crate::models::{AgentStatus, ChangeRequest, InstanceStatus};
use crate::observability::{ScalerMetrics, StructuredLogger};
use crate::store::Repository;
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Status and `isInstalled` after a lifecycle notice.
///
/// `prior` is the previous `(status, is_installed)` of the host, if any.
/// Returns `None` for kinds that are not lifecycle notices.
pub fn next_status(
    prior: Option<(AgentStatus, bool)>,
    kind: NoticeKind,
) -> Option<(AgentStatus, bool)> {
    let next = match kind {
        NoticeKind::Install => (AgentStatus::Installing, false),
        NoticeKind::Uninstall => (AgentStatus::Uninstalling, false),
        NoticeKind::Up => match prior {
            Some((AgentStatus::Installing, _)) | None => (AgentStatus::Up, true),
            Some((_, installed)) => (AgentStatus::Up, installed),
        },
        NoticeKind::Down => match prior {
            Some((AgentStatus::Uninstalling, _)) | None => (AgentStatus::Down, false),
            Some((_, installed)) => (AgentStatus::Down, installed),
        },
        NoticeKind::Metrics | NoticeKind::Threshold => return None,
    };
    Some(next)
}

/// Owns instance status records and drives tier changes
pub struct LifecycleCoordinator {
    repo: Repository,
    catalog: Arc<dyn TierCatalog>,
    actions: Arc<dyn ActionRunner>,
    confirmations: Arc<ConfirmationLoop>,
    metrics: ScalerMetrics,
    logger: StructuredLogger,
}

impl LifecycleCoordinator {
    pub fn new(
        repo: Repository,
        catalog: Arc<dyn TierCatalog>,
        actions: Arc<dyn ActionRunner>,
        confirmations: Arc<ConfirmationLoop>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            repo,
            catalog,
            actions,
            confirmations,
            metrics: ScalerMetrics::new(),
            logger,
        }
    }

    /// Apply a lifecycle notice to the host's status record
    pub async fn record_notice(&self, envelope: &Envelope) -> Result<InstanceStatus> {
        let hostname = envelope.instance_name.as_str();
        let kind = envelope.kind();

        let prior = self
            .repo
            .most_recent::<InstanceStatus>(hostname)
            .with_context(|| format!("Failed to load status of {}", hostname))?;
        let (status, is_installed) = next_status(
            prior.as_ref().map(|p| (p.agent_status, p.is_installed)),
            kind,
        )
        .with_context(|| format!("{} is not a lifecycle notice", kind))?;

        match kind {
            NoticeKind::Install => self.spawn_install(hostname),
            NoticeKind::Uninstall => self.spawn_uninstall(hostname),
            _ => {}
        }

        let previous_status = prior.as_ref().map(|p| p.agent_status);
        let mut record =
            prior.unwrap_or_else(|| InstanceStatus::new(hostname, status, is_installed));
        record.agent_status = status;
        record.is_installed = is_installed;
        record.agent_version = Some(envelope.agent_version.clone());
        record.last_notice_at = Some(envelope.timestamp);
        record.updated_at = Utc::now();
        self.enrich(&mut record);

        self.repo
            .append(&record)
            .with_context(|| format!("Failed to store status of {}", hostname))?;
        self.logger
            .log_status_transition(hostname, previous_status, status, is_installed);

        Ok(record)
    }

    /// Fill placement fields from the catalog as far as the chain resolves.
    /// Unresolved fields keep their prior values.
    fn enrich(&self, record: &mut InstanceStatus) {
        let Some(machine) = self.catalog.machine(&record.hostname) else {
            debug!(hostname = %record.hostname, "Host not in tier catalog");
            return;
        };

        if record.current_tier.is_none() {
            record.current_tier = machine.current_tier.clone();
        }
        let link = self.catalog.tier_link(&machine.machine_type, &machine.region);
        record.machine_type = Some(machine.machine_type);
        record.region = Some(machine.region);

        let Some(link) = link else {
            return;
        };
        if let Some(names) = self.catalog.tier_names(&link) {
            record.tier_names = Some(names);
        }
        record.tier_link_id = Some(link);
    }

    fn spawn_install(&self, hostname: &str) {
        let actions = Arc::clone(&self.actions);
        let hostname = hostname.to_string();
        tokio::spawn(async move {
            match actions.install(&hostname).await {
                Ok(()) => info!(hostname = %hostname, "Agent install finished"),
                Err(e) => warn!(hostname = %hostname, error = %e, "Agent install failed"),
            }
        });
    }

    fn spawn_uninstall(&self, hostname: &str) {
        let actions = Arc::clone(&self.actions);
        let hostname = hostname.to_string();
        tokio::spawn(async move {
            match actions.uninstall(&hostname).await {
                Ok(()) => info!(hostname = %hostname, "Agent uninstall finished"),
                Err(e) => warn!(hostname = %hostname, error = %e, "Agent uninstall failed"),
            }
        });
    }

    /// Move the host one tier in `direction` and start confirming the change.
    ///
    /// `Ok(None)` means the change was not started: lookup miss, already at
    /// the edge, `WITHIN`, or the apply action failed. Concurrent calls for
    /// the same host are not deduplicated.
    pub async fn change_tier(
        &self,
        hostname: &str,
        direction: ChangeRequest,
    ) -> Result<Option<TierChangeTicket>> {
        if direction == ChangeRequest::Within {
            return Ok(None);
        }

        let lookup = match self.catalog.resolve(hostname) {
            Ok(lookup) => lookup,
            Err(miss) => {
                self.metrics.inc_tier_change("abandoned");
                self.logger
                    .log_tier_change_abandoned(hostname, None, &miss.to_string());
                return Ok(None);
            }
        };

        let status = self
            .repo
            .most_recent::<InstanceStatus>(hostname)
            .with_context(|| format!("Failed to load status of {}", hostname))?;
        let current = status
            .and_then(|s| s.current_tier)
            .or(lookup.machine.current_tier);

        let Some(target) = lookup.tier_names.step(current.as_deref(), direction) else {
            info!(
                hostname,
                current_tier = ?current,
                direction = %direction,
                "Host already at the edge tier, skipping change"
            );
            self.metrics.inc_tier_change("skipped");
            return Ok(None);
        };
        let target = target.to_string();

        self.metrics.inc_tier_change("started");
        self.logger
            .log_tier_change_started(hostname, current.as_deref(), &target);

        if let Err(e) = self.actions.apply_tier_change(hostname, &target).await {
            self.metrics.inc_tier_change("abandoned");
            self.logger
                .log_tier_change_abandoned(hostname, Some(&target), &e.to_string());
            return Ok(None);
        }

        Ok(Some(self.confirmations.start(hostname, &target)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionError;
    use crate::envelope::Payload;
    use crate::lifecycle::{
        ConfirmationOutcome, ConfirmationSettings, MachineInfo, StaticTierCatalog,
    };
    use crate::models::TierNames;
    use crate::shutdown::ShutdownSignal;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeActions {
        calls: Mutex<Vec<String>>,
        fail_apply: bool,
    }

    impl FakeActions {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ActionRunner for FakeActions {
        async fn install(&self, hostname: &str) -> Result<(), ActionError> {
            self.calls.lock().unwrap().push(format!("install {}", hostname));
            Ok(())
        }

        async fn uninstall(&self, hostname: &str) -> Result<(), ActionError> {
            self.calls.lock().unwrap().push(format!("uninstall {}", hostname));
            Ok(())
        }

        async fn apply_tier_change(&self, hostname: &str, tier: &str) -> Result<(), ActionError> {
            self.calls.lock().unwrap().push(format!("apply {} {}", hostname, tier));
            if self.fail_apply {
                return Err(ActionError::NotConfigured { action: "apply_tier_change" });
            }
            Ok(())
        }

        async fn tier_change_complete(&self, _hostname: &str, _tier: &str) -> Result<bool, ActionError> {
            Ok(true)
        }
    }

    fn catalog() -> Arc<StaticTierCatalog> {
        let catalog = StaticTierCatalog::new();
        catalog.insert_machine(
            "web-01",
            MachineInfo {
                machine_type: "n2".to_string(),
                region: "europe-west1".to_string(),
                current_tier: Some("n2-standard-4".to_string()),
            },
        );
        catalog.insert_tier_link("n2", "europe-west1", "link-1");
        catalog.insert_tier_names(
            "link-1",
            TierNames {
                high: "n2-highcpu-8".to_string(),
                standard: "n2-standard-4".to_string(),
                micro: "e2-micro".to_string(),
            },
        );
        Arc::new(catalog)
    }

    fn coordinator(repo: Repository, actions: Arc<FakeActions>) -> LifecycleCoordinator {
        let confirmations = Arc::new(ConfirmationLoop::new(
            repo.clone(),
            actions.clone(),
            ConfirmationSettings {
                initial_delay: Duration::from_millis(1),
                interval: Duration::from_millis(1),
                max_retries: 1,
                pool_size: 1,
            },
            ShutdownSignal::never(),
        ));
        LifecycleCoordinator::new(
            repo,
            catalog(),
            actions,
            confirmations,
            StructuredLogger::new("test"),
        )
    }

    fn notice(host: &str, payload: Payload) -> Envelope {
        Envelope::new(host, "3.0.1", payload)
    }

    #[test]
    fn test_up_installed_rules() {
        assert_eq!(next_status(None, NoticeKind::Up), Some((AgentStatus::Up, true)));
        assert_eq!(
            next_status(Some((AgentStatus::Installing, false)), NoticeKind::Up),
            Some((AgentStatus::Up, true))
        );
        assert_eq!(
            next_status(Some((AgentStatus::Down, false)), NoticeKind::Up),
            Some((AgentStatus::Up, false))
        );
        assert_eq!(
            next_status(Some((AgentStatus::Down, true)), NoticeKind::Up),
            Some((AgentStatus::Up, true))
        );
    }

    #[test]
    fn test_down_installed_rules() {
        assert_eq!(next_status(None, NoticeKind::Down), Some((AgentStatus::Down, false)));
        assert_eq!(
            next_status(Some((AgentStatus::Uninstalling, true)), NoticeKind::Down),
            Some((AgentStatus::Down, false))
        );
        assert_eq!(
            next_status(Some((AgentStatus::Up, true)), NoticeKind::Down),
            Some((AgentStatus::Down, true))
        );
    }

    #[test]
    fn test_install_and_uninstall_reset_installed() {
        assert_eq!(
            next_status(Some((AgentStatus::Up, true)), NoticeKind::Install),
            Some((AgentStatus::Installing, false))
        );
        assert_eq!(
            next_status(Some((AgentStatus::Up, true)), NoticeKind::Uninstall),
            Some((AgentStatus::Uninstalling, false))
        );
        assert_eq!(next_status(None, NoticeKind::Metrics), None);
    }

    #[tokio::test]
    async fn test_record_notice_enriches_and_preserves() {
        let repo = Repository::in_memory();
        let actions = Arc::new(FakeActions::default());
        let coordinator = coordinator(repo.clone(), actions.clone());

        let installing = coordinator
            .record_notice(&notice("web-01", Payload::Install))
            .await
            .unwrap();
        assert_eq!(installing.agent_status, AgentStatus::Installing);
        assert!(!installing.is_installed);
        assert_eq!(installing.tier_link_id.as_deref(), Some("link-1"));
        assert_eq!(installing.current_tier.as_deref(), Some("n2-standard-4"));

        let up = coordinator
            .record_notice(&notice("web-01", Payload::Up))
            .await
            .unwrap();
        assert!(up.is_installed);
        assert_eq!(up.agent_version.as_deref(), Some("3.0.1"));
        assert_eq!(up.machine_type.as_deref(), Some("n2"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(actions.calls(), vec!["install web-01"]);
    }

    #[tokio::test]
    async fn test_unknown_host_keeps_prior_fields() {
        let repo = Repository::in_memory();
        let coordinator = coordinator(repo.clone(), Arc::new(FakeActions::default()));

        let mut prior = InstanceStatus::new("db-09", AgentStatus::Up, true);
        prior.region = Some("us-east1".to_string());
        repo.append(&prior).unwrap();

        let down = coordinator
            .record_notice(&notice("db-09", Payload::Down))
            .await
            .unwrap();
        assert_eq!(down.region.as_deref(), Some("us-east1"));
        assert!(down.is_installed);
    }

    #[tokio::test]
    async fn test_change_tier_steps_and_confirms() {
        let repo = Repository::in_memory();
        let actions = Arc::new(FakeActions::default());
        let coordinator = coordinator(repo.clone(), actions.clone());
        coordinator
            .record_notice(&notice("web-01", Payload::Up))
            .await
            .unwrap();

        let ticket = coordinator
            .change_tier("web-01", ChangeRequest::Upper)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ticket.target_tier(), "n2-highcpu-8");
        assert_eq!(ticket.outcome().await, ConfirmationOutcome::Confirmed { polls: 1 });

        let status: InstanceStatus = repo.most_recent("web-01").unwrap().unwrap();
        assert_eq!(status.current_tier.as_deref(), Some("n2-highcpu-8"));

        // Already at the top
        assert!(coordinator
            .change_tier("web-01", ChangeRequest::Upper)
            .await
            .unwrap()
            .is_none());
        assert_eq!(actions.calls(), vec!["apply web-01 n2-highcpu-8"]);
    }

    #[tokio::test]
    async fn test_change_tier_abandoned_on_lookup_miss_or_apply_failure() {
        let repo = Repository::in_memory();
        let coordinator = coordinator(repo.clone(), Arc::new(FakeActions::default()));
        assert!(coordinator
            .change_tier("not-in-catalog", ChangeRequest::Lower)
            .await
            .unwrap()
            .is_none());

        let failing = Arc::new(FakeActions {
            fail_apply: true,
            ..Default::default()
        });
        let coordinator = self::coordinator(repo.clone(), failing.clone());
        assert!(coordinator
            .change_tier("web-01", ChangeRequest::Lower)
            .await
            .unwrap()
            .is_none());
        assert_eq!(failing.calls(), vec!["apply web-01 e2-micro"]);
    }
}
