//! Observability infrastructure for the manager and agents
//!
//! Provides:
//! - Prometheus metrics (envelope traffic, outbox state, decisions, tier changes)
//! - Structured JSON logging of domain events with tracing

use crate::envelope::NoticeKind;
use crate::models::{AgentStatus, ChangeRequest};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for handler dispatch latency (in seconds)
const DISPATCH_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ScalerMetricsInner> = OnceLock::new();

struct ScalerMetricsInner {
    envelopes_received: IntCounterVec,
    envelopes_rejected: IntCounterVec,
    deliveries_failed: IntCounter,
    outbox_pending: IntGauge,
    outbox_resent: IntCounter,
    outbox_expired: IntCounter,
    decisions: IntCounterVec,
    tier_changes: IntCounterVec,
    dispatch_latency_seconds: Histogram,
}

impl ScalerMetricsInner {
    fn new() -> Self {
        Self {
            envelopes_received: register_int_counter_vec!(
                "tierwatch_envelopes_received_total",
                "Envelopes decoded by the listener, by notice kind",
                &["kind"]
            )
            .expect("Failed to register envelopes_received"),

            envelopes_rejected: register_int_counter_vec!(
                "tierwatch_envelopes_rejected_total",
                "Inbound lines discarded by the decoder, by reason",
                &["reason"]
            )
            .expect("Failed to register envelopes_rejected"),

            deliveries_failed: register_int_counter!(
                "tierwatch_deliveries_failed_total",
                "Sends that exhausted their retry budget"
            )
            .expect("Failed to register deliveries_failed"),

            outbox_pending: register_int_gauge!(
                "tierwatch_outbox_pending",
                "Entries waiting in the outbox after the last sweep or persist"
            )
            .expect("Failed to register outbox_pending"),

            outbox_resent: register_int_counter!(
                "tierwatch_outbox_resent_total",
                "Outbox entries delivered by a resend sweep"
            )
            .expect("Failed to register outbox_resent"),

            outbox_expired: register_int_counter!(
                "tierwatch_outbox_expired_total",
                "Outbox entries dropped after exceeding the rotation age"
            )
            .expect("Failed to register outbox_expired"),

            decisions: register_int_counter_vec!(
                "tierwatch_decisions_total",
                "Threshold evaluations that produced a decision, by direction",
                &["direction"]
            )
            .expect("Failed to register decisions"),

            tier_changes: register_int_counter_vec!(
                "tierwatch_tier_changes_total",
                "Tier change attempts, by outcome",
                &["outcome"]
            )
            .expect("Failed to register tier_changes"),

            dispatch_latency_seconds: register_histogram!(
                "tierwatch_dispatch_latency_seconds",
                "Time spent in a notice handler",
                DISPATCH_BUCKETS.to_vec()
            )
            .expect("Failed to register dispatch_latency_seconds"),
        }
    }
}

/// Handle to the process-wide Prometheus metrics.
/// Clones share the same underlying metrics.
#[derive(Clone)]
pub struct ScalerMetrics {
    _private: (),
}

impl Default for ScalerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ScalerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ScalerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ScalerMetricsInner {
        GLOBAL_METRICS.get_or_init(ScalerMetricsInner::new)
    }

    pub fn inc_received(&self, kind: NoticeKind) {
        self.inner()
            .envelopes_received
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn inc_rejected(&self, reason: &str) {
        self.inner()
            .envelopes_rejected
            .with_label_values(&[reason])
            .inc();
    }

    pub fn inc_delivery_failed(&self) {
        self.inner().deliveries_failed.inc();
    }

    pub fn set_outbox_pending(&self, pending: usize) {
        self.inner().outbox_pending.set(pending as i64);
    }

    pub fn inc_outbox_resent(&self, count: usize) {
        self.inner().outbox_resent.inc_by(count as u64);
    }

    pub fn inc_outbox_expired(&self, count: usize) {
        self.inner().outbox_expired.inc_by(count as u64);
    }

    pub fn inc_decision(&self, direction: ChangeRequest) {
        self.inner()
            .decisions
            .with_label_values(&[direction.as_str()])
            .inc();
    }

    /// `outcome` is one of `started`, `confirmed`, `abandoned`, `skipped`
    pub fn inc_tier_change(&self, outcome: &str) {
        self.inner()
            .tier_changes
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn observe_dispatch_latency(&self, duration_secs: f64) {
        self.inner().dispatch_latency_seconds.observe(duration_secs);
    }
}

/// Structured logger for significant domain events
#[derive(Clone)]
pub struct StructuredLogger {
    service: String,
}

impl StructuredLogger {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn log_startup(&self, version: &str, listen_addr: &str) {
        info!(
            event = "service_started",
            service = %self.service,
            version = %version,
            listen_addr = %listen_addr,
            "Service started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "service_shutdown",
            service = %self.service,
            reason = %reason,
            "Service shutting down"
        );
    }

    pub fn log_status_transition(
        &self,
        hostname: &str,
        previous: Option<AgentStatus>,
        current: AgentStatus,
        is_installed: bool,
    ) {
        info!(
            event = "status_transition",
            service = %self.service,
            hostname = %hostname,
            previous = ?previous,
            current = %current,
            is_installed = is_installed,
            "Instance status updated"
        );
    }

    pub fn log_scale_decision(
        &self,
        hostname: &str,
        decision: ChangeRequest,
        cpu_usage: Option<f64>,
        memory_usage: Option<f64>,
    ) {
        info!(
            event = "scale_decision",
            service = %self.service,
            hostname = %hostname,
            decision = %decision,
            cpu_usage = ?cpu_usage,
            memory_usage = ?memory_usage,
            "Threshold evaluation produced a scale decision"
        );
    }

    pub fn log_tier_change_started(&self, hostname: &str, from: Option<&str>, to: &str) {
        info!(
            event = "tier_change_started",
            service = %self.service,
            hostname = %hostname,
            from_tier = ?from,
            to_tier = %to,
            "Tier change requested"
        );
    }

    pub fn log_tier_change_confirmed(&self, hostname: &str, tier: &str, polls: u32) {
        info!(
            event = "tier_change_confirmed",
            service = %self.service,
            hostname = %hostname,
            tier = %tier,
            polls = polls,
            "Tier change confirmed"
        );
    }

    pub fn log_tier_change_abandoned(&self, hostname: &str, tier: Option<&str>, reason: &str) {
        warn!(
            event = "tier_change_abandoned",
            service = %self.service,
            hostname = %hostname,
            tier = ?tier,
            reason = %reason,
            "Tier change abandoned"
        );
    }

    pub fn log_outbox_sweep(&self, delivered: usize, expired: usize, halted: bool) {
        if halted {
            warn!(
                event = "outbox_sweep",
                service = %self.service,
                delivered = delivered,
                expired = expired,
                halted = true,
                "Outbox sweep stopped at an undeliverable entry"
            );
        } else {
            info!(
                event = "outbox_sweep",
                service = %self.service,
                delivered = delivered,
                expired = expired,
                halted = false,
                "Outbox sweep completed"
            );
        }
    }
}
