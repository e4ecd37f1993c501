//! Threshold evaluation with continuity (hysteresis)
//!
//! A live sample produces a candidate direction from the host's thresholds.
//! `UPPER` and `LOWER` are only returned once the previous
//! `continuity - 1` history samples breached in the same direction too.
//! The engine never writes to the store.

use crate::envelope::MetricsReport;
use crate::models::{ChangeRequest, ResourceHistorySample, ThresholdConfig, ThresholdSettings};
use crate::store::Repository;
use tracing::{debug, error};

/// Utilisation percentages of one observation
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricSample {
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
}

impl MetricSample {
    pub fn new(cpu: Option<f64>, memory: Option<f64>) -> Self {
        Self { cpu, memory }
    }
}

impl From<&MetricsReport> for MetricSample {
    fn from(report: &MetricsReport) -> Self {
        Self::new(report.cpu_usage, report.memory_usage)
    }
}

impl From<&ResourceHistorySample> for MetricSample {
    fn from(sample: &ResourceHistorySample) -> Self {
        Self::new(sample.cpu_usage, sample.memory_usage)
    }
}

fn over(value: Option<f64>, limit: f64) -> bool {
    value.is_some_and(|v| v > limit)
}

fn under(value: Option<f64>, limit: f64) -> bool {
    value.is_some_and(|v| v < limit)
}

/// Direction the live sample points at, combinator applied
pub fn candidate(settings: &ThresholdSettings, sample: &MetricSample) -> ChangeRequest {
    let upper = &settings.upper;
    let lower = &settings.lower;

    let upper_breach = upper.enabled
        && upper
            .combinator
            .combine(over(sample.cpu, upper.cpu), over(sample.memory, upper.memory));
    let lower_breach = lower.enabled
        && lower
            .combinator
            .combine(under(sample.cpu, lower.cpu), under(sample.memory, lower.memory));

    if upper_breach {
        ChangeRequest::Upper
    } else if lower_breach {
        ChangeRequest::Lower
    } else {
        ChangeRequest::Within
    }
}

/// Whether a history sample breached in `direction`. History is checked
/// with cpu OR memory regardless of the configured combinator.
pub fn confirms(settings: &ThresholdSettings, direction: ChangeRequest, sample: &MetricSample) -> bool {
    match direction {
        ChangeRequest::Upper => {
            over(sample.cpu, settings.upper.cpu) || over(sample.memory, settings.upper.memory)
        }
        ChangeRequest::Lower => {
            under(sample.cpu, settings.lower.cpu) || under(sample.memory, settings.lower.memory)
        }
        ChangeRequest::Within => false,
    }
}

/// Decision from settings, the live sample and newest-first history
pub fn decide(
    settings: &ThresholdSettings,
    sample: &MetricSample,
    history: &[MetricSample],
) -> Option<ChangeRequest> {
    let direction = candidate(settings, sample);
    if direction == ChangeRequest::Within {
        return Some(ChangeRequest::Within);
    }
    if settings.continuity <= 1 {
        return Some(direction);
    }

    let needed = (settings.continuity - 1) as usize;
    if history.len() < needed {
        return None;
    }

    history[..needed]
        .iter()
        .all(|h| confirms(settings, direction, h))
        .then_some(direction)
}

/// Evaluates live samples against stored thresholds and history
#[derive(Clone)]
pub struct ThresholdEngine {
    repo: Repository,
}

impl ThresholdEngine {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// `None` means no decision: no thresholds configured, not enough
    /// history, or history did not confirm the candidate.
    pub fn evaluate(&self, hostname: &str, sample: &MetricSample) -> Option<ChangeRequest> {
        let config = match self.repo.most_recent::<ThresholdConfig>(hostname) {
            Ok(Some(config)) => config,
            Ok(None) => {
                error!(hostname = %hostname, "No threshold configuration for host");
                return None;
            }
            Err(e) => {
                error!(hostname = %hostname, error = %e, "Failed to load threshold configuration");
                return None;
            }
        };
        let settings = &config.settings;

        let history = if settings.continuity > 1 && candidate(settings, sample) != ChangeRequest::Within {
            let needed = (settings.continuity - 1) as usize;
            match self.repo.last_n::<ResourceHistorySample>(hostname, needed) {
                Ok(samples) => samples.iter().map(MetricSample::from).collect(),
                Err(e) => {
                    error!(hostname = %hostname, error = %e, "Failed to load resource history");
                    return None;
                }
            }
        } else {
            Vec::new()
        };

        let decision = decide(settings, sample, &history);
        debug!(
            hostname = %hostname,
            cpu = ?sample.cpu,
            memory = ?sample.memory,
            history = history.len(),
            decision = ?decision,
            "Evaluated thresholds"
        );
        decision
    }
}
