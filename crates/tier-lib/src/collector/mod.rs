//! Host utilisation collection and the agent's reporting loop
//!
//! The agent samples CPU and memory of its own host, evaluates the sample
//! against locally stored thresholds, keeps a local history and reports
//! every sample to the manager as a METRICS envelope.

mod proc;
mod r#loop;


pub use proc::{CpuTimes, ProcCollector};
pub use r#loop::{ReportConfig, ReportLoop, ReportLoopBuilder};

use crate::engine::MetricSample;
use anyhow::Result;
use async_trait::async_trait;

/// Source of utilisation samples for the local host
#[async_trait]
pub trait HostCollector: Send + Sync {
    /// CPU and memory utilisation percentages. Either may be absent,
    /// e.g. CPU on the very first call of a delta-based collector.
    async fn collect(&self) -> Result<MetricSample>;
}
