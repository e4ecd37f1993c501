//! Host utilisation from procfs
//!
//! - /proc/stat aggregate `cpu` line for CPU busy percentage between two reads
//! - /proc/meminfo `MemTotal` and `MemAvailable` for memory in use

use super::HostCollector;
use crate::engine::MetricSample;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::fs;

/// Cumulative CPU jiffies from the aggregate `cpu` line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub idle: u64,
    pub total: u64,
}

impl CpuTimes {
    /// Busy percentage between an earlier reading and this one
    pub fn busy_percent_since(&self, earlier: &CpuTimes) -> Option<f64> {
        let total = self.total.checked_sub(earlier.total)?;
        let idle = self.idle.checked_sub(earlier.idle)?;
        if total == 0 {
            return None;
        }
        Some((total.saturating_sub(idle) as f64 / total as f64) * 100.0)
    }
}

/// Collector for the local host
pub struct ProcCollector {
    proc_path: PathBuf,
    previous: Mutex<Option<CpuTimes>>,
}

impl Default for ProcCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcCollector {
    pub fn new() -> Self {
        Self::with_proc_path("/proc")
    }

    /// Create collector with custom proc path (for testing)
    pub fn with_proc_path(proc_path: impl Into<PathBuf>) -> Self {
        Self {
            proc_path: proc_path.into(),
            previous: Mutex::new(None),
        }
    }

    /// Parse the aggregate `cpu` line of /proc/stat.
    /// Idle includes iowait; guest time is already part of user time.
    pub fn parse_proc_stat(content: &str) -> Result<CpuTimes> {
        let line = content
            .lines()
            .find(|line| line.starts_with("cpu "))
            .context("No aggregate cpu line in /proc/stat")?;

        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .take(8)
            .map(|v| v.parse::<u64>())
            .collect::<std::result::Result<_, _>>()
            .context("Invalid cpu counter in /proc/stat")?;
        if fields.len() < 4 {
            anyhow::bail!("Too few cpu counters in /proc/stat");
        }

        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        Ok(CpuTimes {
            idle,
            total: fields.iter().sum(),
        })
    }

    /// Parse /proc/meminfo into kB values
    pub fn parse_meminfo(content: &str) -> HashMap<String, u64> {
        let mut values = HashMap::new();

        for line in content.lines() {
            let Some((key, rest)) = line.split_once(':') else {
                continue;
            };
            if let Some(Ok(value)) = rest.split_whitespace().next().map(str::parse::<u64>) {
                values.insert(key.trim().to_string(), value);
            }
        }

        values
    }

    /// Memory in use as a percentage of MemTotal
    pub fn memory_percent(meminfo: &HashMap<String, u64>) -> Option<f64> {
        let total = *meminfo.get("MemTotal")?;
        if total == 0 {
            return None;
        }

        let available = match meminfo.get("MemAvailable") {
            Some(available) => *available,
            // Kernels before 3.14
            None => {
                meminfo.get("MemFree")?
                    + meminfo.get("Buffers").copied().unwrap_or(0)
                    + meminfo.get("Cached").copied().unwrap_or(0)
            }
        };

        Some((total.saturating_sub(available) as f64 / total as f64) * 100.0)
    }

    async fn read(&self, name: &str) -> Result<String> {
        let path = self.proc_path.join(name);
        fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }
}

#[async_trait]
impl HostCollector for ProcCollector {
    async fn collect(&self) -> Result<MetricSample> {
        let stat = self.read("stat").await?;
        let meminfo = self.read("meminfo").await?;

        let current = Self::parse_proc_stat(&stat)?;
        let memory = Self::memory_percent(&Self::parse_meminfo(&meminfo));

        let cpu = {
            let mut previous = self
                .previous
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let cpu = previous
                .as_ref()
                .and_then(|earlier| current.busy_percent_since(earlier));
            *previous = Some(current);
            cpu
        };

        Ok(MetricSample::new(cpu, memory))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proc_stat() {
        let content = "cpu  4705 356 584 3699 23 23 0 0 0 0\ncpu0 1393 180 270 1827 13 16 0 0 0 0\nintr 114930\n";
        let times = ProcCollector::parse_proc_stat(content).unwrap();

        assert_eq!(times.idle, 3699 + 23);
        assert_eq!(times.total, 4705 + 356 + 584 + 3699 + 23 + 23);
    }

    #[test]
    fn test_parse_proc_stat_without_cpu_line() {
        assert!(ProcCollector::parse_proc_stat("intr 1\nctxt 2\n").is_err());
    }

    #[test]
    fn test_busy_percent() {
        let earlier = CpuTimes { idle: 100, total: 200 };
        let later = CpuTimes { idle: 125, total: 300 };
        assert_eq!(later.busy_percent_since(&earlier), Some(75.0));
        assert_eq!(earlier.busy_percent_since(&earlier), None);
        // Counter reset
        assert_eq!(earlier.busy_percent_since(&later), None);
    }

    #[test]
    fn test_memory_percent() {
        let content = "MemTotal:        8000000 kB\nMemFree:          500000 kB\nMemAvailable:    2000000 kB\n";
        let meminfo = ProcCollector::parse_meminfo(content);
        assert_eq!(meminfo.get("MemTotal"), Some(&8000000));
        assert_eq!(ProcCollector::memory_percent(&meminfo), Some(75.0));
    }

    #[test]
    fn test_memory_percent_legacy_kernel() {
        let content = "MemTotal: 1000 kB\nMemFree: 200 kB\nBuffers: 100 kB\nCached: 200 kB\n";
        let meminfo = ProcCollector::parse_meminfo(content);
        assert_eq!(ProcCollector::memory_percent(&meminfo), Some(50.0));
    }
}
