//! Instance status and history commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;
use tier_lib::{InstanceStatus, ResourceHistorySample};

use crate::client::ApiClient;
use crate::output::{
    color_status, format_percent, format_timestamp, or_dash, print_items, print_warning,
    OutputFormat,
};

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "Host")]
    host: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Installed")]
    installed: String,
    #[tabled(rename = "Tier")]
    tier: String,
    #[tabled(rename = "Machine")]
    machine: String,
    #[tabled(rename = "Region")]
    region: String,
    #[tabled(rename = "Agent")]
    agent: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl From<&InstanceStatus> for StatusRow {
    fn from(s: &InstanceStatus) -> Self {
        Self {
            host: s.hostname.clone(),
            status: color_status(&s.agent_status.to_string()),
            installed: if s.is_installed { "yes" } else { "no" }.to_string(),
            tier: or_dash(s.current_tier.as_deref()),
            machine: or_dash(s.machine_type.as_deref()),
            region: or_dash(s.region.as_deref()),
            agent: or_dash(s.agent_version.as_deref()),
            updated: format_timestamp(&s.updated_at),
        }
    }
}

/// Show one host or every known host
pub async fn show_status(client: &ApiClient, host: Option<&str>, format: OutputFormat) -> Result<()> {
    let instances = match host {
        Some(host) => match client.instance(host).await? {
            Some(instance) => vec![instance],
            None => {
                print_warning(&format!("Instance {} not found", host));
                return Ok(());
            }
        },
        None => client.instances().await?,
    };

    let rows: Vec<StatusRow> = instances.iter().map(StatusRow::from).collect();
    print_items(&instances, rows, format);
    if format == OutputFormat::Table && host.is_none() {
        println!("\nTotal: {} instances", instances.len());
    }
    Ok(())
}

#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "Timestamp")]
    timestamp: String,
    #[tabled(rename = "CPU")]
    cpu: String,
    #[tabled(rename = "Memory")]
    memory: String,
    #[tabled(rename = "Decision")]
    decision: String,
}

impl From<&ResourceHistorySample> for HistoryRow {
    fn from(s: &ResourceHistorySample) -> Self {
        Self {
            timestamp: format_timestamp(&s.timestamp),
            cpu: format_percent(s.cpu_usage),
            memory: format_percent(s.memory_usage),
            decision: s
                .change_request
                .map_or_else(|| "-".to_string(), |d| color_status(d.as_str())),
        }
    }
}

/// Show the trailing `minutes` of resource history for a host
pub async fn show_history(
    client: &ApiClient,
    host: &str,
    minutes: u32,
    format: OutputFormat,
) -> Result<()> {
    let Some(samples) = client.history(host, minutes).await? else {
        print_warning(&format!("Instance {} not found", host));
        return Ok(());
    };

    if format == OutputFormat::Table {
        println!(
            "{} {} (last {} minutes)",
            "Resource history for".bold(),
            host.cyan(),
            minutes
        );
    }
    let rows: Vec<HistoryRow> = samples.iter().map(HistoryRow::from).collect();
    print_items(&samples, rows, format);
    Ok(())
}
