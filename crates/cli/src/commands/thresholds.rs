//! Threshold configuration commands

use anyhow::Result;
use clap::{Args, ValueEnum};
use colored::Colorize;
use tabled::Tabled;
use tier_lib::{
    transport::Endpoint, Combinator, DirectionThresholds, Envelope, Payload, ScalingMode,
    ThresholdSettings,
};

use super::deliver;
use crate::client::ApiClient;
use crate::output::{format_timestamp, print_info, print_items, print_json, print_success, print_warning, OutputFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CombinatorArg {
    And,
    Or,
}

impl From<CombinatorArg> for Combinator {
    fn from(arg: CombinatorArg) -> Self {
        match arg {
            CombinatorArg::And => Combinator::And,
            CombinatorArg::Or => Combinator::Or,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Auto,
    Manual,
}

impl From<ModeArg> for ScalingMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Auto => ScalingMode::Auto,
            ModeArg::Manual => ScalingMode::Manual,
        }
    }
}

/// Changes applied on top of the host's current thresholds
#[derive(Debug, Clone, Default, Args)]
pub struct ThresholdOverrides {
    /// CPU percentage above which the host scales up
    #[arg(long)]
    pub upper_cpu: Option<f64>,

    /// Memory percentage above which the host scales up
    #[arg(long)]
    pub upper_memory: Option<f64>,

    #[arg(long, value_enum)]
    pub upper_combinator: Option<CombinatorArg>,

    /// CPU percentage below which the host scales down
    #[arg(long)]
    pub lower_cpu: Option<f64>,

    /// Memory percentage below which the host scales down
    #[arg(long)]
    pub lower_memory: Option<f64>,

    #[arg(long, value_enum)]
    pub lower_combinator: Option<CombinatorArg>,

    /// Consecutive breaching reports required before a decision
    #[arg(long)]
    pub continuity: Option<u32>,

    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,

    #[arg(long, conflicts_with = "enable_upper")]
    pub disable_upper: bool,

    #[arg(long)]
    pub enable_upper: bool,

    #[arg(long, conflicts_with = "enable_lower")]
    pub disable_lower: bool,

    #[arg(long)]
    pub enable_lower: bool,
}

fn apply_direction(
    direction: &mut DirectionThresholds,
    cpu: Option<f64>,
    memory: Option<f64>,
    combinator: Option<CombinatorArg>,
    enabled: Option<bool>,
) {
    if let Some(cpu) = cpu {
        direction.cpu = cpu;
    }
    if let Some(memory) = memory {
        direction.memory = memory;
    }
    if let Some(combinator) = combinator {
        direction.combinator = combinator.into();
    }
    if let Some(enabled) = enabled {
        direction.enabled = enabled;
    }
}

fn toggle(enable: bool, disable: bool) -> Option<bool> {
    match (enable, disable) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

impl ThresholdOverrides {
    pub fn apply(&self, settings: &mut ThresholdSettings) {
        apply_direction(
            &mut settings.upper,
            self.upper_cpu,
            self.upper_memory,
            self.upper_combinator,
            toggle(self.enable_upper, self.disable_upper),
        );
        apply_direction(
            &mut settings.lower,
            self.lower_cpu,
            self.lower_memory,
            self.lower_combinator,
            toggle(self.enable_lower, self.disable_lower),
        );
        if let Some(continuity) = self.continuity {
            settings.continuity = continuity;
        }
        if let Some(mode) = self.mode {
            settings.mode = mode.into();
        }
    }
}

/// Update a host's thresholds through the manager
pub async fn set_thresholds(
    client: &ApiClient,
    manager: &Endpoint,
    host: &str,
    overrides: &ThresholdOverrides,
    format: OutputFormat,
) -> Result<()> {
    let mut settings = match client.thresholds(host).await {
        Ok(Some(current)) => current.settings,
        Ok(None) => {
            print_info(&format!("No thresholds stored for {}, starting from defaults", host));
            ThresholdSettings::default()
        }
        Err(e) => {
            print_warning(&format!("Could not read current thresholds ({:#}), starting from defaults", e));
            ThresholdSettings::default()
        }
    };
    overrides.apply(&mut settings);

    let envelope = Envelope::new(
        host,
        env!("CARGO_PKG_VERSION"),
        Payload::Threshold(settings.clone()),
    );
    deliver(manager, &envelope).await?;

    match format {
        OutputFormat::Json => print_json(&settings),
        OutputFormat::Table => {
            print_success(&format!("Sent thresholds for {} to {}", host, manager));
            print_settings(&settings);
        }
    }
    Ok(())
}

#[derive(Tabled)]
struct DirectionRow {
    #[tabled(rename = "Direction")]
    direction: String,
    #[tabled(rename = "CPU %")]
    cpu: String,
    #[tabled(rename = "Memory %")]
    memory: String,
    #[tabled(rename = "Combinator")]
    combinator: String,
    #[tabled(rename = "Enabled")]
    enabled: String,
}

fn direction_row(name: &str, direction: &DirectionThresholds) -> DirectionRow {
    DirectionRow {
        direction: name.to_string(),
        cpu: format!("{:.1}", direction.cpu),
        memory: format!("{:.1}", direction.memory),
        combinator: format!("{:?}", direction.combinator).to_uppercase(),
        enabled: if direction.enabled { "yes".green().to_string() } else { "no".red().to_string() },
    }
}

fn print_settings(settings: &ThresholdSettings) {
    let rows = vec![
        direction_row("upper", &settings.upper),
        direction_row("lower", &settings.lower),
    ];
    print_items(&[settings], rows, OutputFormat::Table);
    println!(
        "Continuity: {}   Mode: {}",
        settings.continuity.to_string().cyan(),
        format!("{:?}", settings.mode).to_uppercase().cyan()
    );
}

/// Show a host's stored thresholds
pub async fn get_thresholds(client: &ApiClient, host: &str, format: OutputFormat) -> Result<()> {
    let Some(config) = client.thresholds(host).await? else {
        print_warning(&format!("No thresholds stored for {}", host));
        return Ok(());
    };

    match format {
        OutputFormat::Json => print_json(&config),
        OutputFormat::Table => {
            println!("{}", format!("Thresholds for {}", config.hostname).bold());
            println!("Updated: {}", format_timestamp(&config.updated_at));
            print_settings(&config.settings);
        }
    }
    Ok(())
}
