//! Core data models for the scaling manager and its agents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scale direction requested for a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeRequest {
    Within,
    Upper,
    Lower,
}

impl ChangeRequest {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeRequest::Within => "WITHIN",
            ChangeRequest::Upper => "UPPER",
            ChangeRequest::Lower => "LOWER",
        }
    }
}

impl fmt::Display for ChangeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the cpu and memory checks of one direction are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Combinator {
    And,
    #[default]
    Or,
}

impl Combinator {
    pub fn combine(self, cpu: bool, memory: bool) -> bool {
        match self {
            Combinator::And => cpu && memory,
            Combinator::Or => cpu || memory,
        }
    }
}

/// Whether confirmed decisions drive tier changes or are only recorded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScalingMode {
    #[default]
    Auto,
    Manual,
}

/// Lifecycle status reported by a host's agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Installing,
    Up,
    Down,
    Uninstalling,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Installing => "INSTALLING",
            AgentStatus::Up => "UP",
            AgentStatus::Down => "DOWN",
            AgentStatus::Uninstalling => "UNINSTALLING",
        };
        f.write_str(s)
    }
}

fn enabled_by_default() -> bool {
    true
}

/// Thresholds for one scale direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectionThresholds {
    /// CPU utilisation percentage
    pub cpu: f64,
    /// Memory utilisation percentage
    pub memory: f64,
    #[serde(default)]
    pub combinator: Combinator,
    /// Sustained violation duration requested by the operator
    #[serde(default)]
    pub duration_minutes: u32,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

impl DirectionThresholds {
    pub fn new(cpu: f64, memory: f64) -> Self {
        Self {
            cpu,
            memory,
            combinator: Combinator::Or,
            duration_minutes: 0,
            enabled: true,
        }
    }

    pub fn with_combinator(mut self, combinator: Combinator) -> Self {
        self.combinator = combinator;
        self
    }
}

/// Scaling thresholds carried by a threshold update and stored per host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdSettings {
    pub upper: DirectionThresholds,
    pub lower: DirectionThresholds,
    /// Consecutive breaching samples (live one included) required for a decision
    pub continuity: u32,
    #[serde(default)]
    pub mode: ScalingMode,
}

impl Default for ThresholdSettings {
    fn default() -> Self {
        Self {
            upper: DirectionThresholds::new(80.0, 80.0),
            lower: DirectionThresholds::new(20.0, 20.0),
            continuity: 3,
            mode: ScalingMode::Auto,
        }
    }
}

/// Latest threshold configuration of a host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub hostname: String,
    pub settings: ThresholdSettings,
    pub updated_at: DateTime<Utc>,
}

/// One received metrics report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceHistorySample {
    pub hostname: String,
    pub timestamp: DateTime<Utc>,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub change_request: Option<ChangeRequest>,
}

/// The concrete tier names a host can move between
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierNames {
    pub high: String,
    pub standard: String,
    pub micro: String,
}

impl TierNames {
    /// Tier one step away from `current` in the given direction.
    ///
    /// An unrecognised current tier is treated as standard. Returns `None`
    /// at the edges and for `WITHIN`.
    pub fn step(&self, current: Option<&str>, direction: ChangeRequest) -> Option<&str> {
        let ladder = [
            self.micro.as_str(),
            self.standard.as_str(),
            self.high.as_str(),
        ];
        let position = current
            .and_then(|c| ladder.iter().position(|t| *t == c))
            .unwrap_or(1);

        match direction {
            ChangeRequest::Upper if position + 1 < ladder.len() => Some(ladder[position + 1]),
            ChangeRequest::Lower if position > 0 => Some(ladder[position - 1]),
            _ => None,
        }
    }
}

/// Latest lifecycle record of a host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub hostname: String,
    pub machine_type: Option<String>,
    pub region: Option<String>,
    pub current_tier: Option<String>,
    pub tier_link_id: Option<String>,
    pub tier_names: Option<TierNames>,
    pub updated_at: DateTime<Utc>,
    pub agent_status: AgentStatus,
    pub agent_version: Option<String>,
    pub last_notice_at: Option<DateTime<Utc>>,
    pub is_installed: bool,
}

impl InstanceStatus {
    /// Empty record for a host seen for the first time
    pub fn new(hostname: impl Into<String>, agent_status: AgentStatus, is_installed: bool) -> Self {
        Self {
            hostname: hostname.into(),
            machine_type: None,
            region: None,
            current_tier: None,
            tier_link_id: None,
            tier_names: None,
            updated_at: Utc::now(),
            agent_status,
            agent_version: None,
            last_notice_at: None,
            is_installed,
        }
    }
}
