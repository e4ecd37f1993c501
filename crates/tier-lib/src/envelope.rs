//! Envelope model and the line-oriented JSON codec
//!
//! Every message on the wire is one JSON object terminated by `\n`. The
//! `noticeKind` field selects the payload; payload fields sit next to the
//! common header fields in the same object.

use crate::models::{ChangeRequest, ThresholdSettings};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Name of the discriminator field
pub const DISCRIMINATOR: &str = "noticeKind";

/// Kind of notice carried by an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NoticeKind {
    Install,
    Uninstall,
    Up,
    Down,
    Metrics,
    Threshold,
}

impl NoticeKind {
    pub const ALL: [NoticeKind; 6] = [
        NoticeKind::Install,
        NoticeKind::Uninstall,
        NoticeKind::Up,
        NoticeKind::Down,
        NoticeKind::Metrics,
        NoticeKind::Threshold,
    ];

    pub const LIFECYCLE: [NoticeKind; 4] = [
        NoticeKind::Install,
        NoticeKind::Uninstall,
        NoticeKind::Up,
        NoticeKind::Down,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeKind::Install => "INSTALL",
            NoticeKind::Uninstall => "UNINSTALL",
            NoticeKind::Up => "UP",
            NoticeKind::Down => "DOWN",
            NoticeKind::Metrics => "METRICS",
            NoticeKind::Threshold => "THRESHOLD",
        }
    }
}

impl fmt::Display for NoticeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NoticeKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NoticeKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownKind(s.to_string()))
    }
}

/// Utilisation report sent by an agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    #[serde(default)]
    pub change_request: Option<ChangeRequest>,
}

/// Kind-specific part of an envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "noticeKind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Payload {
    Install,
    Uninstall,
    Up,
    Down,
    Metrics(MetricsReport),
    Threshold(ThresholdSettings),
}

impl Payload {
    pub fn kind(&self) -> NoticeKind {
        match self {
            Payload::Install => NoticeKind::Install,
            Payload::Uninstall => NoticeKind::Uninstall,
            Payload::Up => NoticeKind::Up,
            Payload::Down => NoticeKind::Down,
            Payload::Metrics(_) => NoticeKind::Metrics,
            Payload::Threshold(_) => NoticeKind::Threshold,
        }
    }

    /// Header-only payload for a lifecycle kind
    pub fn lifecycle(kind: NoticeKind) -> Option<Self> {
        match kind {
            NoticeKind::Install => Some(Payload::Install),
            NoticeKind::Uninstall => Some(Payload::Uninstall),
            NoticeKind::Up => Some(Payload::Up),
            NoticeKind::Down => Some(Payload::Down),
            NoticeKind::Metrics | NoticeKind::Threshold => None,
        }
    }
}

/// A typed message exchanged over the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub agent_version: String,
    /// Host key; case-sensitive and never empty
    pub instance_name: String,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    pub fn new(
        instance_name: impl Into<String>,
        agent_version: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            agent_version: agent_version.into(),
            instance_name: instance_name.into(),
            payload,
        }
    }

    pub fn kind(&self) -> NoticeKind {
        self.payload.kind()
    }

    /// Serialize to a single newline-terminated JSON line
    pub fn encode_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Reasons an inbound line is discarded
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("line is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("missing `noticeKind` discriminator")]
    MissingDiscriminator,

    #[error("unrecognised notice kind `{0}`")]
    UnknownKind(String),

    #[error("invalid {kind} envelope: {source}")]
    InvalidPayload {
        kind: NoticeKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("envelope has an empty instance name")]
    EmptyInstanceName,
}

impl DecodeError {
    /// Short label used for rejection metrics
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::Malformed(_) => "malformed",
            DecodeError::MissingDiscriminator => "missing_discriminator",
            DecodeError::UnknownKind(_) => "unknown_kind",
            DecodeError::InvalidPayload { .. } => "invalid_payload",
            DecodeError::EmptyInstanceName => "empty_instance_name",
        }
    }
}

/// Decode one line read from the wire.
///
/// The discriminator is checked before the payload so an unknown kind is
/// reported as such rather than as a generic shape error.
pub fn decode_line(line: &str) -> Result<Envelope, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(line).map_err(DecodeError::Malformed)?;

    let kind: NoticeKind = value
        .get(DISCRIMINATOR)
        .and_then(serde_json::Value::as_str)
        .ok_or(DecodeError::MissingDiscriminator)?
        .parse()?;

    let envelope: Envelope = serde_json::from_value(value)
        .map_err(|source| DecodeError::InvalidPayload { kind, source })?;

    if envelope.instance_name.is_empty() {
        return Err(DecodeError::EmptyInstanceName);
    }

    Ok(envelope)
}
