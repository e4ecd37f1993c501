//! External actions against the infrastructure: agent install/uninstall and
//! tier changes. The command implementation runs operator-provided shell
//! templates with `{host}` and `{tier}` placeholders.

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("no command configured for {action}")]
    NotConfigured { action: &'static str },

    #[error("refusing to substitute unsafe argument `{0}`")]
    UnsafeArgument(String),

    #[error("failed to spawn {action}: {source}")]
    Spawn {
        action: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{action} timed out after {timeout:?}")]
    Timeout {
        action: &'static str,
        timeout: Duration,
    },

    #[error("{action} exited with {status}: {stderr}")]
    Failed {
        action: &'static str,
        status: String,
        stderr: String,
    },
}

#[async_trait]
pub trait ActionRunner: Send + Sync {
    async fn install(&self, hostname: &str) -> Result<(), ActionError>;

    async fn uninstall(&self, hostname: &str) -> Result<(), ActionError>;

    /// Request that `hostname` moves to `tier`; completes asynchronously
    async fn apply_tier_change(&self, hostname: &str, tier: &str) -> Result<(), ActionError>;

    /// Whether a requested tier change has finished
    async fn tier_change_complete(&self, hostname: &str, tier: &str) -> Result<bool, ActionError>;
}

/// Shell command templates
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CommandTemplates {
    pub install: Option<String>,
    pub uninstall: Option<String>,
    pub apply_tier_change: Option<String>,
    pub check_tier_change: Option<String>,
}

/// [`ActionRunner`] backed by `sh -c` and [`CommandTemplates`]
#[derive(Debug, Clone)]
pub struct CommandActions {
    templates: CommandTemplates,
    timeout: Duration,
}

impl CommandActions {
    pub fn new(templates: CommandTemplates, timeout: Duration) -> Self {
        Self { templates, timeout }
    }

    fn render(
        &self,
        action: &'static str,
        template: Option<&String>,
        hostname: &str,
        tier: Option<&str>,
    ) -> Result<String, ActionError> {
        let template = template.ok_or(ActionError::NotConfigured { action })?;

        let mut command = template.replace("{host}", safe_argument(hostname)?);
        if let Some(tier) = tier {
            command = command.replace("{tier}", safe_argument(tier)?);
        }
        Ok(command)
    }

    async fn run(&self, action: &'static str, command: &str) -> Result<(), ActionError> {
        debug!(action, command, "Running external action");

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ActionError::Spawn { action, source })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ActionError::Timeout {
                action,
                timeout: self.timeout,
            })?
            .map_err(|source| ActionError::Spawn { action, source })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ActionError::Failed {
                action,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Host and tier names are substituted into a shell command line
fn safe_argument(value: &str) -> Result<&str, ActionError> {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if safe {
        Ok(value)
    } else {
        Err(ActionError::UnsafeArgument(value.to_string()))
    }
}

#[async_trait]
impl ActionRunner for CommandActions {
    async fn install(&self, hostname: &str) -> Result<(), ActionError> {
        let command = self.render("install", self.templates.install.as_ref(), hostname, None)?;
        self.run("install", &command).await
    }

    async fn uninstall(&self, hostname: &str) -> Result<(), ActionError> {
        let command = self.render("uninstall", self.templates.uninstall.as_ref(), hostname, None)?;
        self.run("uninstall", &command).await
    }

    async fn apply_tier_change(&self, hostname: &str, tier: &str) -> Result<(), ActionError> {
        let command = self.render(
            "apply_tier_change",
            self.templates.apply_tier_change.as_ref(),
            hostname,
            Some(tier),
        )?;
        self.run("apply_tier_change", &command).await
    }

    async fn tier_change_complete(&self, hostname: &str, tier: &str) -> Result<bool, ActionError> {
        let command = self.render(
            "check_tier_change",
            self.templates.check_tier_change.as_ref(),
            hostname,
            Some(tier),
        )?;

        match self.run("check_tier_change", &command).await {
            Ok(()) => Ok(true),
            Err(e @ (ActionError::Failed { .. } | ActionError::Timeout { .. })) => {
                debug!(hostname, tier, reason = %e, "Tier change not complete yet");
                Ok(false)
            }
            Err(e) => {
                warn!(hostname, tier, error = %e, "Tier change check could not run");
                Err(e)
            }
        }
    }
}
