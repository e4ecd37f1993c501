//! Lifecycle notices sent on behalf of a host

use anyhow::Result;
use clap::ValueEnum;
use tier_lib::{transport::Endpoint, Envelope, NoticeKind, Payload};

use super::deliver;
use crate::output::{print_json, print_success, OutputFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Notice {
    Install,
    Uninstall,
    Up,
    Down,
}

impl From<Notice> for NoticeKind {
    fn from(notice: Notice) -> Self {
        match notice {
            Notice::Install => NoticeKind::Install,
            Notice::Uninstall => NoticeKind::Uninstall,
            Notice::Up => NoticeKind::Up,
            Notice::Down => NoticeKind::Down,
        }
    }
}

pub fn lifecycle_envelope(notice: Notice, host: &str) -> Envelope {
    let payload = match notice {
        Notice::Install => Payload::Install,
        Notice::Uninstall => Payload::Uninstall,
        Notice::Up => Payload::Up,
        Notice::Down => Payload::Down,
    };
    Envelope::new(host, env!("CARGO_PKG_VERSION"), payload)
}

/// Send a lifecycle notice for `host` to the manager
pub async fn send_notice(
    manager: &Endpoint,
    notice: Notice,
    host: &str,
    format: OutputFormat,
) -> Result<()> {
    let envelope = lifecycle_envelope(notice, host);
    deliver(manager, &envelope).await?;

    match format {
        OutputFormat::Json => print_json(&envelope),
        OutputFormat::Table => print_success(&format!(
            "Sent {} for {} to {}",
            NoticeKind::from(notice),
            host,
            manager
        )),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_envelope_kind() {
        let envelope = lifecycle_envelope(Notice::Uninstall, "db-02");
        assert_eq!(envelope.kind(), NoticeKind::Uninstall);
        assert_eq!(envelope.instance_name, "db-02");

        let line = lifecycle_envelope(Notice::Up, "db-02").encode_line().unwrap();
        assert!(line.contains(r#""noticeKind":"UP""#));
    }
}
