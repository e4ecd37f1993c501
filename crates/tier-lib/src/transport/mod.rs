//! Line-framed JSON transport over TCP
//!
//! Each send opens a fresh connection, writes exactly one envelope line and
//! closes the write half. There is no response. Receiving is handled by
//! [`listen`], which decodes lines and hands envelopes to a bounded worker
//! pool that dispatches through the [`MessageRouter`](crate::router::MessageRouter).

mod listener;
mod messenger;
mod sender;


pub use listener::{listen, ListenerHandle, ListenerOptions, DEFAULT_MAX_LINE_BYTES};
pub use messenger::Messenger;
pub use sender::TcpTransport;

use crate::envelope::Envelope;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Retry behaviour of a single send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one
    pub retry_max: u32,
    /// Pause between attempts
    pub retry_interval: Duration,
    /// Bound on each connect-and-write attempt
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_max: 3,
            retry_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// One attempt, no retries; used by outbox resends
    pub fn single_attempt(timeout: Duration) -> Self {
        Self {
            retry_max: 0,
            retry_interval: Duration::ZERO,
            timeout,
        }
    }
}

/// Destination of a send
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Result of a send. Failure is a value, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered { attempts: u32 },
    Failed { attempts: u32 },
    /// Shutdown interrupted the retry loop
    Cancelled,
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered { .. })
    }
}

/// Sends one envelope to one endpoint
#[async_trait]
pub trait EnvelopeSender: Send + Sync {
    async fn send(&self, endpoint: &Endpoint, envelope: &Envelope, policy: &RetryPolicy)
        -> Delivery;
}
