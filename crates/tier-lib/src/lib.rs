//! Shared library for the tier scaling manager and its host agents
//!
//! This crate provides the core functionality for:
//! - Line-framed envelope transport with retry and a durable outbox
//! - Dispatch of envelopes to per-kind notice handlers
//! - Threshold evaluation with continuity
//! - Instance lifecycle tracking and confirmed tier changes
//! - Host metrics collection
//! - Health checks and observability

pub mod actions;
pub mod collector;
pub mod engine;
pub mod envelope;
pub mod handlers;
pub mod health;
pub mod lifecycle;
pub mod models;
pub mod observability;
pub mod outbox;
pub mod router;
pub mod settings;
pub mod shutdown;
pub mod store;
pub mod transport;

pub use envelope::{Envelope, NoticeKind, Payload};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ScalerMetrics, StructuredLogger};
pub use router::{MessageRouter, NoticeHandler};
pub use shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
pub use store::Repository;

/// Library version, sent as `agentVersion`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
