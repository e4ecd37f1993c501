//! Instance lifecycle coordination
//!
//! Tracks the INSTALLING / UP / DOWN / UNINSTALLING state of every host and
//! moves hosts between compute tiers, confirming each change before the new
//! tier is recorded.

mod catalog;
mod confirm;
mod coordinator;

pub use catalog::{LookupMiss, MachineInfo, StaticTierCatalog, TierCatalog, TierLookup};
pub use confirm::{
    ConfirmationLoop, ConfirmationOutcome, ConfirmationSettings, TierChangeTicket,
};
pub use coordinator::{next_status, LifecycleCoordinator};
