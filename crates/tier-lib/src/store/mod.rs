//! Persistence gateway
//!
//! Records are kept per table and per key (the hostname) in arrival order.
//! Backends only see [`StoredRecord`]s; [`Repository`] maps the typed
//! records of this crate onto them.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::models::{InstanceStatus, ResourceHistorySample, ThresholdConfig};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Logical tables held by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    InstanceStatus,
    Thresholds,
    ResourceHistory,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::InstanceStatus => "instance_status",
            Table::Thresholds => "thresholds",
            Table::ResourceHistory => "resource_history",
        }
    }
}

/// A record as seen by a storage backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub key: String,
    pub recorded_at: DateTime<Utc>,
    pub body: serde_json::Value,
}

/// Errors raised by storage backends
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode {table} record: {source}")]
    Decode {
        table: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage backend contract.
///
/// Query results for a missing table or key are empty, never an error.
pub trait PersistenceGateway: Send + Sync {
    /// Append a record after all existing records of its key
    fn append(&self, table: Table, record: StoredRecord) -> StoreResult<()>;

    /// Last appended record for `key`
    fn find_most_recent(&self, table: Table, key: &str) -> StoreResult<Option<StoredRecord>>;

    /// Records of `key` from the trailing `minutes`, newest first
    fn find_within_window(
        &self,
        table: Table,
        key: &str,
        minutes: u32,
    ) -> StoreResult<Vec<StoredRecord>>;

    /// At most `n` most recent records of `key`, newest first
    fn find_last_n(&self, table: Table, key: &str, n: usize) -> StoreResult<Vec<StoredRecord>>;

    /// Every record of the table, grouped by key in storage order
    fn scan(&self, table: Table) -> StoreResult<Vec<StoredRecord>>;

    /// Replace the whole table with `records`
    fn replace_all(&self, table: Table, records: Vec<StoredRecord>) -> StoreResult<()>;

    /// Drop records of `key` older than `days`; returns how many were removed
    fn prune_older_than(&self, table: Table, key: &str, days: u32) -> StoreResult<usize>;
}

/// Newest-first records of one key within the trailing window
pub(crate) fn select_window(records: &[StoredRecord], minutes: u32) -> Vec<StoredRecord> {
    let cutoff = Utc::now() - ChronoDuration::minutes(i64::from(minutes));
    records
        .iter()
        .rev()
        .filter(|r| r.recorded_at >= cutoff)
        .cloned()
        .collect()
}

pub(crate) fn select_last_n(records: &[StoredRecord], n: usize) -> Vec<StoredRecord> {
    records.iter().rev().take(n).cloned().collect()
}

pub(crate) fn retention_cutoff(days: u32) -> DateTime<Utc> {
    Utc::now() - ChronoDuration::days(i64::from(days))
}

/// A typed record that lives in one table
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    const TABLE: Table;

    fn key(&self) -> &str;

    fn recorded_at(&self) -> DateTime<Utc>;
}

impl Record for InstanceStatus {
    const TABLE: Table = Table::InstanceStatus;

    fn key(&self) -> &str {
        &self.hostname
    }

    fn recorded_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl Record for ThresholdConfig {
    const TABLE: Table = Table::Thresholds;

    fn key(&self) -> &str {
        &self.hostname
    }

    fn recorded_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl Record for ResourceHistorySample {
    const TABLE: Table = Table::ResourceHistory;

    fn key(&self) -> &str {
        &self.hostname
    }

    fn recorded_at(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Typed access to a [`PersistenceGateway`]
#[derive(Clone)]
pub struct Repository {
    gateway: Arc<dyn PersistenceGateway>,
}

impl Repository {
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { gateway }
    }

    /// Repository over a fresh in-memory backend
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn gateway(&self) -> &Arc<dyn PersistenceGateway> {
        &self.gateway
    }

    pub fn append<R: Record>(&self, record: &R) -> StoreResult<()> {
        self.gateway.append(R::TABLE, to_stored(record)?)
    }

    pub fn most_recent<R: Record>(&self, key: &str) -> StoreResult<Option<R>> {
        self.gateway
            .find_most_recent(R::TABLE, key)?
            .map(from_stored::<R>)
            .transpose()
    }

    /// Newest first
    pub fn within_window<R: Record>(&self, key: &str, minutes: u32) -> StoreResult<Vec<R>> {
        self.gateway
            .find_within_window(R::TABLE, key, minutes)?
            .into_iter()
            .map(from_stored::<R>)
            .collect()
    }

    /// Newest first
    pub fn last_n<R: Record>(&self, key: &str, n: usize) -> StoreResult<Vec<R>> {
        self.gateway
            .find_last_n(R::TABLE, key, n)?
            .into_iter()
            .map(from_stored::<R>)
            .collect()
    }

    /// Latest record of every key, ordered by key
    pub fn latest_per_key<R: Record>(&self) -> StoreResult<Vec<R>> {
        let mut latest: HashMap<String, StoredRecord> = HashMap::new();
        for record in self.gateway.scan(R::TABLE)? {
            latest.insert(record.key.clone(), record);
        }

        let mut records: Vec<StoredRecord> = latest.into_values().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records.into_iter().map(from_stored::<R>).collect()
    }

    /// Rewrite a latest-wins table so only the newest record of each key remains.
    /// Returns the number of records dropped.
    pub fn compact_latest<R: Record>(&self) -> StoreResult<usize> {
        let all = self.gateway.scan(R::TABLE)?;
        let before = all.len();

        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, StoredRecord> = HashMap::new();
        for record in all {
            if !latest.contains_key(&record.key) {
                order.push(record.key.clone());
            }
            latest.insert(record.key.clone(), record);
        }

        let kept: Vec<StoredRecord> = order
            .into_iter()
            .filter_map(|key| latest.remove(&key))
            .collect();
        let dropped = before - kept.len();

        if dropped > 0 {
            self.gateway.replace_all(R::TABLE, kept)?;
        }
        Ok(dropped)
    }

    pub fn prune_older_than<R: Record>(&self, key: &str, days: u32) -> StoreResult<usize> {
        self.gateway.prune_older_than(R::TABLE, key, days)
    }
}

fn to_stored<R: Record>(record: &R) -> StoreResult<StoredRecord> {
    Ok(StoredRecord {
        key: record.key().to_string(),
        recorded_at: record.recorded_at(),
        body: serde_json::to_value(record).map_err(StoreError::Encode)?,
    })
}

fn from_stored<R: Record>(record: StoredRecord) -> StoreResult<R> {
    serde_json::from_value(record.body).map_err(|source| StoreError::Decode {
        table: R::TABLE.name(),
        source,
    })
}
