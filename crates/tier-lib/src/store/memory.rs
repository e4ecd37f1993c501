//! In-memory storage backend

use super::{
    retention_cutoff, select_last_n, select_window, PersistenceGateway, StoreResult, StoredRecord,
    Table,
};
use dashmap::DashMap;

/// Storage backend that keeps everything in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: DashMap<(Table, String), Vec<StoredRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceGateway for MemoryStore {
    fn append(&self, table: Table, record: StoredRecord) -> StoreResult<()> {
        self.tables
            .entry((table, record.key.clone()))
            .or_default()
            .push(record);
        Ok(())
    }

    fn find_most_recent(&self, table: Table, key: &str) -> StoreResult<Option<StoredRecord>> {
        Ok(self
            .tables
            .get(&(table, key.to_string()))
            .and_then(|records| records.last().cloned()))
    }

    fn find_within_window(
        &self,
        table: Table,
        key: &str,
        minutes: u32,
    ) -> StoreResult<Vec<StoredRecord>> {
        Ok(self
            .tables
            .get(&(table, key.to_string()))
            .map(|records| select_window(&records, minutes))
            .unwrap_or_default())
    }

    fn find_last_n(&self, table: Table, key: &str, n: usize) -> StoreResult<Vec<StoredRecord>> {
        Ok(self
            .tables
            .get(&(table, key.to_string()))
            .map(|records| select_last_n(&records, n))
            .unwrap_or_default())
    }

    fn scan(&self, table: Table) -> StoreResult<Vec<StoredRecord>> {
        let mut keys: Vec<String> = self
            .tables
            .iter()
            .filter(|entry| entry.key().0 == table)
            .map(|entry| entry.key().1.clone())
            .collect();
        keys.sort();

        let mut records = Vec::new();
        for key in keys {
            if let Some(entry) = self.tables.get(&(table, key)) {
                records.extend(entry.iter().cloned());
            }
        }
        Ok(records)
    }

    fn replace_all(&self, table: Table, records: Vec<StoredRecord>) -> StoreResult<()> {
        self.tables.retain(|(t, _), _| *t != table);
        for record in records {
            self.append(table, record)?;
        }
        Ok(())
    }

    fn prune_older_than(&self, table: Table, key: &str, days: u32) -> StoreResult<usize> {
        let cutoff = retention_cutoff(days);
        let Some(mut records) = self.tables.get_mut(&(table, key.to_string())) else {
            return Ok(0);
        };

        let before = records.len();
        records.retain(|r| r.recorded_at >= cutoff);
        Ok(before - records.len())
    }
}
