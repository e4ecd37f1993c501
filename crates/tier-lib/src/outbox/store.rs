//! Outbox storage backends

use super::OutboxEntry;
use crate::store::{StoreError, StoreResult};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Durable holding area for undelivered envelopes
pub trait OutboxStore: Send + Sync {
    fn put(&self, entry: &OutboxEntry) -> StoreResult<()>;

    /// Pending entries, oldest first
    fn list(&self) -> StoreResult<Vec<OutboxEntry>>;

    /// Removing an entry that is already gone is not an error
    fn remove(&self, entry: &OutboxEntry) -> StoreResult<()>;
}

/// One JSON file per entry. File names start with the zero-padded creation
/// time so lexical order is age order.
#[derive(Debug)]
pub struct FileOutboxStore {
    dir: PathBuf,
}

impl FileOutboxStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn entry_path(&self, entry: &OutboxEntry) -> PathBuf {
        let nanos = entry.created_at.timestamp_nanos_opt().unwrap_or_default();
        self.dir
            .join(format!("{:020}-{}.json", nanos.max(0), entry.id))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl OutboxStore for FileOutboxStore {
    fn put(&self, entry: &OutboxEntry) -> StoreResult<()> {
        fs::create_dir_all(&self.dir).map_err(|source| io_error(&self.dir, source))?;

        let path = self.entry_path(entry);
        let json = serde_json::to_vec(entry).map_err(StoreError::Encode)?;

        let temp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|source| io_error(&temp_path, source))?;
        file.write_all(&json)
            .map_err(|source| io_error(&temp_path, source))?;
        file.sync_all()
            .map_err(|source| io_error(&temp_path, source))?;

        fs::rename(&temp_path, &path).map_err(|source| io_error(&path, source))
    }

    fn list(&self) -> StoreResult<Vec<OutboxEntry>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(io_error(&self.dir, source)),
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut pending = Vec::with_capacity(paths.len());
        for path in paths {
            let data = match fs::read(&path) {
                Ok(data) => data,
                // Removed by a concurrent sweep
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(source) => return Err(io_error(&path, source)),
            };
            match serde_json::from_slice::<OutboxEntry>(&data) {
                Ok(entry) => pending.push(entry),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable outbox entry");
                }
            }
        }
        Ok(pending)
    }

    fn remove(&self, entry: &OutboxEntry) -> StoreResult<()> {
        let path = self.entry_path(entry);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(io_error(&path, source)),
        }
    }
}

/// Process-local outbox storage
#[derive(Debug, Default)]
pub struct MemoryOutboxStore {
    entries: Mutex<Vec<OutboxEntry>>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<OutboxEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl OutboxStore for MemoryOutboxStore {
    fn put(&self, entry: &OutboxEntry) -> StoreResult<()> {
        self.entries().push(entry.clone());
        Ok(())
    }

    fn list(&self) -> StoreResult<Vec<OutboxEntry>> {
        let mut pending = self.entries().clone();
        pending.sort_by_key(|entry| entry.created_at);
        Ok(pending)
    }

    fn remove(&self, entry: &OutboxEntry) -> StoreResult<()> {
        self.entries().retain(|e| e.id != entry.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, Payload};
    use crate::transport::Endpoint;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn entry(minutes_ago: i64) -> OutboxEntry {
        let mut entry = OutboxEntry::new(
            Endpoint::new("manager", 7070),
            Envelope::new("web-01", "1.0", Payload::Up),
        );
        entry.created_at = Utc::now() - Duration::minutes(minutes_ago);
        entry
    }

    #[test]
    fn test_file_store_lists_oldest_first() {
        let dir = TempDir::new().unwrap();
        let store = FileOutboxStore::new(dir.path().join("outbox"));

        let newer = entry(1);
        let older = entry(30);
        store.put(&newer).unwrap();
        store.put(&older).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, older.id);
        assert_eq!(listed[1].id, newer.id);
    }

    #[test]
    fn test_file_store_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = FileOutboxStore::new(dir.path());
        let e = entry(0);

        store.put(&e).unwrap();
        store.remove(&e).unwrap();
        store.remove(&e).unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_missing_directory_lists_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileOutboxStore::new(dir.path().join("never-created"));
        assert!(store.list().unwrap().is_empty());
    }
}
