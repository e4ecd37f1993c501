//! File-backed storage
//!
//! Layout: `<root>/<table>/<escaped key>.jsonl`, one [`StoredRecord`] per
//! line in append order. Rewrites (prune, replace) go through a temp file
//! and a rename so a crash never leaves a half-written table.

use super::{
    retention_cutoff, select_last_n, select_window, PersistenceGateway, StoreError, StoreResult,
    StoredRecord, Table,
};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

const EXTENSION: &str = "jsonl";

/// JSON-lines store rooted at a data directory
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    /// Serializes writers; readers go straight to disk
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open a store under `root`, creating the directory if needed
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;

        debug!(path = %root.display(), "Opened file store");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_dir(&self, table: Table) -> PathBuf {
        self.root.join(table.name())
    }

    fn key_path(&self, table: Table, key: &str) -> PathBuf {
        self.table_dir(table)
            .join(format!("{}.{}", escape_key(key), EXTENSION))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        // A poisoned lock only means another writer panicked; the files are still consistent
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_key(&self, table: Table, key: &str) -> StoreResult<Vec<StoredRecord>> {
        read_records(&self.key_path(table, key))
    }

    fn append_line(&self, path: &Path, record: &StoredRecord) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
        }

        let mut line = serde_json::to_string(record).map_err(StoreError::Encode)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| io_error(path, source))?;
        file.write_all(line.as_bytes())
            .map_err(|source| io_error(path, source))?;
        Ok(())
    }
}

impl PersistenceGateway for FileStore {
    fn append(&self, table: Table, record: StoredRecord) -> StoreResult<()> {
        let path = self.key_path(table, &record.key);
        let _guard = self.lock();
        self.append_line(&path, &record)
    }

    fn find_most_recent(&self, table: Table, key: &str) -> StoreResult<Option<StoredRecord>> {
        Ok(self.read_key(table, key)?.pop())
    }

    fn find_within_window(
        &self,
        table: Table,
        key: &str,
        minutes: u32,
    ) -> StoreResult<Vec<StoredRecord>> {
        Ok(select_window(&self.read_key(table, key)?, minutes))
    }

    fn find_last_n(&self, table: Table, key: &str, n: usize) -> StoreResult<Vec<StoredRecord>> {
        Ok(select_last_n(&self.read_key(table, key)?, n))
    }

    fn scan(&self, table: Table) -> StoreResult<Vec<StoredRecord>> {
        let dir = self.table_dir(table);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(io_error(&dir, source)),
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == EXTENSION))
            .collect();
        paths.sort();

        let mut records = Vec::new();
        for path in paths {
            records.extend(read_records(&path)?);
        }
        Ok(records)
    }

    fn replace_all(&self, table: Table, records: Vec<StoredRecord>) -> StoreResult<()> {
        let _guard = self.lock();
        let dir = self.table_dir(table);

        let mut by_key: Vec<(String, Vec<StoredRecord>)> = Vec::new();
        for record in records {
            match by_key.iter_mut().find(|(key, _)| *key == record.key) {
                Some((_, group)) => group.push(record),
                None => by_key.push((record.key.clone(), vec![record])),
            }
        }

        // Remove key files that no longer have records
        if let Ok(entries) = fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let keep = by_key
                    .iter()
                    .any(|(key, _)| self.key_path(table, key) == path);
                if !keep && path.extension().is_some_and(|ext| ext == EXTENSION) {
                    fs::remove_file(&path).map_err(|source| io_error(&path, source))?;
                }
            }
        }

        for (key, group) in by_key {
            write_records(&self.key_path(table, &key), &group)?;
        }

        debug!(table = table.name(), "Replaced table contents");
        Ok(())
    }

    fn prune_older_than(&self, table: Table, key: &str, days: u32) -> StoreResult<usize> {
        let _guard = self.lock();
        let path = self.key_path(table, key);
        let records = read_records(&path)?;
        if records.is_empty() {
            return Ok(0);
        }

        let cutoff = retention_cutoff(days);
        let before = records.len();
        let kept: Vec<StoredRecord> = records
            .into_iter()
            .filter(|r| r.recorded_at >= cutoff)
            .collect();
        let removed = before - kept.len();

        if removed > 0 {
            write_records(&path, &kept)?;
            debug!(table = table.name(), key, removed, "Pruned expired records");
        }
        Ok(removed)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read every record of one key file; a missing file is empty
fn read_records(path: &Path) -> StoreResult<Vec<StoredRecord>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(io_error(path, source)),
    };

    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| io_error(path, source))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StoredRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(path = %path.display(), line = index + 1, error = %e, "Skipping corrupt record");
            }
        }
    }
    Ok(records)
}

/// Atomically rewrite a key file with `records`
fn write_records(path: &Path, records: &[StoredRecord]) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
    }

    let mut data = Vec::new();
    for record in records {
        serde_json::to_writer(&mut data, record).map_err(StoreError::Encode)?;
        data.push(b'\n');
    }

    let temp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .map_err(|source| io_error(&temp_path, source))?;
    file.write_all(&data)
        .map_err(|source| io_error(&temp_path, source))?;
    file.sync_all()
        .map_err(|source| io_error(&temp_path, source))?;

    fs::rename(&temp_path, path).map_err(|source| io_error(path, source))
}

/// Map a host key onto a safe file name; anything outside `[A-Za-z0-9._-]`
/// becomes `%XX`. Distinct keys always map to distinct names.
fn escape_key(key: &str) -> String {
    let mut escaped = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' => escaped.push(byte as char),
            b'.' if !escaped.is_empty() => escaped.push('.'),
            _ => escaped.push_str(&format!("%{:02X}", byte)),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn record(key: &str, days_ago: i64, value: i64) -> StoredRecord {
        StoredRecord {
            key: key.to_string(),
            recorded_at: Utc::now() - Duration::days(days_ago),
            body: serde_json::json!({ "value": value }),
        }
    }

    #[test]
    fn test_append_and_query_order() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        for value in 1..=4 {
            store
                .append(Table::ResourceHistory, record("web-01", 0, value))
                .unwrap();
        }

        let latest = store
            .find_most_recent(Table::ResourceHistory, "web-01")
            .unwrap()
            .unwrap();
        assert_eq!(latest.body["value"], 4);

        let last = store
            .find_last_n(Table::ResourceHistory, "web-01", 2)
            .unwrap();
        assert_eq!(last[0].body["value"], 4);
        assert_eq!(last[1].body["value"], 3);
    }

    #[test]
    fn test_missing_table_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        assert!(store.scan(Table::Thresholds).unwrap().is_empty());
        assert!(store
            .find_within_window(Table::ResourceHistory, "nobody", 60)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_prune_rewrites_file() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store
            .append(Table::ResourceHistory, record("db", 10, 1))
            .unwrap();
        store
            .append(Table::ResourceHistory, record("db", 0, 2))
            .unwrap();

        assert_eq!(
            store
                .prune_older_than(Table::ResourceHistory, "db", 7)
                .unwrap(),
            1
        );

        // Reopen to read back from disk
        let reopened = FileStore::open(dir.path()).unwrap();
        let remaining = reopened
            .find_last_n(Table::ResourceHistory, "db", 10)
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].body["value"], 2);
    }

    #[test]
    fn test_replace_all_drops_missing_keys() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store
            .append(Table::InstanceStatus, record("a", 0, 1))
            .unwrap();
        store
            .append(Table::InstanceStatus, record("b", 0, 2))
            .unwrap();

        store
            .replace_all(Table::InstanceStatus, vec![record("b", 0, 3)])
            .unwrap();

        let all = store.scan(Table::InstanceStatus).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key, "b");
        assert_eq!(all[0].body["value"], 3);
    }

    #[test]
    fn test_corrupt_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store
            .append(Table::Thresholds, record("h", 0, 1))
            .unwrap();

        let path = store.key_path(Table::Thresholds, "h");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{truncated\n").unwrap();

        assert_eq!(store.find_last_n(Table::Thresholds, "h", 5).unwrap().len(), 1);
    }

    #[test]
    fn test_escape_key() {
        assert_eq!(escape_key("web-01.prod"), "web-01.prod");
        assert_eq!(escape_key("a/b"), "a%2Fb");
        assert_eq!(escape_key("..x"), "%2E.x");
        assert_ne!(escape_key("a%2Fb"), escape_key("a/b"));
    }
}
