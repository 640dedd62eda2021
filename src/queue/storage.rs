//! Record storage trait with SQLite and in-memory implementations.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::warn;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::record::{OfflineRecord, RecordKind};

/// Trait for local record storage backends.
///
/// Every write is a single-record operation; readers never observe a
/// half-written record.
pub trait RecordStore: Send + Sync {
  /// Insert or overwrite the record with the same id.
  fn put(&self, record: &OfflineRecord) -> Result<()>;

  /// Get a single record by id.
  fn get(&self, id: &str) -> Result<Option<OfflineRecord>>;

  /// Get every stored record, oldest first.
  fn get_all(&self) -> Result<Vec<OfflineRecord>>;

  /// Get records not yet accepted by the remote store, oldest first.
  fn get_pending(&self) -> Result<Vec<OfflineRecord>> {
    Ok(
      self
        .get_all()?
        .into_iter()
        .filter(OfflineRecord::is_pending)
        .collect(),
    )
  }

  /// Get pending records, setting aside rows that cannot be decoded
  /// instead of failing the whole read.
  fn scan_pending(&self) -> Result<PendingScan> {
    Ok(PendingScan {
      records: self.get_pending()?,
      unreadable: Vec::new(),
    })
  }

  /// Number of pending records.
  fn pending_count(&self) -> Result<usize> {
    Ok(self.get_pending()?.len())
  }

  /// Delete a record. Returns whether anything was removed.
  fn remove(&self, id: &str) -> Result<bool>;

  /// Delete every synced record. Returns how many were removed.
  fn prune_synced(&self) -> Result<usize>;
}

/// Result of [`RecordStore::scan_pending`].
#[derive(Debug, Default)]
pub struct PendingScan {
  pub records: Vec<OfflineRecord>,
  /// Ids of pending rows that could not be decoded
  pub unreadable: Vec<String>,
}

/// Store that keeps records in memory only.
/// Used for ephemeral runs and tests.
#[derive(Default)]
pub struct MemoryStore {
  records: Mutex<BTreeMap<String, OfflineRecord>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, OfflineRecord>>> {
    self
      .records
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl RecordStore for MemoryStore {
  fn put(&self, record: &OfflineRecord) -> Result<()> {
    self.lock()?.insert(record.id.clone(), record.clone());
    Ok(())
  }

  fn get(&self, id: &str) -> Result<Option<OfflineRecord>> {
    Ok(self.lock()?.get(id).cloned())
  }

  fn get_all(&self) -> Result<Vec<OfflineRecord>> {
    let mut records: Vec<OfflineRecord> = self.lock()?.values().cloned().collect();
    records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    Ok(records)
  }

  fn remove(&self, id: &str) -> Result<bool> {
    Ok(self.lock()?.remove(id).is_some())
  }

  fn prune_synced(&self) -> Result<usize> {
    let mut records = self.lock()?;
    let before = records.len();
    records.retain(|_, record| record.is_pending());
    Ok(before - records.len())
  }
}

/// SQLite-based record storage.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the store at the given path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a private in-memory store.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory queue database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("stride").join("queue.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS offline_records (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    payload BLOB NOT NULL,
    created_at TEXT NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    synced_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_offline_records_synced
    ON offline_records(synced, created_at);
"#;

const SELECT_COLUMNS: &str = "SELECT id, kind, payload, created_at, synced, synced_at FROM offline_records";

/// Raw row as stored, decoded outside the rusqlite closure so decode
/// failures surface as errors instead of being dropped.
struct RawRecord {
  id: String,
  kind: String,
  payload: Vec<u8>,
  created_at: String,
  synced: bool,
  synced_at: Option<String>,
}

impl RawRecord {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    // Rows written by other tools may hold the JSON as TEXT.
    let payload = match row.get_ref(2)? {
      ValueRef::Blob(bytes) | ValueRef::Text(bytes) => bytes.to_vec(),
      other => {
        return Err(rusqlite::Error::InvalidColumnType(
          2,
          "payload".to_string(),
          other.data_type(),
        ))
      }
    };

    Ok(Self {
      id: row.get(0)?,
      kind: row.get(1)?,
      payload,
      created_at: row.get(3)?,
      synced: row.get(4)?,
      synced_at: row.get(5)?,
    })
  }

  fn decode(self) -> Result<OfflineRecord> {
    let kind = RecordKind::from_name(&self.kind)
      .ok_or_else(|| eyre!("Unknown record kind '{}' for record {}", self.kind, self.id))?;
    let payload = serde_json::from_slice(&self.payload)
      .map_err(|e| eyre!("Failed to deserialize payload of record {}: {}", self.id, e))?;
    let timestamp = parse_datetime(&self.created_at)?;
    let synced_at = self.synced_at.as_deref().map(parse_datetime).transpose()?;

    Ok(OfflineRecord {
      id: self.id,
      kind,
      payload,
      timestamp,
      synced: self.synced,
      synced_at,
    })
  }
}

impl SqliteStore {
  fn query_records(&self, filter: &str) -> Result<Vec<OfflineRecord>> {
    self
      .query_raw(filter)?
      .into_iter()
      .map(RawRecord::decode)
      .collect()
  }

  fn query_raw(&self, filter: &str) -> Result<Vec<RawRecord>> {
    let conn = self.lock()?;
    let sql = format!("{} {} ORDER BY created_at, id", SELECT_COLUMNS, filter);

    let mut stmt = conn
      .prepare(&sql)
      .map_err(|e| eyre!("Failed to prepare record query: {}", e))?;

    let rows = stmt
      .query_map([], RawRecord::from_row)
      .map_err(|e| eyre!("Failed to query records: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read record row: {}", e))?;

    Ok(rows)
  }
}

impl RecordStore for SqliteStore {
  fn put(&self, record: &OfflineRecord) -> Result<()> {
    let conn = self.lock()?;
    let payload = serde_json::to_vec(&record.payload)
      .map_err(|e| eyre!("Failed to serialize payload of record {}: {}", record.id, e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO offline_records (id, kind, payload, created_at, synced, synced_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          record.id,
          record.kind.as_str(),
          payload,
          format_datetime(&record.timestamp),
          record.synced,
          record.synced_at.as_ref().map(format_datetime),
        ],
      )
      .map_err(|e| eyre!("Failed to store record {}: {}", record.id, e))?;

    Ok(())
  }

  fn get(&self, id: &str) -> Result<Option<OfflineRecord>> {
    let conn = self.lock()?;
    let sql = format!("{} WHERE id = ?", SELECT_COLUMNS);

    let raw = conn
      .query_row(&sql, params![id], RawRecord::from_row)
      .optional()
      .map_err(|e| eyre!("Failed to load record {}: {}", id, e))?;

    raw.map(RawRecord::decode).transpose()
  }

  fn get_all(&self) -> Result<Vec<OfflineRecord>> {
    self.query_records("")
  }

  fn get_pending(&self) -> Result<Vec<OfflineRecord>> {
    self.query_records("WHERE synced = 0")
  }

  fn scan_pending(&self) -> Result<PendingScan> {
    let mut scan = PendingScan::default();

    for raw in self.query_raw("WHERE synced = 0")? {
      let id = raw.id.clone();
      match raw.decode() {
        Ok(record) => scan.records.push(record),
        Err(e) => {
          warn!(id = %id, "skipping unreadable record: {}", e);
          scan.unreadable.push(id);
        }
      }
    }

    Ok(scan)
  }

  fn pending_count(&self) -> Result<usize> {
    let conn = self.lock()?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM offline_records WHERE synced = 0",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count pending records: {}", e))?;

    usize::try_from(count).map_err(|e| eyre!("Invalid pending count {}: {}", count, e))
  }

  fn remove(&self, id: &str) -> Result<bool> {
    let conn = self.lock()?;

    let removed = conn
      .execute("DELETE FROM offline_records WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove record {}: {}", id, e))?;

    Ok(removed > 0)
  }

  fn prune_synced(&self) -> Result<usize> {
    let conn = self.lock()?;

    conn
      .execute("DELETE FROM offline_records WHERE synced = 1", [])
      .map_err(|e| eyre!("Failed to prune synced records: {}", e))
  }
}

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
fn format_datetime(dt: &DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;
  use serde_json::json;

  fn record(id: &str, offset_secs: i64) -> OfflineRecord {
    let mut record = OfflineRecord::with_id(id, RecordKind::GoalNote, json!({"body": id}));
    record.timestamp = Utc::now() + Duration::seconds(offset_secs);
    record
  }

  fn stores() -> Vec<(&'static str, Box<dyn RecordStore>)> {
    vec![
      ("memory", Box::new(MemoryStore::new())),
      ("sqlite", Box::new(SqliteStore::open_in_memory().unwrap())),
    ]
  }

  #[test]
  fn test_put_then_get() {
    for (name, store) in stores() {
      let original = record("a", 0);
      store.put(&original).unwrap();

      let loaded = store.get("a").unwrap().expect(name);
      assert_eq!(loaded.id, "a", "{name}");
      assert_eq!(loaded.kind, RecordKind::GoalNote, "{name}");
      assert_eq!(loaded.payload, json!({"body": "a"}), "{name}");
      assert!(!loaded.synced, "{name}");
      assert!(store.get("missing").unwrap().is_none(), "{name}");
    }
  }

  #[test]
  fn test_put_overwrites_same_id() {
    for (name, store) in stores() {
      store.put(&record("a", 0)).unwrap();

      let mut replacement = record("a", 1);
      replacement.payload = json!({"body": "changed"});
      store.put(&replacement).unwrap();

      let all = store.get_all().unwrap();
      assert_eq!(all.len(), 1, "{name}");
      assert_eq!(all[0].payload, json!({"body": "changed"}), "{name}");
    }
  }

  #[test]
  fn test_get_all_is_ordered_by_timestamp() {
    for (name, store) in stores() {
      store.put(&record("late", 10)).unwrap();
      store.put(&record("early", -10)).unwrap();
      store.put(&record("middle", 0)).unwrap();

      let ids: Vec<String> = store.get_all().unwrap().into_iter().map(|r| r.id).collect();
      assert_eq!(ids, vec!["early", "middle", "late"], "{name}");
    }
  }

  #[test]
  fn test_pending_filters_synced() {
    for (name, store) in stores() {
      let mut synced = record("synced", 0);
      synced.mark_synced(Utc::now());
      store.put(&synced).unwrap();
      store.put(&record("pending", 1)).unwrap();

      let pending = store.get_pending().unwrap();
      assert_eq!(pending.len(), 1, "{name}");
      assert_eq!(pending[0].id, "pending", "{name}");
      assert_eq!(store.pending_count().unwrap(), 1, "{name}");

      let loaded = store.get("synced").unwrap().unwrap();
      assert!(loaded.synced, "{name}");
      assert!(loaded.synced_at.is_some(), "{name}");
    }
  }

  #[test]
  fn test_remove_and_prune() {
    for (name, store) in stores() {
      let mut synced = record("synced", 0);
      synced.mark_synced(Utc::now());
      store.put(&synced).unwrap();
      store.put(&record("pending", 1)).unwrap();
      store.put(&record("doomed", 2)).unwrap();

      assert!(store.remove("doomed").unwrap(), "{name}");
      assert!(!store.remove("doomed").unwrap(), "{name}");

      assert_eq!(store.prune_synced().unwrap(), 1, "{name}");
      let ids: Vec<String> = store.get_all().unwrap().into_iter().map(|r| r.id).collect();
      assert_eq!(ids, vec!["pending"], "{name}");
    }
  }

  #[test]
  fn test_sqlite_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("queue.db");

    {
      let store = SqliteStore::open_at(&path).unwrap();
      store.put(&record("kept", 0)).unwrap();
    }

    let store = SqliteStore::open_at(&path).unwrap();
    assert_eq!(store.pending_count().unwrap(), 1);
    assert_eq!(store.get("kept").unwrap().unwrap().payload, json!({"body": "kept"}));
  }

  #[test]
  fn test_sqlite_corrupt_row_is_an_error() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .lock()
      .unwrap()
      .execute(
        "INSERT INTO offline_records (id, kind, payload, created_at) VALUES ('x', 'bogus', '{}', '2024-01-01T00:00:00Z')",
        [],
      )
      .unwrap();

    assert!(store.get_all().is_err());
    assert!(store.get("x").is_err());
  }

  #[test]
  fn test_sqlite_scan_pending_sets_aside_undecodable_rows() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.put(&record("good-1", 0)).unwrap();
    store.put(&record("good-2", 1)).unwrap();
    store
      .lock()
      .unwrap()
      .execute(
        "INSERT INTO offline_records (id, kind, payload, created_at) VALUES ('future', 'future-kind', '{}', '2024-01-01T00:00:00Z')",
        [],
      )
      .unwrap();

    assert!(store.get_pending().is_err());

    let scan = store.scan_pending().unwrap();
    let ids: Vec<String> = scan.records.into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec!["good-1", "good-2"]);
    assert_eq!(scan.unreadable, vec!["future".to_string()]);
    assert_eq!(store.pending_count().unwrap(), 3);
  }

  #[test]
  fn test_scan_pending_default_matches_get_pending() {
    let store = MemoryStore::new();
    store.put(&record("a", 0)).unwrap();
    let mut done = record("b", 1);
    done.mark_synced(Utc::now());
    store.put(&done).unwrap();

    let scan = store.scan_pending().unwrap();
    assert_eq!(scan.records.len(), 1);
    assert!(scan.unreadable.is_empty());
  }
}
