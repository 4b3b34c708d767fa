//! Partition storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::traits::CachedEntry;
use crate::http::Response;

/// Trait for partition storage backends.
///
/// Every write replaces whole entries, so concurrent writers (other worker
/// instances sharing the same database) never observe a torn entry.
pub trait PartitionStore: Send + Sync {
  /// Create the partition if it does not exist yet.
  fn open(&self, name: &str) -> Result<()>;

  /// Names of all existing partitions.
  fn list_names(&self) -> Result<BTreeSet<String>>;

  /// Delete a partition and all of its entries. Returns whether it existed.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Look up an entry. A miss is `Ok(None)`.
  fn get(&self, partition: &str, key: &str) -> Result<Option<CachedEntry>>;

  /// Store an entry, overwriting any previous one for the key.
  fn put(&self, partition: &str, key: &str, response: &Response) -> Result<()>;

  /// Store several entries atomically: either all are written or none are.
  fn put_all(&self, partition: &str, entries: &[(String, Response)]) -> Result<()>;

  /// Number of entries in a partition (0 when it does not exist).
  fn entry_count(&self, partition: &str) -> Result<usize>;

  /// Last recorded lifecycle phase of a worker version.
  fn worker_phase(&self, version: &str) -> Result<Option<String>>;

  fn set_worker_phase(&self, version: &str, phase: &str) -> Result<()>;
}

/// SQLite-based partition storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the partition database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    // Other worker instances may hold the write lock briefly
    conn
      .busy_timeout(Duration::from_secs(5))
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;
    let _mode: String = conn
      .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to enable WAL: {}", e))?;

    Self::with_connection(conn)
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for partition tables.
const CACHE_SCHEMA: &str = r#"
-- Named partitions; existence is tracked separately so empty partitions survive
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Captured responses keyed by normalized request
CREATE TABLE IF NOT EXISTS entries (
    partition TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers BLOB NOT NULL,
    body BLOB NOT NULL,
    digest TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition, request_key)
);

CREATE INDEX IF NOT EXISTS idx_entries_partition ON entries(partition);

-- Lifecycle phase per worker version, independent of partition contents
CREATE TABLE IF NOT EXISTS worker_state (
    version TEXT PRIMARY KEY,
    phase TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

fn body_digest(body: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(body);
  hex::encode(hasher.finalize())
}

fn insert_entry(conn: &Connection, partition: &str, key: &str, response: &Response) -> Result<()> {
  let headers = serde_json::to_vec(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries (partition, request_key, status, headers, body, digest, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        partition,
        key,
        response.status,
        headers,
        response.body,
        body_digest(&response.body)
      ],
    )
    .map_err(|e| eyre!("Failed to store entry: {}", e))?;

  Ok(())
}

fn ensure_partition(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to create partition {}: {}", name, e))?;
  Ok(())
}

impl PartitionStore for SqliteStorage {
  fn open(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    ensure_partition(&conn, name)
  }

  fn list_names(&self) -> Result<BTreeSet<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM partitions")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<BTreeSet<_>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    // Take the write lock up front so concurrent writers wait on busy_timeout
    let tx = conn
      .transaction_with_behavior(TransactionBehavior::Immediate)
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE partition = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM partitions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get(&self, partition: &str, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, digest, cached_at FROM entries
         WHERE partition = ? AND request_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(u16, Vec<u8>, Vec<u8>, String, String)> = stmt
      .query_row(params![partition, key], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    let Some((status, headers, body, digest, cached_at)) = row else {
      return Ok(None);
    };

    if body_digest(&body) != digest {
      tracing::warn!(partition, key, "Discarding cached entry with mismatched digest");
      return Ok(None);
    }

    let headers: Vec<(String, String)> = serde_json::from_slice(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;

    Ok(Some(CachedEntry {
      response: Response {
        status,
        headers,
        body,
      },
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn put(&self, partition: &str, key: &str, response: &Response) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction_with_behavior(TransactionBehavior::Immediate)
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_partition(&tx, partition)?;
    insert_entry(&tx, partition, key, response)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn put_all(&self, partition: &str, entries: &[(String, Response)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction_with_behavior(TransactionBehavior::Immediate)
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_partition(&tx, partition)?;
    for (key, response) in entries {
      insert_entry(&tx, partition, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn entry_count(&self, partition: &str) -> Result<usize> {
    let conn = self.lock()?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE partition = ?",
        params![partition],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries: {}", e))?;

    Ok(count as usize)
  }

  fn worker_phase(&self, version: &str) -> Result<Option<String>> {
    let conn = self.lock()?;

    conn
      .query_row(
        "SELECT phase FROM worker_state WHERE version = ?",
        params![version],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read worker phase: {}", e))
  }

  fn set_worker_phase(&self, version: &str, phase: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO worker_state (version, phase, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![version, phase],
      )
      .map_err(|e| eyre!("Failed to record worker phase: {}", e))?;

    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn storage() -> SqliteStorage {
    SqliteStorage::open_in_memory().unwrap()
  }

  #[test]
  fn test_open_is_idempotent() {
    let store = storage();
    store.open("a-v1").unwrap();
    store.open("a-v1").unwrap();
    assert_eq!(store.list_names().unwrap().len(), 1);
  }

  #[test]
  fn test_missing_key_is_not_an_error() {
    let store = storage();
    store.open("a-v1").unwrap();
    assert!(store.get("a-v1", "GET https://x/").unwrap().is_none());
    assert_eq!(store.entry_count("missing").unwrap(), 0);
  }

  #[test]
  fn test_put_overwrites_whole_entry() {
    let store = storage();
    let key = "GET https://app.example/a.json";
    store
      .put("a-v1", key, &Response::new(200, "first").with_header("etag", "1"))
      .unwrap();
    store.put("a-v1", key, &Response::new(200, "second")).unwrap();

    let entry = store.get("a-v1", key).unwrap().unwrap();
    assert_eq!(entry.response.body, b"second");
    assert!(entry.response.headers.is_empty());
    assert_eq!(store.entry_count("a-v1").unwrap(), 1);
  }

  #[test]
  fn test_put_creates_partition() {
    let store = storage();
    store.put("rt-v1", "GET https://x/", &Response::new(200, "x")).unwrap();
    assert!(store.list_names().unwrap().contains("rt-v1"));
  }

  #[test]
  fn test_delete_removes_entries() {
    let store = storage();
    store.put("old-v1", "GET https://x/", &Response::new(200, "x")).unwrap();

    assert!(store.delete("old-v1").unwrap());
    assert!(!store.delete("old-v1").unwrap());
    assert!(store.list_names().unwrap().is_empty());
    assert_eq!(store.entry_count("old-v1").unwrap(), 0);

    // Recreating the name starts empty
    store.open("old-v1").unwrap();
    assert!(store.get("old-v1", "GET https://x/").unwrap().is_none());
  }

  #[test]
  fn test_put_all_writes_every_entry() {
    let store = storage();
    let entries = vec![
      ("GET https://x/a".to_string(), Response::new(200, "a")),
      ("GET https://x/b".to_string(), Response::new(200, "b")),
    ];
    store.put_all("pre-v1", &entries).unwrap();
    assert_eq!(store.entry_count("pre-v1").unwrap(), 2);
  }

  #[test]
  fn test_tampered_body_reads_as_miss() {
    let store = storage();
    let key = "GET https://x/a";
    store.put("p", key, &Response::new(200, "good")).unwrap();
    {
      let conn = store.lock().unwrap();
      conn
        .execute("UPDATE entries SET body = ? WHERE request_key = ?", params![b"evil".to_vec(), key])
        .unwrap();
    }
    assert!(store.get("p", key).unwrap().is_none());
  }

  #[test]
  fn test_entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    {
      let store = SqliteStorage::open(&path).unwrap();
      store.put("rt-v1", "GET https://x/a", &Response::new(200, "kept")).unwrap();
    }

    let store = SqliteStorage::open(&path).unwrap();
    let entry = store.get("rt-v1", "GET https://x/a").unwrap().unwrap();
    assert_eq!(entry.response.body, b"kept");
  }

  #[test]
  fn test_worker_phase_is_per_version() {
    let store = storage();
    assert_eq!(store.worker_phase("1").unwrap(), None);

    store.set_worker_phase("1", "installed").unwrap();
    store.set_worker_phase("1", "activated").unwrap();
    store.set_worker_phase("2", "installed").unwrap();

    assert_eq!(store.worker_phase("1").unwrap().as_deref(), Some("activated"));
    assert_eq!(store.worker_phase("2").unwrap().as_deref(), Some("installed"));

    // Partition cleanup leaves the phase alone
    store.put("shell-cache-v1", "GET https://x/", &Response::new(200, "x")).unwrap();
    store.delete("shell-cache-v1").unwrap();
    assert_eq!(store.worker_phase("1").unwrap().as_deref(), Some("activated"));
  }

  #[test]
  fn test_two_handles_write_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let first = SqliteStorage::open(&path).unwrap();
    let second = SqliteStorage::open(&path).unwrap();

    let key = "GET https://app.example/data.json";
    let writer = move |store: SqliteStorage, name: &'static str| {
      std::thread::spawn(move || {
        for i in 0..50 {
          let body = format!("{}-{}|", name, i).repeat(2000);
          let response = Response::new(200, body).with_header("x-writer", name);
          if i % 2 == 0 {
            store.put("shared-v1", key, &response).unwrap();
          } else {
            let batch = vec![
              (key.to_string(), response.clone()),
              (format!("GET https://app.example/{}/{}", name, i), response),
            ];
            store.put_all("shared-v1", &batch).unwrap();
          }

          let scratch = format!("{}-scratch", name);
          store.put(&scratch, key, &Response::new(200, "tmp")).unwrap();
          assert!(store.delete(&scratch).unwrap());

          let entry = store.get("shared-v1", key).unwrap().unwrap();
          let body = String::from_utf8(entry.response.body).unwrap();
          let author = entry.response.headers[0].1.clone();
          let chunk = body.split('|').next().unwrap().to_string();
          assert!(chunk.starts_with(&author));
          assert_eq!(body, format!("{}|", chunk).repeat(2000));
        }
      })
    };

    let a = writer(first, "a");
    let b = writer(second, "b");
    a.join().unwrap();
    b.join().unwrap();

    let store = SqliteStorage::open(&path).unwrap();
    assert_eq!(store.entry_count("shared-v1").unwrap(), 51);
    assert_eq!(store.list_names().unwrap().len(), 1);
  }
}
