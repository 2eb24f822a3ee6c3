//! Durable key/value storage behind the persistent cache.
//!
//! Backends implement [`KeyValueStore`] and report failures as errors. The
//! [`StorageAdapter`] in front of them swallows those errors (logging them),
//! so storage trouble can never break a read.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Namespace prepended to every key written through a [`StorageAdapter`].
pub const DEFAULT_PREFIX: &str = "glow-cache:";

const PROBE_KEY: &str = "__glowcache_probe__";

/// A synchronous byte store.
pub trait KeyValueStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

  fn set(&self, key: &str, value: &[u8]) -> Result<()>;

  fn remove(&self, key: &str) -> Result<()>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    (**self).get(key)
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<()> {
    (**self).set(key, value)
  }

  fn remove(&self, key: &str) -> Result<()> {
    (**self).remove(key)
  }
}

/// In-process store, optionally limited to a total number of value bytes.
///
/// Writes that would exceed the limit fail the way a full browser storage quota does.
#[derive(Default)]
pub struct MemoryStore {
  entries: Mutex<HashMap<String, Vec<u8>>>,
  capacity: Option<usize>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_capacity(bytes: usize) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      capacity: Some(bytes),
    }
  }
}

impl KeyValueStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(key).cloned())
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if let Some(capacity) = self.capacity {
      let used: usize = entries
        .iter()
        .filter(|(k, _)| k.as_str() != key)
        .map(|(_, v)| v.len())
        .sum();
      if used + value.len() > capacity {
        return Err(eyre!(
          "Storage quota exceeded: {} of {} bytes used, {} more requested",
          used,
          capacity,
          value.len()
        ));
      }
    }

    entries.insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.remove(key);
    Ok(())
  }
}

/// SQLite-backed store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

/// Schema for the key/value table.
const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SqliteStore {
  /// Open or create the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(KV_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }
}

impl KeyValueStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read key {}: {}", key, e))
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write key {}: {}", key, e))?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to remove key {}: {}", key, e))?;

    Ok(())
  }
}

/// Namespaced, failure-tolerant access to a [`KeyValueStore`].
///
/// Availability is probed once at construction. An unavailable adapter
/// behaves like an empty store that drops writes.
pub struct StorageAdapter {
  store: Option<Box<dyn KeyValueStore>>,
  prefix: String,
}

impl StorageAdapter {
  pub fn new(store: impl KeyValueStore + 'static) -> Self {
    Self::with_prefix(store, DEFAULT_PREFIX)
  }

  pub fn with_prefix(store: impl KeyValueStore + 'static, prefix: impl Into<String>) -> Self {
    let prefix = prefix.into();
    let store: Option<Box<dyn KeyValueStore>> = match Self::probe(&store) {
      Ok(()) => Some(Box::new(store)),
      Err(e) => {
        warn!(error = %e, "durable storage unavailable, caching in memory only");
        None
      }
    };
    Self { store, prefix }
  }

  /// An adapter with no backing store.
  pub fn unavailable() -> Self {
    Self {
      store: None,
      prefix: DEFAULT_PREFIX.to_string(),
    }
  }

  /// Open the SQLite store at `path`, degrading to [`StorageAdapter::unavailable`] on failure.
  pub fn open_sqlite(path: &Path, prefix: &str) -> Self {
    match SqliteStore::open(path) {
      Ok(store) => Self::with_prefix(store, prefix),
      Err(e) => {
        warn!(path = %path.display(), error = %e, "could not open cache database");
        Self {
          prefix: prefix.to_string(),
          ..Self::unavailable()
        }
      }
    }
  }

  fn probe(store: &impl KeyValueStore) -> Result<()> {
    store.set(PROBE_KEY, b"1")?;
    store.remove(PROBE_KEY)
  }

  pub fn is_available(&self) -> bool {
    self.store.is_some()
  }

  pub fn prefix(&self) -> &str {
    &self.prefix
  }

  fn namespaced(&self, key: &str) -> String {
    format!("{}{}", self.prefix, key)
  }

  pub fn get(&self, key: &str) -> Option<Vec<u8>> {
    let store = self.store.as_ref()?;
    match store.get(&self.namespaced(key)) {
      Ok(value) => value,
      Err(e) => {
        warn!(key, error = %e, "storage read failed");
        None
      }
    }
  }

  /// Returns whether the write landed.
  pub fn set(&self, key: &str, value: &[u8]) -> bool {
    let Some(store) = self.store.as_ref() else {
      return false;
    };
    match store.set(&self.namespaced(key), value) {
      Ok(()) => true,
      Err(e) => {
        warn!(key, error = %e, "storage write failed");
        false
      }
    }
  }

  pub fn remove(&self, key: &str) -> bool {
    let Some(store) = self.store.as_ref() else {
      return false;
    };
    match store.remove(&self.namespaced(key)) {
      Ok(()) => true,
      Err(e) => {
        warn!(key, error = %e, "storage remove failed");
        false
      }
    }
  }

  /// Read and decode a JSON value. Undecodable entries read as absent.
  pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let bytes = self.get(key)?;
    match serde_json::from_slice(&bytes) {
      Ok(value) => Some(value),
      Err(e) => {
        debug!(key, error = %e, "ignoring undecodable storage entry");
        None
      }
    }
  }

  /// Encode and write a JSON value.
  pub fn store<T: Serialize>(&self, key: &str, value: &T) -> bool {
    match serde_json::to_vec(value) {
      Ok(bytes) => self.set(key, &bytes),
      Err(e) => {
        warn!(key, error = %e, "failed to serialize storage entry");
        false
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;
  use tempfile::TempDir;

  #[derive(Debug, PartialEq, Serialize, Deserialize)]
  struct Service {
    name: String,
    minutes: u32,
  }

  #[test]
  fn test_keys_are_namespaced() {
    let raw = Arc::new(MemoryStore::new());
    let adapter = StorageAdapter::with_prefix(Arc::clone(&raw), "test:");
    assert!(adapter.set("services", b"[]"));
    assert_eq!(adapter.get("services"), Some(b"[]".to_vec()));

    // The underlying store only sees the prefixed key
    assert_eq!(raw.get("test:services").unwrap(), Some(b"[]".to_vec()));
    assert_eq!(raw.get("services").unwrap(), None);

    assert!(adapter.remove("services"));
    assert_eq!(raw.get("test:services").unwrap(), None);
  }

  #[test]
  fn test_in_memory_sqlite_adapter() {
    let store = SqliteStore::in_memory().expect("Should open in-memory database");
    let adapter = StorageAdapter::new(store);
    assert!(adapter.is_available());

    let service = Service {
      name: "Chemical peel".to_string(),
      minutes: 30,
    };
    assert!(adapter.store("service:2", &service));
    assert_eq!(adapter.load::<Service>("service:2"), Some(service));
    assert!(adapter.remove("service:2"));
    assert_eq!(adapter.get("service:2"), None);
  }

  #[test]
  fn test_json_roundtrip() {
    let adapter = StorageAdapter::new(MemoryStore::new());
    let service = Service {
      name: "Hydrafacial".to_string(),
      minutes: 45,
    };
    assert!(adapter.store("service:1", &service));
    assert_eq!(adapter.load::<Service>("service:1"), Some(service));
  }

  #[test]
  fn test_undecodable_entry_reads_as_absent() {
    let adapter = StorageAdapter::new(MemoryStore::new());
    adapter.set("service:1", b"{not json");
    assert_eq!(adapter.load::<Service>("service:1"), None);
  }

  #[test]
  fn test_zero_capacity_store_is_unavailable() {
    let adapter = StorageAdapter::new(MemoryStore::with_capacity(0));
    assert!(!adapter.is_available());
    assert!(!adapter.set("services", b"[]"));
    assert_eq!(adapter.get("services"), None);
    assert!(!adapter.remove("services"));
  }

  #[test]
  fn test_quota_exceeded_write_reports_failure() {
    let adapter = StorageAdapter::new(MemoryStore::with_capacity(8));
    assert!(adapter.is_available());
    assert!(adapter.set("small", b"1234"));
    assert!(!adapter.set("large", b"123456789"));
    assert_eq!(adapter.get("large"), None);
    // Overwriting an entry only counts its new size
    assert!(adapter.set("small", b"12345678"));
  }

  #[test]
  fn test_sqlite_store_roundtrip() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let path = temp_dir.path().join("nested").join("cache.db");
    let store = SqliteStore::open(&path).expect("Should open database");

    store.set("a", b"first").unwrap();
    store.set("a", b"second").unwrap();
    assert_eq!(store.get("a").unwrap(), Some(b"second".to_vec()));

    store.remove("a").unwrap();
    assert_eq!(store.get("a").unwrap(), None);
    assert!(path.exists());
  }

  #[test]
  fn test_sqlite_survives_reopen() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let path = temp_dir.path().join("cache.db");

    let adapter = StorageAdapter::open_sqlite(&path, DEFAULT_PREFIX);
    assert!(adapter.is_available());
    assert!(adapter.set("roles", b"[1,2]"));
    drop(adapter);

    let reopened = StorageAdapter::open_sqlite(&path, DEFAULT_PREFIX);
    assert_eq!(reopened.get("roles"), Some(b"[1,2]".to_vec()));
  }

  #[test]
  fn test_unopenable_database_degrades() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    // The parent "directory" is a regular file
    let blocker = temp_dir.path().join("blocker");
    std::fs::write(&blocker, b"").unwrap();
    let adapter = StorageAdapter::open_sqlite(&blocker.join("cache.db"), "x:");
    assert!(!adapter.is_available());
    assert_eq!(adapter.prefix(), "x:");
    assert!(!adapter.set("k", b"v"));
  }
}
