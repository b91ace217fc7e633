//! Durable key/value store trait and its backends.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::db;

/// Failure reported by a durable store backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
  /// The write would take the store past its byte quota.
  #[error("durable store quota exceeded")]
  QuotaExceeded,
  #[error("durable store unavailable: {0}")]
  Unavailable(String),
}

impl From<rusqlite::Error> for StorageError {
  fn from(e: rusqlite::Error) -> Self {
    StorageError::Unavailable(e.to_string())
  }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for durable key/value backends.
///
/// Sizes are in bytes and count both key and value, the way a browser-style
/// storage quota does.
pub trait DurableStore: Send + Sync {
  /// Read the raw value stored under `key`.
  fn read(&self, key: &str) -> StorageResult<Option<String>>;

  /// Store `value` under `key`, replacing any previous value.
  fn write(&self, key: &str, value: &str) -> StorageResult<()>;

  /// Remove `key`. Removing a missing key is not an error.
  fn remove(&self, key: &str) -> StorageResult<()>;

  /// List keys starting with `prefix`.
  fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>>;

  /// Bytes occupied by `key`, 0 if absent.
  fn size_of(&self, key: &str) -> StorageResult<u64>;
}

impl<T: DurableStore + ?Sized> DurableStore for Arc<T> {
  fn read(&self, key: &str) -> StorageResult<Option<String>> {
    (**self).read(key)
  }

  fn write(&self, key: &str, value: &str) -> StorageResult<()> {
    (**self).write(key, value)
  }

  fn remove(&self, key: &str) -> StorageResult<()> {
    (**self).remove(key)
  }

  fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
    (**self).list_keys(prefix)
  }

  fn size_of(&self, key: &str) -> StorageResult<u64> {
    (**self).size_of(key)
  }
}

fn entry_size(key: &str, value: &str) -> u64 {
  (key.len() + value.len()) as u64
}

fn lock<T>(mutex: &Mutex<T>) -> StorageResult<MutexGuard<'_, T>> {
  mutex
    .lock()
    .map_err(|e| StorageError::Unavailable(format!("Lock poisoned: {}", e)))
}

/// Storage implementation that doesn't persist anything.
/// Used when the durable tier is disabled.
pub struct NoopStorage;

impl DurableStore for NoopStorage {
  fn read(&self, _key: &str) -> StorageResult<Option<String>> {
    Ok(None) // Always miss
  }

  fn write(&self, _key: &str, _value: &str) -> StorageResult<()> {
    Ok(()) // Discard
  }

  fn remove(&self, _key: &str) -> StorageResult<()> {
    Ok(())
  }

  fn list_keys(&self, _prefix: &str) -> StorageResult<Vec<String>> {
    Ok(Vec::new())
  }

  fn size_of(&self, _key: &str) -> StorageResult<u64> {
    Ok(0)
  }
}

/// In-process store with an optional byte quota.
#[derive(Default)]
pub struct MemoryStorage {
  entries: Mutex<BTreeMap<String, String>>,
  quota_bytes: Option<u64>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_quota(quota_bytes: u64) -> Self {
    Self {
      entries: Mutex::new(BTreeMap::new()),
      quota_bytes: Some(quota_bytes),
    }
  }
}

impl DurableStore for MemoryStorage {
  fn read(&self, key: &str) -> StorageResult<Option<String>> {
    Ok(lock(&self.entries)?.get(key).cloned())
  }

  fn write(&self, key: &str, value: &str) -> StorageResult<()> {
    let mut entries = lock(&self.entries)?;

    if let Some(quota) = self.quota_bytes {
      let used: u64 = entries
        .iter()
        .filter(|(k, _)| k.as_str() != key)
        .map(|(k, v)| entry_size(k, v))
        .sum();
      if used + entry_size(key, value) > quota {
        return Err(StorageError::QuotaExceeded);
      }
    }

    entries.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> StorageResult<()> {
    lock(&self.entries)?.remove(key);
    Ok(())
  }

  fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
    Ok(
      lock(&self.entries)?
        .keys()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect(),
    )
  }

  fn size_of(&self, key: &str) -> StorageResult<u64> {
    Ok(
      lock(&self.entries)?
        .get(key)
        .map(|v| entry_size(key, v))
        .unwrap_or(0),
    )
  }
}

/// SQLite-based durable store, living in the `kv_store` table.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  quota_bytes: Option<u64>,
}

impl SqliteStorage {
  /// Open the store in the database at `path`.
  pub fn open(path: &Path) -> color_eyre::Result<Self> {
    let conn = db::open(path)?;
    Self::from_connection(conn)
  }

  /// Open a throwaway in-memory store.
  pub fn open_in_memory() -> color_eyre::Result<Self> {
    Self::from_connection(db::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> color_eyre::Result<Self> {
    db::migrate(&conn, db::schema::CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
      quota_bytes: None,
    })
  }

  /// Reject writes that would take the table past `quota_bytes`.
  pub fn with_quota(mut self, quota_bytes: u64) -> Self {
    self.quota_bytes = Some(quota_bytes);
    self
  }
}

impl DurableStore for SqliteStorage {
  fn read(&self, key: &str) -> StorageResult<Option<String>> {
    let conn = lock(&self.conn)?;
    let value = conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn write(&self, key: &str, value: &str) -> StorageResult<()> {
    let conn = lock(&self.conn)?;

    if let Some(quota) = self.quota_bytes {
      let used: i64 = conn.query_row(
        "SELECT COALESCE(SUM(length(CAST(key AS BLOB)) + length(CAST(value AS BLOB))), 0)
         FROM kv_store WHERE key != ?",
        params![key],
        |row| row.get(0),
      )?;
      if used as u64 + entry_size(key, value) > quota {
        return Err(StorageError::QuotaExceeded);
      }
    }

    conn.execute(
      "INSERT OR REPLACE INTO kv_store (key, value) VALUES (?, ?)",
      params![key, value],
    )?;
    Ok(())
  }

  fn remove(&self, key: &str) -> StorageResult<()> {
    let conn = lock(&self.conn)?;
    conn.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
    Ok(())
  }

  fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
    let conn = lock(&self.conn)?;
    let mut stmt = conn.prepare("SELECT key FROM kv_store ORDER BY key")?;
    let keys = stmt
      .query_map([], |row| row.get::<_, String>(0))?
      .filter_map(|r| r.ok())
      .filter(|k| k.starts_with(prefix))
      .collect();
    Ok(keys)
  }

  fn size_of(&self, key: &str) -> StorageResult<u64> {
    let conn = lock(&self.conn)?;
    let size: Option<i64> = conn
      .query_row(
        "SELECT length(CAST(key AS BLOB)) + length(CAST(value AS BLOB))
         FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(size.unwrap_or(0) as u64)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn exercise_store(store: &dyn DurableStore) {
    assert_eq!(store.read("a").unwrap(), None);
    store.write("p:a", "one").unwrap();
    store.write("p:b", "two").unwrap();
    store.write("other", "three").unwrap();

    assert_eq!(store.read("p:a").unwrap().as_deref(), Some("one"));
    assert_eq!(store.list_keys("p:").unwrap(), vec!["p:a", "p:b"]);
    assert_eq!(store.size_of("p:a").unwrap(), 6);
    assert_eq!(store.size_of("missing").unwrap(), 0);

    store.write("p:a", "uno").unwrap();
    assert_eq!(store.read("p:a").unwrap().as_deref(), Some("uno"));

    store.remove("p:a").unwrap();
    store.remove("p:a").unwrap();
    assert_eq!(store.read("p:a").unwrap(), None);
    assert_eq!(store.list_keys("").unwrap(), vec!["other", "p:b"]);
  }

  #[test]
  fn test_memory_storage_basics() {
    exercise_store(&MemoryStorage::new());
  }

  #[test]
  fn test_sqlite_storage_basics() {
    exercise_store(&SqliteStorage::open_in_memory().unwrap());
  }

  #[test]
  fn test_memory_storage_quota() {
    let store = MemoryStorage::with_quota(10);
    store.write("a", "1234").unwrap();
    assert!(matches!(
      store.write("b", "123456"),
      Err(StorageError::QuotaExceeded)
    ));
    // Replacing a key only counts its new size
    store.write("a", "123456789").unwrap();
  }

  #[test]
  fn test_sqlite_storage_quota() {
    let store = SqliteStorage::open_in_memory().unwrap().with_quota(10);
    store.write("a", "1234").unwrap();
    assert!(matches!(
      store.write("b", "123456"),
      Err(StorageError::QuotaExceeded)
    ));
    store.write("a", "123456789").unwrap();
  }

  #[test]
  fn test_noop_storage_discards() {
    let store = NoopStorage;
    store.write("a", "b").unwrap();
    assert_eq!(store.read("a").unwrap(), None);
    assert!(store.list_keys("").unwrap().is_empty());
  }
}
