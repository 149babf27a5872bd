//! Persistent string store trait and its implementations.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::db::Database;

/// A flat string-to-string store shared by unrelated callers.
///
/// Single-key `set`/`remove` are atomic; nothing else is promised.
pub trait KeyValueStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>>;

  fn set(&self, key: &str, value: &str) -> Result<()>;

  /// Remove a key. Missing keys are not an error.
  fn remove(&self, key: &str) -> Result<()>;

  /// All keys currently in the store.
  fn keys(&self) -> Result<Vec<String>>;
}

/// SQLite-backed string store.
#[derive(Clone)]
pub struct SqliteKvStore {
  db: Database,
}

impl SqliteKvStore {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

impl KeyValueStore for SqliteKvStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = self.db.conn()?;
    conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read key {}: {}", key, e))
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write key {}: {}", key, e))?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to remove key {}: {}", key, e))?;
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT key FROM kv_store ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare key listing: {}", e))?;

    let keys = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;

    Ok(keys)
  }
}

/// In-memory string store with an optional size quota.
///
/// The quota counts key and value bytes; a write that would exceed it fails
/// the way a full browser storage area does.
#[derive(Default)]
pub struct MemoryKvStore {
  entries: Mutex<BTreeMap<String, String>>,
  quota_bytes: Option<usize>,
}

impl MemoryKvStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_quota(quota_bytes: usize) -> Self {
    Self {
      entries: Mutex::new(BTreeMap::new()),
      quota_bytes: Some(quota_bytes),
    }
  }

  fn entries(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
    self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl KeyValueStore for MemoryKvStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    Ok(self.entries()?.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let mut entries = self.entries()?;

    if let Some(quota) = self.quota_bytes {
      let used: usize = entries
        .iter()
        .filter(|(k, _)| k.as_str() != key)
        .map(|(k, v)| k.len() + v.len())
        .sum();
      if used + key.len() + value.len() > quota {
        return Err(eyre!("Quota exceeded writing key {}", key));
      }
    }

    entries.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    self.entries()?.remove(key);
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    Ok(self.entries()?.keys().cloned().collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn exercise(store: &dyn KeyValueStore) {
    assert_eq!(store.get("a").unwrap(), None);
    store.set("a", "1").unwrap();
    store.set("b", "2").unwrap();
    store.set("a", "3").unwrap();
    assert_eq!(store.get("a").unwrap().as_deref(), Some("3"));
    assert_eq!(store.keys().unwrap(), vec!["a", "b"]);
    store.remove("a").unwrap();
    store.remove("a").unwrap();
    assert_eq!(store.get("a").unwrap(), None);
    assert_eq!(store.keys().unwrap(), vec!["b"]);
  }

  #[test]
  fn test_sqlite_store_basics() {
    let store = SqliteKvStore::new(Database::open_in_memory().unwrap());
    exercise(&store);
  }

  #[test]
  fn test_memory_store_basics() {
    exercise(&MemoryKvStore::new());
  }

  #[test]
  fn test_memory_store_quota() {
    let store = MemoryKvStore::with_quota(10);
    store.set("k", "12345").unwrap();
    assert!(store.set("j", "123456789").is_err());
    // Overwriting an existing key only counts the new value
    store.set("k", "123456789").unwrap();
    assert_eq!(store.get("j").unwrap(), None);
  }
}
