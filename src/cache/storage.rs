//! Key/value storage trait and its SQLite and in-memory implementations.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Durable storage of opaque string-keyed blobs. No business logic lives here.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
  /// Get the blob stored under `key`.
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

  /// Store a blob, replacing any previous value in a single write.
  async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

  /// Remove a key. Removing a missing key is not an error.
  async fn remove(&self, key: &str) -> Result<()>;

  /// Remove a key only if it still holds `expected`, in one atomic step.
  /// Returns whether the key was removed.
  async fn remove_if_unchanged(&self, key: &str, expected: &[u8]) -> Result<bool>;

  /// List every key starting with `prefix`, in key order.
  async fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Storage kept in process memory. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
  entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn entries(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
    self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

#[async_trait]
impl KeyValueStore for MemoryStorage {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    Ok(self.entries()?.get(key).cloned())
  }

  async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
    self.entries()?.insert(key.to_string(), value);
    Ok(())
  }

  async fn remove(&self, key: &str) -> Result<()> {
    self.entries()?.remove(key);
    Ok(())
  }

  async fn remove_if_unchanged(&self, key: &str, expected: &[u8]) -> Result<bool> {
    let mut entries = self.entries()?;
    if entries.get(key).map(Vec::as_slice) == Some(expected) {
      entries.remove(key);
      return Ok(true);
    }
    Ok(false)
  }

  async fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
    Ok(
      self
        .entries()?
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, _)| k.clone())
        .collect(),
    )
  }
}

/// SQLite-based storage implementation.
///
/// Statements run on the blocking pool so a slow disk never stalls the
/// async workers.
pub struct SqliteStorage {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Create a new SQLite storage at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("recache").join("cache.db"))
  }

  /// Run `f` against the connection on the blocking pool.
  async fn with_conn<R, F>(&self, f: F) -> Result<R>
  where
    F: FnOnce(&Connection) -> Result<R> + Send + 'static,
    R: Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      f(&conn)
    })
    .await
    .map_err(|e| eyre!("Storage task failed: {}", e))?
  }
}

/// Schema for the cache table.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_cache (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

#[async_trait]
impl KeyValueStore for SqliteStorage {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let key = key.to_string();
    self
      .with_conn(move |conn| {
        conn
          .query_row(
            "SELECT value FROM kv_cache WHERE key = ?",
            params![key],
            |row| row.get(0),
          )
          .optional()
          .map_err(|e| eyre!("Failed to read cache key {}: {}", key, e))
      })
      .await
  }

  async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
    let key = key.to_string();
    self
      .with_conn(move |conn| {
        conn
          .execute(
            "INSERT OR REPLACE INTO kv_cache (key, value, written_at)
             VALUES (?, ?, datetime('now'))",
            params![key, value],
          )
          .map_err(|e| eyre!("Failed to write cache key {}: {}", key, e))?;
        Ok(())
      })
      .await
  }

  async fn remove(&self, key: &str) -> Result<()> {
    let key = key.to_string();
    self
      .with_conn(move |conn| {
        conn
          .execute("DELETE FROM kv_cache WHERE key = ?", params![key])
          .map_err(|e| eyre!("Failed to remove cache key {}: {}", key, e))?;
        Ok(())
      })
      .await
  }

  async fn remove_if_unchanged(&self, key: &str, expected: &[u8]) -> Result<bool> {
    let key = key.to_string();
    let expected = expected.to_vec();
    self
      .with_conn(move |conn| {
        let removed = conn
          .execute(
            "DELETE FROM kv_cache WHERE key = ? AND value = ?",
            params![key, expected],
          )
          .map_err(|e| eyre!("Failed to remove cache key {}: {}", key, e))?;
        Ok(removed > 0)
      })
      .await
  }

  async fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
    let prefix = prefix.to_string();
    self
      .with_conn(move |conn| {
        let mut stmt = conn
          .prepare("SELECT key FROM kv_cache WHERE substr(key, 1, ?2) = ?1 ORDER BY key")
          .map_err(|e| eyre!("Failed to prepare key listing: {}", e))?;

        let len = prefix.chars().count() as i64;
        let keys = stmt
          .query_map(params![prefix, len], |row| row.get::<_, String>(0))
          .map_err(|e| eyre!("Failed to list cache keys: {}", e))?
          .collect::<rusqlite::Result<Vec<_>>>()
          .map_err(|e| eyre!("Failed to read cache key: {}", e))?;

        Ok(keys)
      })
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn exercise(store: &dyn KeyValueStore) {
    assert_eq!(store.get("c/partners").await.unwrap(), None);

    store.set("c/partners", b"one".to_vec()).await.unwrap();
    store.set("c/partners", b"two".to_vec()).await.unwrap();
    assert_eq!(store.get("c/partners").await.unwrap(), Some(b"two".to_vec()));

    store.set("c/partners/r/1", b"r1".to_vec()).await.unwrap();
    store.set("c/partners_archive", b"x".to_vec()).await.unwrap();
    store.set("c/tickets", b"t".to_vec()).await.unwrap();

    let keys = store.list_keys_with_prefix("c/partners/").await.unwrap();
    assert_eq!(keys, vec!["c/partners/r/1".to_string()]);

    let keys = store.list_keys_with_prefix("c/").await.unwrap();
    assert_eq!(keys.len(), 4);

    assert!(!store.remove_if_unchanged("c/tickets", b"other").await.unwrap());
    assert!(store.remove_if_unchanged("c/tickets", b"t").await.unwrap());
    assert_eq!(store.get("c/tickets").await.unwrap(), None);

    store.remove("c/partners").await.unwrap();
    store.remove("c/missing").await.unwrap();
    assert_eq!(store.get("c/partners").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_memory_storage() {
    exercise(&MemoryStorage::new()).await;
  }

  #[tokio::test]
  async fn test_sqlite_storage_in_memory() {
    exercise(&SqliteStorage::open_in_memory().unwrap()).await;
  }

  #[tokio::test]
  async fn test_sqlite_storage_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let store = SqliteStorage::open_at(&path).unwrap();
      store.set("c/partners", b"persisted".to_vec()).await.unwrap();
    }

    let store = SqliteStorage::open_at(&path).unwrap();
    assert_eq!(
      store.get("c/partners").await.unwrap(),
      Some(b"persisted".to_vec())
    );
  }

  #[tokio::test]
  async fn test_sqlite_prefix_is_literal() {
    let store = SqliteStorage::open_in_memory().unwrap();
    store.set("c/a_b", b"1".to_vec()).await.unwrap();
    store.set("c/axb", b"2".to_vec()).await.unwrap();

    let keys = store.list_keys_with_prefix("c/a_").await.unwrap();
    assert_eq!(keys, vec!["c/a_b".to_string()]);
  }
}
