//! Key/value storage trait and its SQLite and in-memory implementations.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use super::traits::now_millis;

/// Trait for durable key/value backends.
///
/// Values are serialized documents; the backend never interprets them.
pub trait KvStorage: Send + Sync {
  /// Read a single key.
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Write several keys atomically. Either all entries land or none do.
  fn set_many(&self, entries: &[(String, String)]) -> Result<()>;

  /// Delete a key. Deleting a missing key is not an error.
  fn remove(&self, key: &str) -> Result<()>;

  /// Drop every key.
  fn clear(&self) -> Result<()>;

  /// All keys currently stored, in lexical order.
  fn keys(&self) -> Result<Vec<String>>;

  /// Read-modify-write one key as a single atomic step, including against
  /// other handles open on the same store.
  ///
  /// `f` receives the current value and returns its replacement, or `None`
  /// to leave the key untouched. An error from `f` aborts without writing.
  fn update(
    &self,
    key: &str,
    f: &mut dyn FnMut(Option<String>) -> Result<Option<String>>,
  ) -> Result<()>;

  /// Write a single key.
  fn set(&self, key: &str, value: &str) -> Result<()> {
    self.set_many(&[(key.to_string(), value.to_string())])
  }
}

/// Storage kept entirely in process memory.
/// Used for ephemeral sessions and tests.
#[derive(Default)]
pub struct MemoryStorage {
  entries: Mutex<BTreeMap<String, String>>,
  #[cfg(test)]
  fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make every subsequent write fail, to exercise persistence error paths.
  #[cfg(test)]
  pub fn set_fail_writes(&self, fail: bool) {
    self
      .fail_writes
      .store(fail, std::sync::atomic::Ordering::SeqCst);
  }

  fn check_writable(&self) -> Result<()> {
    #[cfg(test)]
    if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
      return Err(eyre!("Storage is read-only"));
    }
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
    self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl KvStorage for MemoryStorage {
  fn get(&self, key: &str) -> Result<Option<String>> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn set_many(&self, entries: &[(String, String)]) -> Result<()> {
    self.check_writable()?;
    let mut map = self.lock()?;
    for (key, value) in entries {
      map.insert(key.clone(), value.clone());
    }
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    self.check_writable()?;
    self.lock()?.remove(key);
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    self.check_writable()?;
    self.lock()?.clear();
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.keys().cloned().collect())
  }

  fn update(
    &self,
    key: &str,
    f: &mut dyn FnMut(Option<String>) -> Result<Option<String>>,
  ) -> Result<()> {
    let mut map = self.lock()?;
    if let Some(next) = f(map.get(key).cloned())? {
      self.check_writable()?;
      map.insert(key.to_string(), next);
    }
    Ok(())
  }
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-based key/value storage.
///
/// Several handles (or processes) may open the same file; `update` takes the
/// database write lock up front so their read-modify-write cycles serialize.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the store at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    // Other processes may hold the write lock briefly; wait instead of failing
    conn
      .busy_timeout(BUSY_TIMEOUT)
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;
    // WAL keeps a crash mid-write from corrupting the last committed snapshot
    conn
      .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to enable WAL journal: {}", e))?;
    conn
      .pragma_update(None, "synchronous", "NORMAL")
      .map_err(|e| eyre!("Failed to set synchronous mode: {}", e))?;

    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Open a throwaway in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("splitsync").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for the cache table.
const CACHE_SCHEMA: &str = r#"
-- One row per addressable record: collections, their *_meta rows, sync_queue
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;

impl KvStorage for SqliteStorage {
  fn get(&self, key: &str) -> Result<Option<String>> {
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

  fn set_many(&self, entries: &[(String, String)]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let now = now_millis();

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (key, value) in entries {
      tx.execute(
        "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)",
        params![key, value, now],
      )
      .map_err(|e| eyre!("Failed to write key {}: {}", key, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete key {}: {}", key, e))?;

    Ok(())
  }

  fn clear(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM kv_store", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;

    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT key FROM kv_store ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;

    Ok(keys)
  }

  fn update(
    &self,
    key: &str,
    f: &mut dyn FnMut(Option<String>) -> Result<Option<String>>,
  ) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // IMMEDIATE takes the write lock before the read
    let tx = conn
      .transaction_with_behavior(TransactionBehavior::Immediate)
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let current: Option<String> = tx
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read key {}: {}", key, e))?;

    let Some(next) = f(current)? else {
      return Ok(());
    };

    tx.execute(
      "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)",
      params![key, next, now_millis()],
    )
    .map_err(|e| eyre!("Failed to write key {}: {}", key, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }
}
