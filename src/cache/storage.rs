//! Persistence hook for cache entries and its SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

use super::entry::{CacheEntry, QueryStatus};
use super::key::QueryKey;

/// A cache entry as written to and read from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedEntry {
  pub key: QueryKey,
  pub entry: CacheEntry,
}

/// Trait for cache storage backends.
///
/// Entries are grouped under an application-chosen key so several clients can
/// share one database.
pub trait CacheStorage: Send + Sync {
  /// Load every entry stored under `app_key`.
  fn load(&self, app_key: &str) -> Result<Vec<PersistedEntry>>;

  /// Replace the stored set for `app_key` with `entries`.
  fn save(&self, app_key: &str, entries: &[PersistedEntry]) -> Result<()>;

  /// Forget everything stored under `app_key`.
  fn clear(&self, app_key: &str) -> Result<()>;
}

impl<S: CacheStorage + ?Sized> CacheStorage for Box<S> {
  fn load(&self, app_key: &str) -> Result<Vec<PersistedEntry>> {
    (**self).load(app_key)
  }

  fn save(&self, app_key: &str, entries: &[PersistedEntry]) -> Result<()> {
    (**self).save(app_key, entries)
  }

  fn clear(&self, app_key: &str) -> Result<()> {
    (**self).clear(app_key)
  }
}

/// Storage implementation that doesn't persist anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn load(&self, _app_key: &str) -> Result<Vec<PersistedEntry>> {
    Ok(Vec::new()) // Always empty
  }

  fn save(&self, _app_key: &str, _entries: &[PersistedEntry]) -> Result<()> {
    Ok(()) // Discard
  }

  fn clear(&self, _app_key: &str) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`.
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

  /// Database that lives only as long as this value.
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
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

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Persisted query results (value stored as serialized JSON)
CREATE TABLE IF NOT EXISTS query_cache (
    app_key TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    query_key TEXT NOT NULL,
    data BLOB NOT NULL,
    status TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    persisted_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (app_key, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_query_cache_app ON query_cache(app_key);
"#;

impl CacheStorage for SqliteStorage {
  fn load(&self, app_key: &str) -> Result<Vec<PersistedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT query_key, data, status, updated_at FROM query_cache
         WHERE app_key = ?
         ORDER BY query_key",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, Vec<u8>, String, String)> = stmt
      .query_map(params![app_key], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .map_err(|e| eyre!("Failed to query cache entries: {}", e))?
      .collect::<std::result::Result<_, _>>()
      .map_err(|e| eyre!("Failed to read cache row: {}", e))?;

    rows
      .into_iter()
      .map(|(query_key, data, status, updated_at)| {
        let key: QueryKey = serde_json::from_str(&query_key)
          .map_err(|e| eyre!("Failed to parse stored key {}: {}", query_key, e))?;
        let value = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize entry {}: {}", query_key, e))?;
        let status: QueryStatus = status.parse().map_err(|e: String| eyre!(e))?;
        Ok(PersistedEntry {
          key,
          entry: CacheEntry {
            value,
            status,
            updated_at: parse_datetime(&updated_at)?,
            stale: false,
            error: None,
          },
        })
      })
      .collect()
  }

  fn save(&self, app_key: &str, entries: &[PersistedEntry]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM query_cache WHERE app_key = ?", params![app_key])
      .map_err(|e| eyre!("Failed to delete old cache entries: {}", e))?;

    for persisted in entries {
      let query_key = serde_json::to_string(&persisted.key)
        .map_err(|e| eyre!("Failed to serialize key: {}", e))?;
      let data = serde_json::to_vec(&persisted.entry.value)
        .map_err(|e| eyre!("Failed to serialize entry: {}", e))?;

      tx.execute(
        "INSERT OR REPLACE INTO query_cache (app_key, key_hash, query_key, data, status, updated_at, persisted_at)
         VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          app_key,
          persisted.key.storage_hash(),
          query_key,
          data,
          persisted.entry.status.as_str(),
          persisted.entry.updated_at.to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn clear(&self, app_key: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM query_cache WHERE app_key = ?", params![app_key])
      .map_err(|e| eyre!("Failed to clear cache entries: {}", e))?;

    Ok(())
  }
}

/// Parse an RFC 3339 timestamp written by [`SqliteStorage::save`].
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
