//! Persistence medium for the queue and the resource cache.
//!
//! Both components talk to storage only through [`StateStorage`] and
//! [`CacheStorage`]. [`Database`] is the durable SQLite implementation;
//! [`MemoryStorage`] backs a session when the database cannot be opened.

mod memory;
pub mod schema;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::cache::{CacheEntry, CacheKey};
use crate::error::PersistenceError;
use crate::transport::Response;

pub use memory::MemoryStorage;

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Key/value documents that must survive restarts.
pub trait StateStorage: Send + Sync {
  /// Read a stored document, `None` if the key was never written.
  fn read_state(&self, key: &str) -> Result<Option<Vec<u8>>>;

  /// Replace a stored document in one atomic write.
  fn write_state(&self, key: &str, value: &[u8]) -> Result<()>;
}

/// Cached responses bucketed by generation.
pub trait CacheStorage: Send + Sync {
  fn get_entry(&self, generation: &str, key: &CacheKey) -> Result<Option<CacheEntry>>;

  /// Store one entry, replacing any previous entry for the same key wholesale.
  fn put_entry(&self, generation: &str, entry: &CacheEntry) -> Result<()>;

  /// Store a batch of entries atomically: either all land or none do.
  fn put_entries(&self, generation: &str, entries: &[CacheEntry]) -> Result<()>;

  fn delete_entry(&self, generation: &str, key: &CacheKey) -> Result<bool>;

  /// All generations that currently hold at least one entry.
  fn generations(&self) -> Result<Vec<String>>;

  /// Drop every entry of a generation, returning how many were removed.
  fn delete_generation(&self, generation: &str) -> Result<usize>;

  fn entry_count(&self, generation: &str) -> Result<usize>;
}

/// SQLite-backed storage.
pub struct Database {
  conn: Mutex<Connection>,
  path: Option<PathBuf>,
}

impl Database {
  /// Open or create the database at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        PersistenceError::Unavailable(format!(
          "failed to create directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      PersistenceError::Unavailable(format!(
        "failed to open database at {}: {}",
        path.display(),
        e
      ))
    })?;

    let db = Self {
      conn: Mutex::new(conn),
      path: Some(path.to_path_buf()),
    };
    db.run_migrations()?;

    Ok(db)
  }

  /// Open a private in-memory database. Nothing survives the process.
  pub fn open_in_memory() -> Result<Self> {
    let db = Self {
      conn: Mutex::new(Connection::open_in_memory()?),
      path: None,
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| PersistenceError::Unavailable("could not determine data directory".into()))?;

    Ok(data_dir.join("readersync").join("state.db"))
  }

  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn.lock()?;
    conn.execute_batch(schema::SCHEMA)?;
    Ok(())
  }
}

impl StateStorage for Database {
  fn read_state(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let conn = self.conn.lock()?;
    let value = conn
      .query_row(
        "SELECT value FROM sync_state WHERE state_key = ?",
        params![key],
        |row| row.get::<_, Vec<u8>>(0),
      )
      .optional()?;
    Ok(value)
  }

  fn write_state(&self, key: &str, value: &[u8]) -> Result<()> {
    let conn = self.conn.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO sync_state (state_key, value, updated_at)
       VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;
    Ok(())
  }
}

impl CacheStorage for Database {
  fn get_entry(&self, generation: &str, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let conn = self.conn.lock()?;
    let row = conn
      .query_row(
        "SELECT method, target, status, content_type, body, stored_at FROM cache_entries
         WHERE generation = ? AND key_hash = ?",
        params![generation, key.hash()],
        |row| {
          Ok(StoredRow {
            method: row.get(0)?,
            target: row.get(1)?,
            status: row.get(2)?,
            content_type: row.get(3)?,
            body: row.get(4)?,
            stored_at: row.get(5)?,
          })
        },
      )
      .optional()?;

    row.map(StoredRow::into_entry).transpose()
  }

  fn put_entry(&self, generation: &str, entry: &CacheEntry) -> Result<()> {
    let conn = self.conn.lock()?;
    insert_entry(&conn, generation, entry)?;
    Ok(())
  }

  fn put_entries(&self, generation: &str, entries: &[CacheEntry]) -> Result<()> {
    let mut conn = self.conn.lock()?;
    let tx = conn.transaction()?;
    for entry in entries {
      insert_entry(&tx, generation, entry)?;
    }
    tx.commit()?;
    Ok(())
  }

  fn delete_entry(&self, generation: &str, key: &CacheKey) -> Result<bool> {
    let conn = self.conn.lock()?;
    let removed = conn.execute(
      "DELETE FROM cache_entries WHERE generation = ? AND key_hash = ?",
      params![generation, key.hash()],
    )?;
    Ok(removed > 0)
  }

  fn generations(&self) -> Result<Vec<String>> {
    let conn = self.conn.lock()?;
    let mut stmt =
      conn.prepare("SELECT DISTINCT generation FROM cache_entries ORDER BY generation")?;
    let generations = stmt
      .query_map([], |row| row.get::<_, String>(0))?
      .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(generations)
  }

  fn delete_generation(&self, generation: &str) -> Result<usize> {
    let conn = self.conn.lock()?;
    let removed = conn.execute(
      "DELETE FROM cache_entries WHERE generation = ?",
      params![generation],
    )?;
    Ok(removed)
  }

  fn entry_count(&self, generation: &str) -> Result<usize> {
    let conn = self.conn.lock()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM cache_entries WHERE generation = ?",
      params![generation],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }
}

fn insert_entry(conn: &Connection, generation: &str, entry: &CacheEntry) -> Result<()> {
  conn.execute(
    "INSERT OR REPLACE INTO cache_entries
       (generation, key_hash, method, target, status, content_type, body, stored_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    params![
      generation,
      entry.key.hash(),
      entry.key.method(),
      entry.key.target(),
      entry.response.status,
      entry.response.content_type,
      entry.response.body,
      entry.stored_at.to_rfc3339(),
    ],
  )?;
  Ok(())
}

/// Raw column values of one `cache_entries` row.
struct StoredRow {
  method: String,
  target: String,
  status: u16,
  content_type: Option<String>,
  body: Vec<u8>,
  stored_at: String,
}

impl StoredRow {
  fn into_entry(self) -> Result<CacheEntry> {
    let corrupt = |reason: String| PersistenceError::Corrupt {
      key: format!("{} {}", self.method, self.target),
      reason,
    };

    let key = CacheKey::from_parts(&self.method, &self.target).map_err(|e| corrupt(e.to_string()))?;
    let stored_at = DateTime::parse_from_rfc3339(&self.stored_at)
      .map(|dt| dt.with_timezone(&Utc))
      .map_err(|e| corrupt(format!("bad timestamp '{}': {}", self.stored_at, e)))?;

    Ok(CacheEntry {
      key,
      response: Response {
        status: self.status,
        content_type: self.content_type,
        body: self.body,
      },
      stored_at,
    })
  }
}
