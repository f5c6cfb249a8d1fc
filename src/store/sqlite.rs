//! SQLite-backed [`Store`].

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use super::{ActionFailure, CacheEntry, NewCacheEntry, Store};
use crate::cache::{CacheMetadata, DataType, SyncStatus};
use crate::error::{StorageError, StorageResult};
use crate::queue::{ActionType, FailedAction, PendingAction};

/// Schema for the engine tables.
const SCHEMA: &str = r#"
-- Active queue. AUTOINCREMENT ids are never reused, so id order is insertion order.
CREATE TABLE IF NOT EXISTS pending_actions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action_type TEXT NOT NULL,
    payload BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL,
    last_error TEXT
);

-- Dead-letter records, keyed by the original action id
CREATE TABLE IF NOT EXISTS failed_actions (
    id INTEGER PRIMARY KEY,
    action_type TEXT NOT NULL,
    payload BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    retry_count INTEGER NOT NULL,
    max_retries INTEGER NOT NULL,
    last_error TEXT,
    failed_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    data BLOB NOT NULL,
    size INTEGER NOT NULL,
    data_type TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER,
    sync_status TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_expires
    ON cache_entries(expires_at);
"#;

const ACTION_COLUMNS: &str =
  "id, action_type, payload, created_at, retry_count, max_retries, last_error";

const METADATA_COLUMNS: &str =
  "id, key, size, data_type, created_at, expires_at, sync_status";

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite storage. File-backed stores run in WAL mode with a separate
/// read-only connection, so lookups read the last committed state without
/// waiting for writes. In-memory stores share one connection.
pub struct SqliteStore {
  writer: Mutex<Connection>,
  reader: Option<Mutex<Connection>>,
}

impl SqliteStore {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> StorageResult<Self> {
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }

    let writer = Connection::open(path)?;
    writer.busy_timeout(BUSY_TIMEOUT)?;
    let mode: String = writer.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    writer.execute_batch(SCHEMA)?;

    let reader = Connection::open_with_flags(
      path,
      OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    reader.busy_timeout(BUSY_TIMEOUT)?;
    debug!(path = %path.display(), journal_mode = %mode, "opened sync store");

    Ok(Self {
      writer: Mutex::new(writer),
      reader: Some(Mutex::new(reader)),
    })
  }

  /// Open the database at the default data directory location.
  pub fn open_default() -> StorageResult<Self> {
    let path = Self::default_path()
      .ok_or_else(|| StorageError::Corrupt("could not determine data directory".to_string()))?;
    Self::open(&path)
  }

  /// Volatile store, used for tests and cache-only sessions.
  pub fn open_in_memory() -> StorageResult<Self> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(SCHEMA)?;
    Ok(Self {
      writer: Mutex::new(conn),
      reader: None,
    })
  }

  /// Default database path under the user's data directory.
  pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .map(|dir| dir.join("offline-sync").join("engine.db"))
  }

  fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
    self.writer.lock().map_err(|_| StorageError::LockPoisoned)
  }

  /// Connection for lookups that never write.
  fn read(&self) -> StorageResult<MutexGuard<'_, Connection>> {
    match &self.reader {
      Some(reader) => reader.lock().map_err(|_| StorageError::LockPoisoned),
      None => self.lock(),
    }
  }
}

impl Store for SqliteStore {
  fn insert_action(
    &self,
    action_type: ActionType,
    payload: &[u8],
    max_retries: u32,
    created_at: DateTime<Utc>,
  ) -> StorageResult<PendingAction> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT INTO pending_actions (action_type, payload, created_at, retry_count, max_retries)
       VALUES (?1, ?2, ?3, 0, ?4)",
      params![
        action_type.as_str(),
        payload,
        created_at.timestamp_millis(),
        max_retries
      ],
    )?;

    Ok(PendingAction {
      id: conn.last_insert_rowid(),
      action_type,
      payload: payload.to_vec(),
      timestamp: created_at,
      retry_count: 0,
      max_retries,
      last_error: None,
    })
  }

  fn first_action(&self) -> StorageResult<Option<PendingAction>> {
    let conn = self.read()?;
    let action = conn
      .query_row(
        &format!("SELECT {ACTION_COLUMNS} FROM pending_actions ORDER BY id LIMIT 1"),
        [],
        action_from_row,
      )
      .optional()?;
    Ok(action)
  }

  fn list_actions(&self) -> StorageResult<Vec<PendingAction>> {
    let conn = self.read()?;
    let mut stmt = conn.prepare(&format!(
      "SELECT {ACTION_COLUMNS} FROM pending_actions ORDER BY id"
    ))?;
    let actions = stmt
      .query_map([], action_from_row)?
      .collect::<Result<Vec<_>, _>>()?;
    Ok(actions)
  }

  fn count_actions(&self) -> StorageResult<usize> {
    let conn = self.read()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM pending_actions", [], |row| {
      row.get(0)
    })?;
    Ok(count as usize)
  }

  fn remove_action(&self, id: i64) -> StorageResult<bool> {
    let conn = self.lock()?;
    let removed = conn.execute("DELETE FROM pending_actions WHERE id = ?1", params![id])?;
    Ok(removed > 0)
  }

  fn fail_action(
    &self,
    id: i64,
    error: &str,
    now: DateTime<Utc>,
  ) -> StorageResult<Option<ActionFailure>> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let updated = tx.execute(
      "UPDATE pending_actions SET retry_count = retry_count + 1, last_error = ?2 WHERE id = ?1",
      params![id, error],
    )?;
    if updated == 0 {
      return Ok(None);
    }

    let action = tx.query_row(
      &format!("SELECT {ACTION_COLUMNS} FROM pending_actions WHERE id = ?1"),
      params![id],
      action_from_row,
    )?;

    if action.retry_count < action.max_retries {
      tx.commit()?;
      return Ok(Some(ActionFailure::Retrying(action)));
    }

    tx.execute(
      "INSERT OR REPLACE INTO failed_actions
         (id, action_type, payload, created_at, retry_count, max_retries, last_error, failed_at)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
      params![
        action.id,
        action.action_type.as_str(),
        action.payload,
        action.timestamp.timestamp_millis(),
        action.retry_count,
        action.max_retries,
        action.last_error,
        now.timestamp_millis()
      ],
    )?;
    tx.execute("DELETE FROM pending_actions WHERE id = ?1", params![id])?;
    tx.commit()?;

    Ok(Some(ActionFailure::Exhausted(FailedAction {
      action,
      failed_at: now,
    })))
  }

  fn list_failed(&self) -> StorageResult<Vec<FailedAction>> {
    let conn = self.read()?;
    let mut stmt = conn.prepare(&format!(
      "SELECT {ACTION_COLUMNS}, failed_at FROM failed_actions ORDER BY failed_at, id"
    ))?;
    let failed = stmt
      .query_map([], failed_from_row)?
      .collect::<Result<Vec<_>, _>>()?;
    Ok(failed)
  }

  fn count_failed(&self) -> StorageResult<usize> {
    let conn = self.read()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM failed_actions", [], |row| row.get(0))?;
    Ok(count as usize)
  }

  fn remove_failed(&self, id: i64) -> StorageResult<Option<FailedAction>> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    let failed = tx
      .query_row(
        &format!("SELECT {ACTION_COLUMNS}, failed_at FROM failed_actions WHERE id = ?1"),
        params![id],
        failed_from_row,
      )
      .optional()?;
    if failed.is_some() {
      tx.execute("DELETE FROM failed_actions WHERE id = ?1", params![id])?;
      tx.commit()?;
    }
    Ok(failed)
  }

  fn requeue_failed(&self, id: i64, now: DateTime<Utc>) -> StorageResult<Option<PendingAction>> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    let failed = tx
      .query_row(
        &format!("SELECT {ACTION_COLUMNS}, failed_at FROM failed_actions WHERE id = ?1"),
        params![id],
        failed_from_row,
      )
      .optional()?;
    let Some(failed) = failed else {
      return Ok(None);
    };

    let old = failed.action;
    tx.execute(
      "INSERT INTO pending_actions (action_type, payload, created_at, retry_count, max_retries)
       VALUES (?1, ?2, ?3, 0, ?4)",
      params![
        old.action_type.as_str(),
        old.payload,
        now.timestamp_millis(),
        old.max_retries
      ],
    )?;
    let new_id = tx.last_insert_rowid();
    tx.execute("DELETE FROM failed_actions WHERE id = ?1", params![id])?;
    tx.commit()?;

    Ok(Some(PendingAction {
      id: new_id,
      action_type: old.action_type,
      payload: old.payload,
      timestamp: now,
      retry_count: 0,
      max_retries: old.max_retries,
      last_error: None,
    }))
  }

  fn put_entry(&self, entry: &NewCacheEntry) -> StorageResult<CacheMetadata> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO cache_entries
         (key, data, size, data_type, created_at, expires_at, sync_status)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
      params![
        entry.key,
        entry.data,
        entry.data.len() as i64,
        entry.data_type.as_str(),
        entry.created_at.timestamp_millis(),
        entry.expires_at.map(|t| t.timestamp_millis()),
        entry.sync_status.as_str()
      ],
    )?;

    Ok(CacheMetadata {
      id: conn.last_insert_rowid(),
      key: entry.key.clone(),
      size: entry.data.len(),
      created_at: entry.created_at,
      expires_at: entry.expires_at,
      data_type: entry.data_type,
      sync_status: entry.sync_status,
    })
  }

  fn get_entry(&self, key: &str) -> StorageResult<Option<CacheEntry>> {
    let conn = self.read()?;
    let entry = conn
      .query_row(
        &format!("SELECT {METADATA_COLUMNS}, data FROM cache_entries WHERE key = ?1"),
        params![key],
        |row| {
          Ok(CacheEntry {
            metadata: metadata_from_row(row)?,
            data: row.get(7)?,
          })
        },
      )
      .optional()?;
    Ok(entry)
  }

  fn remove_entry(&self, key: &str) -> StorageResult<bool> {
    let conn = self.lock()?;
    let removed = conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
    Ok(removed > 0)
  }

  fn remove_entry_if_expired(&self, key: &str, now: DateTime<Utc>) -> StorageResult<bool> {
    let conn = self.lock()?;
    let removed = conn.execute(
      "DELETE FROM cache_entries
       WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at < ?2",
      params![key, now.timestamp_millis()],
    )?;
    Ok(removed > 0)
  }

  fn remove_expired(&self, now: DateTime<Utc>) -> StorageResult<usize> {
    let conn = self.lock()?;
    let removed = conn.execute(
      "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at < ?1",
      params![now.timestamp_millis()],
    )?;
    Ok(removed)
  }

  fn clear_entries(&self) -> StorageResult<usize> {
    let conn = self.lock()?;
    Ok(conn.execute("DELETE FROM cache_entries", [])?)
  }

  fn list_entries(&self) -> StorageResult<Vec<CacheMetadata>> {
    let conn = self.read()?;
    let mut stmt = conn.prepare(&format!(
      "SELECT {METADATA_COLUMNS} FROM cache_entries ORDER BY key"
    ))?;
    let entries = stmt
      .query_map([], metadata_from_row)?
      .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
  }

  fn set_entry_status(&self, key: &str, status: SyncStatus) -> StorageResult<bool> {
    let conn = self.lock()?;
    let updated = conn.execute(
      "UPDATE cache_entries SET sync_status = ?2 WHERE key = ?1",
      params![key, status.as_str()],
    )?;
    Ok(updated > 0)
  }
}

fn action_from_row(row: &Row<'_>) -> rusqlite::Result<PendingAction> {
  let action_type: String = row.get(1)?;
  Ok(PendingAction {
    id: row.get(0)?,
    action_type: parse_column(1, &action_type)?,
    payload: row.get(2)?,
    timestamp: millis_to_datetime(3, row.get(3)?)?,
    retry_count: row.get(4)?,
    max_retries: row.get(5)?,
    last_error: row.get(6)?,
  })
}

fn failed_from_row(row: &Row<'_>) -> rusqlite::Result<FailedAction> {
  Ok(FailedAction {
    action: action_from_row(row)?,
    failed_at: millis_to_datetime(7, row.get(7)?)?,
  })
}

fn metadata_from_row(row: &Row<'_>) -> rusqlite::Result<CacheMetadata> {
  let data_type: String = row.get(3)?;
  let expires_at: Option<i64> = row.get(5)?;
  let sync_status: String = row.get(6)?;
  Ok(CacheMetadata {
    id: row.get(0)?,
    key: row.get(1)?,
    size: row.get::<_, i64>(2)? as usize,
    data_type: parse_column::<DataType>(3, &data_type)?,
    created_at: millis_to_datetime(4, row.get(4)?)?,
    expires_at: expires_at.map(|ms| millis_to_datetime(5, ms)).transpose()?,
    sync_status: parse_column::<SyncStatus>(6, &sync_status)?,
  })
}

fn parse_column<T>(idx: usize, value: &str) -> rusqlite::Result<T>
where
  T: std::str::FromStr<Err = String>,
{
  value
    .parse()
    .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn millis_to_datetime(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
  DateTime::from_timestamp_millis(ms).ok_or_else(|| {
    rusqlite::Error::FromSqlConversionFailure(
      idx,
      Type::Integer,
      format!("timestamp out of range: {}", ms).into(),
    )
  })
}
