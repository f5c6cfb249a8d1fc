//! Error types for the sync engine.

use std::time::Duration;
use thiserror::Error;

/// Durable store failures. Fatal to the requested operation, never retried here.
#[derive(Debug, Error)]
pub enum StorageError {
  #[error("database error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("storage lock poisoned")]
  LockPoisoned,

  #[error("storage task failed: {0}")]
  Task(String),

  #[error("pending action not found: {0}")]
  ActionNotFound(i64),

  #[error("corrupt record: {0}")]
  Corrupt(String),
}

/// A single failed delivery attempt. Counts toward the action's retry budget.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
  #[error("network error: {0}")]
  Network(String),

  #[error("delivery timed out after {0:?}")]
  Timeout(Duration),

  #[error("rejected by backend ({status}): {reason}")]
  Rejected { status: u16, reason: String },

  #[error("transport is offline")]
  Offline,
}

/// Errors surfaced by a drain pass. Transport errors are absorbed by the retry
/// policy, so only storage failures escape.
#[derive(Debug, Error)]
pub enum SyncError {
  #[error(transparent)]
  Storage(#[from] StorageError),
}

pub type StorageResult<T> = Result<T, StorageError>;
