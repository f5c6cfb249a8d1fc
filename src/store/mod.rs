//! Durable storage for queued actions and cache entries.
//!
//! The [`Store`] trait is the persistence seam the engine consumes. Every method
//! is atomic: a reader never observes a half-written record. Implementations are
//! synchronous; async callers go through `blocking`.

mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::cache::{CacheMetadata, DataType, SyncStatus};
use crate::error::{StorageError, StorageResult};
use crate::queue::{ActionType, FailedAction, PendingAction};

/// A cache write, before the store assigns an id.
#[derive(Debug, Clone)]
pub struct NewCacheEntry {
  pub key: String,
  pub data: Vec<u8>,
  pub data_type: DataType,
  pub created_at: DateTime<Utc>,
  pub expires_at: Option<DateTime<Utc>>,
  pub sync_status: SyncStatus,
}

/// A stored cache entry: descriptor plus payload bytes.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub metadata: CacheMetadata,
  pub data: Vec<u8>,
}

/// What happened to an action after a failed delivery was recorded.
#[derive(Debug, Clone)]
pub enum ActionFailure {
  /// Still queued with the incremented retry count
  Retrying(PendingAction),
  /// Budget exhausted; moved to the dead-letter table
  Exhausted(FailedAction),
}

/// Persistence backend for the queue and the cache.
pub trait Store: Send + Sync + 'static {
  /// Append an action to the tail of the queue.
  fn insert_action(
    &self,
    action_type: ActionType,
    payload: &[u8],
    max_retries: u32,
    created_at: DateTime<Utc>,
  ) -> StorageResult<PendingAction>;

  /// Oldest queued action.
  fn first_action(&self) -> StorageResult<Option<PendingAction>>;

  /// All queued actions in delivery order.
  fn list_actions(&self) -> StorageResult<Vec<PendingAction>>;

  fn count_actions(&self) -> StorageResult<usize>;

  /// Delete a queued action. Returns false if it was not present.
  fn remove_action(&self, id: i64) -> StorageResult<bool>;

  /// Increment the retry count of a queued action and, once the budget is
  /// spent, move it to the dead-letter table in the same transaction.
  /// Returns `None` if the action is not queued.
  fn fail_action(
    &self,
    id: i64,
    error: &str,
    now: DateTime<Utc>,
  ) -> StorageResult<Option<ActionFailure>>;

  fn list_failed(&self) -> StorageResult<Vec<FailedAction>>;

  fn count_failed(&self) -> StorageResult<usize>;

  /// Delete a dead-lettered action, returning it if it existed.
  fn remove_failed(&self, id: i64) -> StorageResult<Option<FailedAction>>;

  /// Move a dead-lettered action back to the tail of the queue with a fresh
  /// id and retry budget.
  fn requeue_failed(&self, id: i64, now: DateTime<Utc>) -> StorageResult<Option<PendingAction>>;

  /// Write an entry, replacing any existing entry with the same key.
  fn put_entry(&self, entry: &NewCacheEntry) -> StorageResult<CacheMetadata>;

  fn get_entry(&self, key: &str) -> StorageResult<Option<CacheEntry>>;

  fn remove_entry(&self, key: &str) -> StorageResult<bool>;

  /// Delete the entry only if it is still expired at `now`, so a concurrent
  /// fresh write to the same key survives.
  fn remove_entry_if_expired(&self, key: &str, now: DateTime<Utc>) -> StorageResult<bool>;

  /// Delete every entry expired at `now`. Returns how many were removed.
  fn remove_expired(&self, now: DateTime<Utc>) -> StorageResult<usize>;

  fn clear_entries(&self) -> StorageResult<usize>;

  fn list_entries(&self) -> StorageResult<Vec<CacheMetadata>>;

  fn set_entry_status(&self, key: &str, status: SyncStatus) -> StorageResult<bool>;
}

/// Run a storage operation on the blocking thread pool.
pub(crate) async fn blocking<S, F, T>(store: &Arc<S>, op: F) -> StorageResult<T>
where
  S: Store,
  F: FnOnce(&S) -> StorageResult<T> + Send + 'static,
  T: Send + 'static,
{
  let store = Arc::clone(store);
  tokio::task::spawn_blocking(move || op(&store))
    .await
    .map_err(|e| StorageError::Task(e.to_string()))?
}
