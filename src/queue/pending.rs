//! Queue operations over the durable store.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::action::{ActionType, FailedAction, PendingAction, DEFAULT_MAX_RETRIES};
use crate::clock::Clock;
use crate::error::{StorageError, StorageResult};
use crate::events::{EventLog, SyncEventType};
use crate::store::{self, ActionFailure, Store};

/// Result of recording a failed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
  /// The action stays at its place in the queue for a later attempt
  WillRetry { retry_count: u32, max_retries: u32 },
  /// The retry budget is spent; the action left the active queue and sits in
  /// the dead-letter table until acknowledged or requeued
  PermanentlyFailed(FailedAction),
}

/// Ordered durable queue of pending actions.
///
/// Only the sync coordinator should call [`record_success`](Self::record_success)
/// and [`record_failure`](Self::record_failure).
pub struct PendingQueue<S: Store> {
  store: Arc<S>,
  events: EventLog,
  clock: Arc<dyn Clock>,
  default_max_retries: u32,
}

impl<S: Store> PendingQueue<S> {
  pub fn new(store: Arc<S>, events: EventLog, clock: Arc<dyn Clock>) -> Self {
    Self {
      store,
      events,
      clock,
      default_max_retries: DEFAULT_MAX_RETRIES,
    }
  }

  /// Set the retry ceiling used by [`enqueue`](Self::enqueue).
  pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
    self.default_max_retries = max_retries.max(1);
    self
  }

  pub fn default_max_retries(&self) -> u32 {
    self.default_max_retries
  }

  /// Append a new action with the default retry ceiling.
  pub async fn enqueue(
    &self,
    action_type: ActionType,
    payload: Vec<u8>,
  ) -> StorageResult<PendingAction> {
    self
      .enqueue_with_retries(action_type, payload, self.default_max_retries)
      .await
  }

  /// Append a new action. Every action gets at least one delivery attempt,
  /// so a ceiling of 0 is raised to 1.
  pub async fn enqueue_with_retries(
    &self,
    action_type: ActionType,
    payload: Vec<u8>,
    max_retries: u32,
  ) -> StorageResult<PendingAction> {
    let max_retries = max_retries.max(1);
    let now = self.clock.now();
    let action = store::blocking(&self.store, move |s| {
      s.insert_action(action_type, &payload, max_retries, now)
    })
    .await?;

    info!(id = action.id, action_type = %action.action_type, "queued action");
    self.events.record(
      SyncEventType::ActionQueued,
      Some(format!("{} #{}", action.action_type, action.id)),
    );
    Ok(action)
  }

  /// The oldest queued action. Delivery must follow this order.
  pub async fn peek_next(&self) -> StorageResult<Option<PendingAction>> {
    store::blocking(&self.store, |s| s.first_action()).await
  }

  /// Remove a delivered action. A second call for the same id is a no-op
  /// returning `false`.
  pub async fn record_success(&self, id: i64) -> StorageResult<bool> {
    let removed = store::blocking(&self.store, move |s| s.remove_action(id)).await?;
    if removed {
      info!(id, "action delivered");
      self
        .events
        .record(SyncEventType::ActionExecuted, Some(format!("action #{}", id)));
    } else {
      debug!(id, "success recorded for an action no longer queued");
    }
    Ok(removed)
  }

  /// Count a failed delivery against the action's retry budget.
  pub async fn record_failure(&self, id: i64, reason: &str) -> StorageResult<FailureOutcome> {
    let now = self.clock.now();
    let error = reason.to_string();
    let failure = store::blocking(&self.store, move |s| s.fail_action(id, &error, now))
      .await?
      .ok_or(StorageError::ActionNotFound(id))?;

    let outcome = match failure {
      ActionFailure::Retrying(action) => {
        warn!(
          id,
          retry_count = action.retry_count,
          max_retries = action.max_retries,
          reason,
          "delivery failed, will retry"
        );
        self.events.record_failure(
          SyncEventType::ActionFailed,
          Some(format!(
            "action #{} attempt {}/{}",
            id, action.retry_count, action.max_retries
          )),
          reason,
        );
        FailureOutcome::WillRetry {
          retry_count: action.retry_count,
          max_retries: action.max_retries,
        }
      }
      ActionFailure::Exhausted(failed) => {
        warn!(id, reason, "delivery failed permanently");
        self.events.record_failure(
          SyncEventType::ActionFailed,
          Some(format!(
            "action #{} permanently failed after {} attempts",
            id, failed.action.retry_count
          )),
          reason,
        );
        FailureOutcome::PermanentlyFailed(failed)
      }
    };
    Ok(outcome)
  }

  pub async fn pending_count(&self) -> StorageResult<usize> {
    store::blocking(&self.store, |s| s.count_actions()).await
  }

  /// All queued actions in delivery order.
  pub async fn list_all(&self) -> StorageResult<Vec<PendingAction>> {
    store::blocking(&self.store, |s| s.list_actions()).await
  }

  pub async fn failed_count(&self) -> StorageResult<usize> {
    store::blocking(&self.store, |s| s.count_failed()).await
  }

  /// Dead-lettered actions awaiting review.
  pub async fn list_failed(&self) -> StorageResult<Vec<FailedAction>> {
    store::blocking(&self.store, |s| s.list_failed()).await
  }

  /// Discard a dead-lettered action.
  pub async fn acknowledge(&self, id: i64) -> StorageResult<bool> {
    let removed = store::blocking(&self.store, move |s| s.remove_failed(id)).await?;
    if removed.is_some() {
      info!(id, "failed action acknowledged");
    }
    Ok(removed.is_some())
  }

  /// Put a dead-lettered action back at the tail of the queue with a fresh
  /// id and retry budget.
  pub async fn requeue(&self, id: i64) -> StorageResult<Option<PendingAction>> {
    let now = self.clock.now();
    let requeued = store::blocking(&self.store, move |s| s.requeue_failed(id, now)).await?;
    if let Some(action) = &requeued {
      info!(old_id = id, id = action.id, "failed action requeued");
      self.events.record(
        SyncEventType::ActionQueued,
        Some(format!("{} #{} (requeued #{})", action.action_type, action.id, id)),
      );
    }
    Ok(requeued)
  }
}

impl<S: Store> Clone for PendingQueue<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      events: self.events.clone(),
      clock: Arc::clone(&self.clock),
      default_max_retries: self.default_max_retries,
    }
  }
}
