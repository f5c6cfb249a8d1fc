//! Bounded diagnostic log of sync and cache activity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::clock::Clock;

pub const DEFAULT_EVENT_CAPACITY: usize = 500;

/// Kinds of engine activity recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncEventType {
  SyncStarted,
  SyncCompleted,
  SyncFailed,
  ActionQueued,
  ActionExecuted,
  ActionFailed,
  CacheHit,
  CacheMiss,
  CacheExpired,
  CacheCleared,
  NetworkOnline,
  NetworkOffline,
}

impl SyncEventType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::SyncStarted => "syncStarted",
      Self::SyncCompleted => "syncCompleted",
      Self::SyncFailed => "syncFailed",
      Self::ActionQueued => "actionQueued",
      Self::ActionExecuted => "actionExecuted",
      Self::ActionFailed => "actionFailed",
      Self::CacheHit => "cacheHit",
      Self::CacheMiss => "cacheMiss",
      Self::CacheExpired => "cacheExpired",
      Self::CacheCleared => "cacheCleared",
      Self::NetworkOnline => "networkOnline",
      Self::NetworkOffline => "networkOffline",
    }
  }

  pub fn is_action(&self) -> bool {
    matches!(
      self,
      Self::ActionQueued | Self::ActionExecuted | Self::ActionFailed
    )
  }

  pub fn is_sync(&self) -> bool {
    matches!(
      self,
      Self::SyncStarted | Self::SyncCompleted | Self::SyncFailed
    )
  }
}

impl fmt::Display for SyncEventType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Immutable audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
  pub id: u64,
  #[serde(rename = "type")]
  pub kind: SyncEventType,
  pub timestamp: DateTime<Utc>,
  pub details: Option<String>,
  pub success: bool,
  pub error_message: Option<String>,
}

struct LogInner {
  events: VecDeque<SyncEvent>,
  capacity: usize,
  next_id: u64,
}

/// Append-only event log. Oldest events are evicted once `capacity` is reached.
///
/// Cloning is cheap; all clones share the same log and subscribers.
#[derive(Clone)]
pub struct EventLog {
  inner: Arc<Mutex<LogInner>>,
  tx: broadcast::Sender<SyncEvent>,
  clock: Arc<dyn Clock>,
}

impl EventLog {
  pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
    let capacity = capacity.max(1);
    let (tx, _rx) = broadcast::channel(capacity);
    Self {
      inner: Arc::new(Mutex::new(LogInner {
        events: VecDeque::with_capacity(capacity),
        capacity,
        next_id: 1,
      })),
      tx,
      clock,
    }
  }

  /// Record a successful event.
  pub fn record(&self, kind: SyncEventType, details: Option<String>) -> SyncEvent {
    self.push(kind, details, true, None)
  }

  /// Record a failed event with its error message.
  pub fn record_failure(
    &self,
    kind: SyncEventType,
    details: Option<String>,
    error: impl Into<String>,
  ) -> SyncEvent {
    self.push(kind, details, false, Some(error.into()))
  }

  fn push(
    &self,
    kind: SyncEventType,
    details: Option<String>,
    success: bool,
    error_message: Option<String>,
  ) -> SyncEvent {
    let event = {
      let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
      let event = SyncEvent {
        id: inner.next_id,
        kind,
        timestamp: self.clock.now(),
        details,
        success,
        error_message,
      };
      inner.next_id += 1;
      if inner.events.len() == inner.capacity {
        inner.events.pop_front();
      }
      inner.events.push_back(event.clone());
      event
    };

    if event.success {
      debug!(kind = %event.kind, details = ?event.details, "sync event");
    } else {
      warn!(kind = %event.kind, details = ?event.details, error = ?event.error_message, "sync event");
    }

    // No subscribers is fine
    let _ = self.tx.send(event.clone());
    event
  }

  /// The newest `n` events, oldest first.
  pub fn recent(&self, n: usize) -> Vec<SyncEvent> {
    let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
    let skip = inner.events.len().saturating_sub(n);
    inner.events.iter().skip(skip).cloned().collect()
  }

  /// All retained events with `timestamp >= since`, oldest first.
  pub fn since(&self, since: DateTime<Utc>) -> Vec<SyncEvent> {
    let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
    inner
      .events
      .iter()
      .filter(|e| e.timestamp >= since)
      .cloned()
      .collect()
  }

  pub fn len(&self) -> usize {
    self.inner.lock().unwrap_or_else(|e| e.into_inner()).events.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Live feed of events recorded after this call.
  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.tx.subscribe()
  }
}
