//! Application-root composition of the sync engine.

use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{CacheLayer, TtlPolicy};
use crate::clock::{Clock, SystemClock};
use crate::error::{StorageResult, SyncError};
use crate::events::{EventLog, DEFAULT_EVENT_CAPACITY};
use crate::queue::{ActionType, PendingAction, PendingQueue, DEFAULT_MAX_RETRIES};
use crate::store::{SqliteStore, Store};
use crate::sync::{DrainOutcome, SyncCoordinator, SyncPolicy, SyncTrigger, Transport};

/// Tunables for [`SyncEngine`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
  pub event_capacity: usize,
  pub max_retries: u32,
  pub ttl_policy: TtlPolicy,
  pub sync_policy: SyncPolicy,
}

impl Default for EngineOptions {
  fn default() -> Self {
    Self {
      event_capacity: DEFAULT_EVENT_CAPACITY,
      max_retries: DEFAULT_MAX_RETRIES,
      ttl_policy: TtlPolicy::default(),
      sync_policy: SyncPolicy::default(),
    }
  }
}

/// Owns the store, event log, cache, queue and coordinator.
///
/// Construct one at the application root and hand out references; the
/// components share the store and event log but nothing else.
pub struct SyncEngine<S: Store = SqliteStore> {
  events: EventLog,
  cache: CacheLayer<S>,
  queue: PendingQueue<S>,
  coordinator: Arc<SyncCoordinator<S>>,
}

impl<S: Store> SyncEngine<S> {
  pub fn new(store: S, transport: Arc<dyn Transport>, options: EngineOptions) -> Self {
    Self::with_clock(store, transport, options, Arc::new(SystemClock))
  }

  pub fn with_clock(
    store: S,
    transport: Arc<dyn Transport>,
    options: EngineOptions,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let store = Arc::new(store);
    let events = EventLog::new(options.event_capacity, Arc::clone(&clock));
    let cache = CacheLayer::new(Arc::clone(&store), events.clone(), Arc::clone(&clock))
      .with_ttl_policy(options.ttl_policy);
    let queue = PendingQueue::new(store, events.clone(), clock)
      .with_default_max_retries(options.max_retries);
    let coordinator = Arc::new(SyncCoordinator::new(
      queue.clone(),
      transport,
      events.clone(),
      options.sync_policy,
    ));

    Self {
      events,
      cache,
      queue,
      coordinator,
    }
  }

  pub fn cache(&self) -> &CacheLayer<S> {
    &self.cache
  }

  pub fn queue(&self) -> &PendingQueue<S> {
    &self.queue
  }

  pub fn events(&self) -> &EventLog {
    &self.events
  }

  pub fn coordinator(&self) -> &Arc<SyncCoordinator<S>> {
    &self.coordinator
  }

  /// Queue a write and, if online, start delivering it in the background.
  pub async fn submit(&self, action_type: ActionType, payload: Vec<u8>) -> StorageResult<PendingAction> {
    let action = self.queue.enqueue(action_type, payload).await?;
    if self.coordinator.is_online() {
      let coordinator = Arc::clone(&self.coordinator);
      tokio::spawn(async move {
        if let Err(err) = coordinator.trigger_sync(SyncTrigger::Manual).await {
          warn!(error = %err, "drain after submit failed");
        }
      });
    }
    Ok(action)
  }

  /// Manual refresh from the UI.
  pub async fn trigger_sync(&self) -> Result<DrainOutcome, SyncError> {
    self.coordinator.trigger_sync(SyncTrigger::Manual).await
  }

  /// The application returned to the foreground.
  pub async fn foregrounded(&self) -> Result<DrainOutcome, SyncError> {
    self.coordinator.trigger_sync(SyncTrigger::Foreground).await
  }

  /// Feed connectivity signals to the coordinator until the stream ends.
  pub fn spawn_observer<St>(&self, signals: St) -> JoinHandle<()>
  where
    St: Stream<Item = bool> + Send + 'static,
  {
    let coordinator = Arc::clone(&self.coordinator);
    tokio::spawn(coordinator.observe(signals))
  }

  /// Periodically evict expired cache entries.
  pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
    let cache = self.cache.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      // The first tick completes immediately
      ticker.tick().await;
      loop {
        ticker.tick().await;
        match cache.sweep_expired().await {
          Ok(removed) => debug!(removed, "cache sweep finished"),
          Err(err) => warn!(error = %err, "cache sweep failed"),
        }
      }
    })
  }
}
