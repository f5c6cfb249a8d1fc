//! Cache layer: keyed, TTL-governed storage of serialized payloads.

use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use super::types::{
  CacheMetadata, CacheResult, CacheStatus, CachedData, DataType, SyncStatus, Ttl, TtlPolicy,
};
use crate::clock::Clock;
use crate::error::{StorageError, StorageResult};
use crate::events::{EventLog, SyncEventType};
use crate::store::{self, NewCacheEntry, Store};

/// Read cache in front of the transport.
///
/// Expiry is evaluated lazily against the clock on every read, so correctness
/// does not depend on background work. [`sweep_expired`](Self::sweep_expired)
/// only bounds storage growth.
pub struct CacheLayer<S: Store> {
  store: Arc<S>,
  events: EventLog,
  clock: Arc<dyn Clock>,
  ttls: TtlPolicy,
}

impl<S: Store> CacheLayer<S> {
  pub fn new(store: Arc<S>, events: EventLog, clock: Arc<dyn Clock>) -> Self {
    Self {
      store,
      events,
      clock,
      ttls: TtlPolicy::default(),
    }
  }

  /// Replace the default TTL policy.
  pub fn with_ttl_policy(mut self, ttls: TtlPolicy) -> Self {
    self.ttls = ttls;
    self
  }

  pub fn ttl_policy(&self) -> &TtlPolicy {
    &self.ttls
  }

  /// Store `payload` under `key` as confirmed remote state.
  pub async fn put<T: Serialize>(
    &self,
    key: &str,
    payload: &T,
    data_type: DataType,
    ttl: Ttl,
  ) -> StorageResult<CacheMetadata> {
    self
      .put_with_status(key, payload, data_type, ttl, SyncStatus::Synced)
      .await
  }

  /// Store `payload` under `key`, overwriting any previous entry.
  pub async fn put_with_status<T: Serialize>(
    &self,
    key: &str,
    payload: &T,
    data_type: DataType,
    ttl: Ttl,
    sync_status: SyncStatus,
  ) -> StorageResult<CacheMetadata> {
    let data = serde_json::to_vec(payload)?;
    let now = self.clock.now();
    let entry = NewCacheEntry {
      key: key.to_string(),
      data,
      data_type,
      created_at: now,
      expires_at: self.ttls.expires_at(now, data_type, ttl),
      sync_status,
    };

    let metadata = store::blocking(&self.store, move |s| s.put_entry(&entry)).await?;
    debug!(key, data_type = %data_type, size = metadata.size, "cached");
    Ok(metadata)
  }

  /// Look up `key`. Expired entries are evicted and reported as a miss.
  pub async fn get<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<CachedData<T>>> {
    let lookup = key.to_string();
    let entry = store::blocking(&self.store, move |s| s.get_entry(&lookup)).await?;

    let Some(entry) = entry else {
      self
        .events
        .record(SyncEventType::CacheMiss, Some(key.to_string()));
      return Ok(None);
    };

    let now = self.clock.now();
    if entry.metadata.is_expired(now) {
      let evict = key.to_string();
      store::blocking(&self.store, move |s| s.remove_entry_if_expired(&evict, now)).await?;
      debug!(key, "evicted expired entry");
      self
        .events
        .record(SyncEventType::CacheExpired, Some(key.to_string()));
      return Ok(None);
    }

    let data = serde_json::from_slice(&entry.data).map_err(StorageError::Serialization)?;
    self
      .events
      .record(SyncEventType::CacheHit, Some(key.to_string()));
    Ok(Some(CachedData {
      data,
      cached_at: entry.metadata.created_at,
      expires_at: entry.metadata.expires_at,
      sync_status: entry.metadata.sync_status,
    }))
  }

  /// Read-through fetch: serve an unexpired entry, otherwise call `fetcher`,
  /// cache its result with the data type's default TTL and return it.
  pub async fn fetch<T, F, Fut, E>(
    &self,
    key: &str,
    data_type: DataType,
    fetcher: F,
  ) -> Result<CacheResult<T>, E>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<StorageError>,
  {
    if let Some(cached) = self.get::<T>(key).await? {
      return Ok(CacheResult::from_cache(cached.data, cached.cached_at));
    }

    let data = fetcher().await?;
    self.put(key, &data, data_type, Ttl::Default).await?;
    Ok(CacheResult::from_network(data))
  }

  /// Remove `key` unconditionally.
  pub async fn invalidate(&self, key: &str) -> StorageResult<bool> {
    let target = key.to_string();
    let removed = store::blocking(&self.store, move |s| s.remove_entry(&target)).await?;
    self
      .events
      .record(SyncEventType::CacheCleared, Some(key.to_string()));
    Ok(removed)
  }

  /// Remove every entry.
  pub async fn clear(&self) -> StorageResult<usize> {
    let removed = store::blocking(&self.store, |s| s.clear_entries()).await?;
    info!(removed, "cache cleared");
    self.events.record(
      SyncEventType::CacheCleared,
      Some(format!("all entries ({})", removed)),
    );
    Ok(removed)
  }

  /// Evict every expired entry. Safe to run alongside reads and writes:
  /// an entry rewritten since it expired is left alone.
  pub async fn sweep_expired(&self) -> StorageResult<usize> {
    let now = self.clock.now();
    let removed = store::blocking(&self.store, move |s| s.remove_expired(now)).await?;
    if removed > 0 {
      info!(removed, "swept expired cache entries");
      self.events.record(
        SyncEventType::CacheExpired,
        Some(format!("swept {} expired entries", removed)),
      );
    }
    Ok(removed)
  }

  /// Update the sync status of a cached entry without touching its payload.
  pub async fn set_sync_status(&self, key: &str, status: SyncStatus) -> StorageResult<bool> {
    let target = key.to_string();
    store::blocking(&self.store, move |s| s.set_entry_status(&target, status)).await
  }

  /// Descriptors of every stored entry, including expired ones not yet evicted.
  pub async fn entries(&self) -> StorageResult<Vec<CacheMetadata>> {
    store::blocking(&self.store, |s| s.list_entries()).await
  }

  pub async fn status(&self) -> StorageResult<CacheStatus> {
    let entries = self.entries().await?;
    let now = self.clock.now();
    let mut status = CacheStatus::default();
    for entry in &entries {
      status.total += 1;
      status.total_bytes += entry.size;
      if entry.is_expired(now) {
        status.expired += 1;
      }
      *status.by_type.entry(entry.data_type).or_default() += 1;
    }
    Ok(status)
  }
}

impl<S: Store> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      events: self.events.clone(),
      clock: Arc::clone(&self.clock),
      ttls: self.ttls.clone(),
    }
  }
}
