//! Core types for the read cache.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Resource categories, each with its own default time-to-live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
  Dashboard,
  Orders,
  Products,
  Partners,
  Commissions,
  Inquiries,
  UserProfile,
  Analytics,
  Other,
}

impl DataType {
  pub const ALL: [DataType; 9] = [
    DataType::Dashboard,
    DataType::Orders,
    DataType::Products,
    DataType::Partners,
    DataType::Commissions,
    DataType::Inquiries,
    DataType::UserProfile,
    DataType::Analytics,
    DataType::Other,
  ];

  /// TTL applied when the caller does not pass one explicitly.
  pub fn default_ttl(&self) -> Duration {
    let secs = match self {
      Self::Dashboard => 60,
      Self::Orders => 120,
      Self::Products => 300,
      Self::Partners => 600,
      Self::Commissions => 300,
      Self::Inquiries => 120,
      Self::UserProfile => 1800,
      Self::Analytics => 900,
      Self::Other => 300,
    };
    Duration::seconds(secs)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Dashboard => "dashboard",
      Self::Orders => "orders",
      Self::Products => "products",
      Self::Partners => "partners",
      Self::Commissions => "commissions",
      Self::Inquiries => "inquiries",
      Self::UserProfile => "user_profile",
      Self::Analytics => "analytics",
      Self::Other => "other",
    }
  }
}

impl fmt::Display for DataType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for DataType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let normalized = s.trim().to_lowercase().replace('-', "_");
    Self::ALL
      .iter()
      .copied()
      .find(|t| t.as_str() == normalized)
      .ok_or_else(|| format!("unknown data type '{}'", s))
  }
}

/// Expiry requested by the caller of a cache write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ttl {
  /// Use the data type's default (or the configured override)
  #[default]
  Default,
  /// Expire after this long
  After(Duration),
  /// Never expire; only explicit invalidation removes the entry
  Never,
}

/// Default TTLs per data type, with optional overrides from configuration.
#[derive(Debug, Clone, Default)]
pub struct TtlPolicy {
  overrides: HashMap<DataType, Duration>,
}

impl TtlPolicy {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_override(mut self, data_type: DataType, ttl: Duration) -> Self {
    self.overrides.insert(data_type, ttl);
    self
  }

  pub fn default_ttl(&self, data_type: DataType) -> Duration {
    self
      .overrides
      .get(&data_type)
      .copied()
      .unwrap_or_else(|| data_type.default_ttl())
  }

  /// Absolute expiry for a write made at `now`. A TTL reaching past the
  /// representable range means the entry never expires.
  pub fn expires_at(&self, now: DateTime<Utc>, data_type: DataType, ttl: Ttl) -> Option<DateTime<Utc>> {
    match ttl {
      Ttl::Default => now.checked_add_signed(self.default_ttl(data_type)),
      Ttl::After(duration) => now.checked_add_signed(duration),
      Ttl::Never => None,
    }
  }
}

/// Whether a cached copy reflects confirmed remote state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
  #[default]
  Synced,
  /// Locally optimistic, not yet confirmed by the backend
  Pending,
  Syncing,
  Failed,
}

impl SyncStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Synced => "synced",
      Self::Pending => "pending",
      Self::Syncing => "syncing",
      Self::Failed => "failed",
    }
  }
}

impl FromStr for SyncStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "synced" => Ok(Self::Synced),
      "pending" => Ok(Self::Pending),
      "syncing" => Ok(Self::Syncing),
      "failed" => Ok(Self::Failed),
      other => Err(format!("unknown sync status '{}'", other)),
    }
  }
}

/// Descriptor for one cached entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
  pub id: i64,
  pub key: String,
  /// Byte length of the stored payload
  pub size: usize,
  pub created_at: DateTime<Utc>,
  pub expires_at: Option<DateTime<Utc>>,
  pub data_type: DataType,
  pub sync_status: SyncStatus,
}

impl CacheMetadata {
  /// Pure function of `expires_at` and `now`; never touches stored state.
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expires_at.is_some_and(|expires_at| now > expires_at)
  }
}

/// Value envelope handed back to readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedData<T> {
  pub data: T,
  pub cached_at: DateTime<Utc>,
  pub expires_at: Option<DateTime<Utc>>,
  pub sync_status: SyncStatus,
}

/// Result from a read-through fetch, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched through the transport and written back to the cache
  Network,
  /// Served from an unexpired cache entry
  Cache,
}

/// Summary of cache contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatus {
  pub total: usize,
  pub expired: usize,
  pub total_bytes: usize,
  pub by_type: BTreeMap<DataType, usize>,
}
