//! Keyed read cache with per-entry expiry.
//!
//! Payloads are stored as serialized JSON under a string key. Each entry
//! belongs to a [`DataType`] that supplies its default time-to-live; callers
//! may override it per write or ask for no expiry at all.

mod layer;
mod types;

pub use layer::CacheLayer;
pub use types::{
  CacheMetadata, CacheResult, CacheSource, CacheStatus, CachedData, DataType, SyncStatus, Ttl,
  TtlPolicy,
};
