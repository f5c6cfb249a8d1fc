//! Offline-first sync engine for the admin client.
//!
//! Reads go through a TTL cache backed by a durable store. Writes are queued
//! as pending actions and delivered in order by a single-flight coordinator
//! whenever the backend is reachable. Everything that happens is recorded in
//! a bounded event log.

pub mod cache;
pub mod clock;
pub mod engine;
pub mod error;
pub mod events;
pub mod queue;
pub mod store;
pub mod sync;

pub use engine::{EngineOptions, SyncEngine};
pub use error::{StorageError, SyncError, TransportError};
