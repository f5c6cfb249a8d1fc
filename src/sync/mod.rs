//! Delivery of queued actions: transport seam, connectivity signals, retry
//! backoff and the single-flight drain coordinator.

mod backoff;
mod connectivity;
mod coordinator;
mod transport;

pub use backoff::Backoff;
pub use connectivity::{probe, Connectivity};
pub use coordinator::{
  DrainOutcome, DrainSummary, SyncCoordinator, SyncPolicy, SyncState, SyncTrigger,
};
pub use transport::{HttpTransport, Transport};
