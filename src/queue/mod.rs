//! Durable FIFO queue of mutations awaiting delivery.

mod action;
mod pending;

pub use action::{ActionType, FailedAction, PendingAction, DEFAULT_MAX_RETRIES};
pub use pending::{FailureOutcome, PendingQueue};
