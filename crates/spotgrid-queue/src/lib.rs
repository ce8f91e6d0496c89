//! spotgrid-queue — the durable command queue.
//!
//! Hands concrete actions (create replica, promote, terminate, switch)
//! to the remote agents that execute them. Enqueueing is idempotent on
//! `request_id` — the store's uniqueness index is the concurrency
//! primitive, not a lock. Delivery is priority-ordered (emergency >
//! scheduled > manual). Commands unacknowledged past their expiry are
//! marked `Expired` and surfaced for operator attention, never silently
//! retried forever.

pub mod queue;

pub use queue::{AckOutcome, CommandQueue, EnqueueOutcome, derive_request_id};
