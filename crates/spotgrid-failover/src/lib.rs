//! spotgrid-failover — the emergency failover orchestrator.
//!
//! Reacts to the two interruption signals a preemptible instance gets:
//! a `rebalance_notice` (soft, minutes of lead time) provisions a
//! standby replica in the fastest-booting pool, and a
//! `termination_notice` (hard, ~2 minutes) promotes a ready replica to
//! primary inside a hard latency budget. The promotion path touches only
//! locally cached state — never the decision provider.
//!
//! Also owns the manual/automatic mode mutual exclusion, the zombie
//! reaper that eventually terminates demoted primaries, and the
//! fire-and-forget [`Notifier`] out-contract.

pub mod notifier;
pub mod orchestrator;
pub mod reaper;

pub use notifier::{FailoverNotification, LogNotifier, Notifier};
pub use orchestrator::{FailoverOptions, FailoverOrchestrator, FailoverOutcome};
pub use reaper::ZombieReaper;
