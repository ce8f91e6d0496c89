//! spotgrid-state — embedded state store for spotgrid.
//!
//! Backed by [redb](https://docs.rs/redb), holds every durable record the
//! engine owns: instances, replicas, the raw and canonical pricing tiers,
//! commands, consolidation jobs, per-agent control flags, boot-time stats,
//! and the failover/decision audit trails.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{agent_id}:{id}`, `{pool_id}:{bucket}`) enable prefix
//! scans for related records.
//!
//! Instance and replica rows carry a monotonically increasing `version`
//! and are mutated only through the version-checked operations on
//! [`StateStore`] — a compare-and-swap inside a single write transaction.
//! No other code path writes those rows.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod config;
pub mod error;
pub mod machine;
pub mod store;
pub mod tables;
pub mod types;

pub use config::*;
pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
