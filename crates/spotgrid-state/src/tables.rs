//! redb table definitions for the spotgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types), except `command_requests` which maps a request id straight to a
//! command table key. Timestamps embedded in keys are zero-padded to 20
//! digits so lexicographic order matches numeric order.

use redb::TableDefinition;

/// Instance records keyed by `{logical_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Replica records keyed by `{agent_id}:{replica_id}`.
pub const REPLICAS: TableDefinition<&str, &[u8]> = TableDefinition::new("replicas");

/// Raw price samples keyed by `{pool_id}:{captured_at:020}:{agent_id}:{source}`.
/// Append-only; re-ingesting the identical tuple overwrites itself.
pub const RAW_PRICE_SAMPLES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("raw_price_samples");

/// Canonical price points keyed by `{pool_id}:{bucket:020}`.
/// Written only by the consolidator, one record per (pool, bucket).
pub const PRICE_POINTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("consolidated_price_points");

/// Commands keyed by `{agent_id}:{command_id}`.
pub const COMMANDS: TableDefinition<&str, &[u8]> = TableDefinition::new("commands");

/// Idempotency index: `request_id` -> command table key. The uniqueness of
/// this mapping is the queue's concurrency primitive.
pub const COMMAND_REQUESTS: TableDefinition<&str, &str> =
    TableDefinition::new("command_requests");

/// Consolidation job records keyed by `{started_at:020}:{job_id}`.
pub const CONSOLIDATION_JOBS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("consolidation_jobs");

/// Per-agent control flags keyed by `{agent_id}`.
pub const AGENT_CONTROLS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("agent_controls");

/// Boot-time observations keyed by `{agent_id}:{pool_id}`.
pub const BOOT_STATS: TableDefinition<&str, &[u8]> = TableDefinition::new("boot_stats");

/// Failover history keyed by `{agent_id}:{created_at:020}:{event_id}`.
pub const FAILOVER_EVENTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("failover_events");

/// Decision audit entries keyed by `{agent_id}:{created_at:020}:{audit_id}`.
pub const DECISION_AUDIT: TableDefinition<&str, &[u8]> =
    TableDefinition::new("decision_audit");

/// Engine config singleton, keyed by `"engine"`.
pub const ENGINE_CONFIG: TableDefinition<&str, &[u8]> =
    TableDefinition::new("engine_config");
