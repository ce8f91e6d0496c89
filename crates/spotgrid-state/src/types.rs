//! Domain types for the spotgrid state store.
//!
//! These types represent the persisted state of instances, replicas, the
//! raw and canonical pricing tiers, commands, consolidation jobs, agent
//! control flags, and the audit trails. All types are serializable to/from
//! JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

/// Stable logical identifier for a monitored instance. Survives the
/// underlying provider instance being replaced.
pub type LogicalId = String;

/// Identifier of a reporting agent (one per monitored workload).
pub type AgentId = String;

/// Capacity pool identifier (instance-type + zone).
pub type PoolId = String;

/// Unique identifier for a command.
pub type CommandId = String;

// ── Instance ──────────────────────────────────────────────────────

/// One monitored compute resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    /// Stable logical id; survives instance replacement.
    pub logical_id: LogicalId,
    /// Current provider-assigned instance id.
    pub provider_id: String,
    pub agent_id: AgentId,
    pub role: InstanceRole,
    pub status: LifecycleStatus,
    pub mode: CapacityMode,
    pub pool_id: PoolId,
    /// Monotonically increasing version for optimistic concurrency.
    pub version: u64,
    pub launch_requested_at: u64,
    pub launch_confirmed_at: Option<u64>,
    pub termination_requested_at: Option<u64>,
    pub termination_confirmed_at: Option<u64>,
    pub last_heartbeat_at: Option<u64>,
    /// Unix timestamp of last mutation.
    pub updated_at: u64,
    /// When this instance entered its current pool (dwell-time tracking).
    pub pool_entered_at: u64,
}

impl InstanceRecord {
    /// Seconds from launch request to launch confirmation, if confirmed.
    pub fn launch_duration_seconds(&self) -> Option<u64> {
        self.launch_confirmed_at
            .map(|t| t.saturating_sub(self.launch_requested_at))
    }

    /// Seconds from termination request to confirmation, if both happened.
    pub fn termination_duration_seconds(&self) -> Option<u64> {
        match (self.termination_requested_at, self.termination_confirmed_at) {
            (Some(req), Some(conf)) => Some(conf.saturating_sub(req)),
            _ => None,
        }
    }

    /// Seconds spent in the current pool as of `now`.
    pub fn pool_dwell_seconds(&self, now: u64) -> u64 {
        now.saturating_sub(self.pool_entered_at)
    }

    pub fn is_terminal(&self) -> bool {
        self.status == LifecycleStatus::Terminated
    }

    /// True for the row that currently serves production traffic.
    pub fn is_active_primary(&self) -> bool {
        self.role == InstanceRole::Primary && !self.is_terminal()
    }
}

/// Role an instance plays for its logical agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceRole {
    Primary,
    Replica,
    /// Demoted former primary, pending termination. Never reusable.
    Zombie,
}

/// Lifecycle status of an instance. `Terminated` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Launching,
    Running,
    Promoting,
    Zombie,
    Terminating,
    Terminated,
}

impl LifecycleStatus {
    pub fn is_terminal(self) -> bool {
        self == LifecycleStatus::Terminated
    }
}

/// Which capacity tier the instance runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityMode {
    /// Preemptible, discounted capacity.
    Discounted,
    /// On-demand, stable capacity.
    Stable,
}

// ── Replica ───────────────────────────────────────────────────────

/// A standby instance associated with a primary's logical agent.
/// At most one live replica may exist per agent at any time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicaRecord {
    pub id: String,
    pub agent_id: AgentId,
    /// Set once the replica's instance record is registered.
    pub instance_logical_id: Option<LogicalId>,
    pub pool_id: PoolId,
    pub creation_reason: ReplicaReason,
    pub sync_status: SyncStatus,
    pub boot_time_seconds: Option<u64>,
    /// Idempotency key for the creation request.
    pub request_id: String,
    pub status: ReplicaStatus,
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ReplicaRecord {
    /// Live replicas block creation of another and are eligible targets
    /// for promotion.
    pub fn is_live(&self) -> bool {
        matches!(
            self.status,
            ReplicaStatus::Provisioning | ReplicaStatus::Ready
        )
    }

    /// Build the composite key for the replicas table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.agent_id, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaReason {
    Manual,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Syncing,
    InSync,
    Lagging,
}

/// Replica lifecycle. A replica is promoted exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaStatus {
    Provisioning,
    Ready,
    Promoted,
    Abandoned,
}

// ── Pricing ───────────────────────────────────────────────────────

/// Which reporter a raw sample came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReporterRole {
    Primary,
    Replica,
}

impl ReporterRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ReporterRole::Primary => "primary",
            ReporterRole::Replica => "replica",
        }
    }
}

/// One raw pricing observation. Immutable once stored; arrives out of
/// order and may duplicate across reporters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawPriceSample {
    pub pool_id: PoolId,
    pub captured_at: u64,
    pub price: f64,
    pub source: ReporterRole,
    pub agent_id: AgentId,
}

impl RawPriceSample {
    /// Build the composite key for the raw samples table. The identical
    /// tuple maps to the identical key, so re-ingest overwrites itself.
    pub fn table_key(&self) -> String {
        format!(
            "{}:{:020}:{}:{}",
            self.pool_id,
            self.captured_at,
            self.agent_id,
            self.source.as_str()
        )
    }
}

/// One canonical price point, produced only by the consolidator.
/// Exactly one record exists per (pool_id, bucket).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PricePoint {
    pub pool_id: PoolId,
    /// Bucket start, aligned to the configured bucket width.
    pub bucket: u64,
    pub price: f64,
    /// 1.0 for a single measured source, 0.8 for a divergent multi-source
    /// average, below 0.9 and decaying for interpolated points.
    pub confidence: f64,
    pub is_interpolated: bool,
    pub source_count: u32,
}

impl PricePoint {
    /// Build the composite key for the canonical price table.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}", self.pool_id, self.bucket)
    }
}

// ── Commands ──────────────────────────────────────────────────────

/// A unit of work addressed to one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandRecord {
    pub id: CommandId,
    pub agent_id: AgentId,
    pub kind: CommandKind,
    pub payload: serde_json::Value,
    /// Unique idempotency key; re-enqueuing it returns the existing command.
    pub request_id: String,
    pub priority: CommandPriority,
    pub status: CommandStatus,
    pub success: Option<bool>,
    pub error: Option<String>,
    /// State snapshot taken when the command was created, for audit.
    pub pre_state: Option<serde_json::Value>,
    /// State snapshot recorded with the acknowledgement, for audit.
    pub post_state: Option<serde_json::Value>,
    pub created_at: u64,
    pub delivered_at: Option<u64>,
    pub acked_at: Option<u64>,
    pub expires_at: u64,
}

impl CommandRecord {
    /// Build the composite key for the commands table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.agent_id, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    CreateReplica,
    PromoteReplica,
    LaunchInstance,
    TerminateInstance,
    SwitchPool,
}

/// Delivery priority. Lower rank delivers first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandPriority {
    Emergency,
    Scheduled,
    Manual,
}

impl CommandPriority {
    pub fn rank(self) -> u8 {
        match self {
            CommandPriority::Emergency => 0,
            CommandPriority::Scheduled => 1,
            CommandPriority::Manual => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Delivered,
    Executed,
    Expired,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandStatus::Executed | CommandStatus::Expired)
    }
}

// ── Consolidation jobs ────────────────────────────────────────────

/// One consolidator run, tracked for crash-safe resumption.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsolidationJob {
    pub id: String,
    pub started_at: u64,
    pub finished_at: Option<u64>,
    pub status: JobStatus,
    /// Checkpoint: the last bucket successfully consolidated. A resumed
    /// run continues from here, not from the start.
    pub last_bucket: Option<u64>,
    pub buckets_written: u64,
    pub samples_read: u64,
    pub gaps_unfilled: u64,
}

impl ConsolidationJob {
    /// Build the composite key for the jobs table (ordered by start time).
    pub fn table_key(&self) -> String {
        format!("{:020}:{}", self.started_at, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

// ── Agent control ─────────────────────────────────────────────────

/// Per-agent control flags and config delivery state.
///
/// `manual_replica_active` and `auto_emergency_active` are mutually
/// exclusive; both being set is an invariant violation that is detected
/// and alarmed, never silently resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentControl {
    pub agent_id: AgentId,
    pub manual_replica_active: bool,
    pub auto_emergency_active: bool,
    /// The engine config version this agent last acknowledged.
    pub config_version_seen: u64,
    pub version: u64,
    pub updated_at: u64,
}

impl AgentControl {
    pub fn new(agent_id: &str, now: u64) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            manual_replica_active: false,
            auto_emergency_active: false,
            config_version_seen: 0,
            version: 0,
            updated_at: now,
        }
    }
}

// ── Boot stats ────────────────────────────────────────────────────

/// Cached boot-time observation, used to pick the fastest pool when an
/// emergency replica must be created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BootStat {
    pub agent_id: AgentId,
    pub pool_id: PoolId,
    pub boot_seconds: u64,
    pub observed_at: u64,
}

impl BootStat {
    /// Build the composite key for the boot stats table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.agent_id, self.pool_id)
    }
}

// ── Audit trails ──────────────────────────────────────────────────

/// Why a failover/switch action happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverCause {
    TerminationNotice,
    RebalanceNotice,
    CostOptimization,
    Manual,
}

/// One entry in the switch/failover history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailoverEvent {
    pub id: String,
    pub agent_id: AgentId,
    pub instance_logical_id: LogicalId,
    pub cause: FailoverCause,
    /// Human-readable outcome ("promoted replica", "fresh launch", ...).
    pub action: String,
    /// True when the signal was idempotently deduplicated.
    pub deduplicated: bool,
    pub elapsed_ms: u64,
    pub created_at: u64,
}

impl FailoverEvent {
    /// Build the composite key for the failover events table.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}:{}", self.agent_id, self.created_at, self.id)
    }
}

/// One entry per decision gateway call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionAudit {
    pub id: String,
    pub agent_id: AgentId,
    /// Provider name, or "fallback" when the deterministic rule answered.
    pub provider: String,
    pub action: String,
    pub target_pool: Option<PoolId>,
    pub confidence: f64,
    pub est_savings_per_hour: f64,
    pub fell_back: bool,
    pub created_at: u64,
}

impl DecisionAudit {
    /// Build the composite key for the decision audit table.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}:{}", self.agent_id, self.created_at, self.id)
    }
}

// ── Promotion outcome ─────────────────────────────────────────────

/// Result of the atomic promote-and-demote transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct PromotionOutcome {
    /// The former replica, now `Running` + `Primary`.
    pub new_primary: InstanceRecord,
    /// The former primary, now `Zombie`, if one existed.
    pub demoted: Option<InstanceRecord>,
    /// The replica record, now `Promoted`, if one was tracked.
    pub replica: Option<ReplicaRecord>,
}
