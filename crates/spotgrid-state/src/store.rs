//! StateStore — redb-backed state persistence for spotgrid.
//!
//! Provides typed CRUD over every durable record plus the atomic,
//! version-checked operations that make up the engine's concurrency
//! contract: `transition_instance` (compare-and-swap on the version
//! counter), `promote_replica` (the two-row promote/demote transaction),
//! and `insert_command` (idempotent on `request_id`). All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{StateError, StateResult};
use crate::machine::{describe, transition_allowed};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(REPLICAS).map_err(map_err!(Table))?;
        txn.open_table(RAW_PRICE_SAMPLES).map_err(map_err!(Table))?;
        txn.open_table(PRICE_POINTS).map_err(map_err!(Table))?;
        txn.open_table(COMMANDS).map_err(map_err!(Table))?;
        txn.open_table(COMMAND_REQUESTS).map_err(map_err!(Table))?;
        txn.open_table(CONSOLIDATION_JOBS).map_err(map_err!(Table))?;
        txn.open_table(AGENT_CONTROLS).map_err(map_err!(Table))?;
        txn.open_table(BOOT_STATS).map_err(map_err!(Table))?;
        txn.open_table(FAILOVER_EVENTS).map_err(map_err!(Table))?;
        txn.open_table(DECISION_AUDIT).map_err(map_err!(Table))?;
        txn.open_table(ENGINE_CONFIG).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Register a new instance record.
    ///
    /// Rejects a duplicate `logical_id`, and rejects an active primary
    /// when the agent already has one in a non-terminal status.
    pub fn register_instance(&self, record: &InstanceRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let exists = table
                .get(record.logical_id.as_str())
                .map_err(map_err!(Read))?
                .is_some();
            if exists {
                return Err(StateError::AlreadyExists(record.logical_id.clone()));
            }
            if record.is_active_primary()
                && scan_active_primary(&table, &record.agent_id, None)?.is_some()
            {
                return Err(StateError::PrimaryExists(record.agent_id.clone()));
            }
            table
                .insert(record.logical_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(logical_id = %record.logical_id, agent_id = %record.agent_id, "instance registered");
        Ok(())
    }

    /// Get an instance by logical id.
    pub fn get_instance(&self, logical_id: &str) -> StateResult<Option<InstanceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        match table.get(logical_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: InstanceRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all instances.
    pub fn list_instances(&self) -> StateResult<Vec<InstanceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: InstanceRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// List all instances belonging to an agent.
    pub fn instances_for_agent(&self, agent_id: &str) -> StateResult<Vec<InstanceRecord>> {
        Ok(self
            .list_instances()?
            .into_iter()
            .filter(|r| r.agent_id == agent_id)
            .collect())
    }

    /// The agent's current primary in a non-terminal status, if any.
    pub fn active_primary_for_agent(
        &self,
        agent_id: &str,
    ) -> StateResult<Option<InstanceRecord>> {
        Ok(self
            .instances_for_agent(agent_id)?
            .into_iter()
            .find(|r| r.is_active_primary()))
    }

    /// List instances currently in the given lifecycle status.
    pub fn instances_in_status(
        &self,
        status: LifecycleStatus,
    ) -> StateResult<Vec<InstanceRecord>> {
        Ok(self
            .list_instances()?
            .into_iter()
            .filter(|r| r.status == status)
            .collect())
    }

    /// Version-checked lifecycle transition (compare-and-swap).
    ///
    /// The update happens only if the stored version still matches
    /// `expected_version`; a mismatch returns [`StateError::Conflict`]
    /// without mutating the row. Illegal edges return
    /// [`StateError::InvalidTransition`]. Returns the new version.
    pub fn transition_instance(
        &self,
        logical_id: &str,
        expected_version: u64,
        new_status: LifecycleStatus,
        new_role: InstanceRole,
        now: u64,
    ) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let new_version;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let mut record = read_instance(&table, logical_id)?
                .ok_or_else(|| StateError::NotFound(logical_id.to_string()))?;

            if record.version != expected_version {
                return Err(StateError::Conflict {
                    expected: expected_version,
                    actual: record.version,
                });
            }

            let from = (record.status, record.role);
            let to = (new_status, new_role);
            if !transition_allowed(from, to) {
                return Err(StateError::InvalidTransition {
                    from: describe(from),
                    to: describe(to),
                });
            }

            // Becoming the active primary must not produce a second one.
            if new_status == LifecycleStatus::Running
                && new_role == InstanceRole::Primary
                && scan_active_primary(&table, &record.agent_id, Some(logical_id))?.is_some()
            {
                return Err(StateError::PrimaryExists(record.agent_id.clone()));
            }

            apply_transition(&mut record, new_status, new_role, now);
            new_version = record.version;

            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(logical_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            %logical_id,
            status = ?new_status,
            role = ?new_role,
            version = new_version,
            "instance transitioned"
        );
        Ok(new_version)
    }

    /// Version-checked heartbeat update.
    ///
    /// The first heartbeat of a `Launching` instance confirms the launch
    /// and moves it to `Running`. Heartbeats for terminal instances are
    /// rejected as invalid transitions.
    pub fn record_heartbeat(
        &self,
        logical_id: &str,
        expected_version: u64,
        now: u64,
    ) -> StateResult<InstanceRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let mut record = read_instance(&table, logical_id)?
                .ok_or_else(|| StateError::NotFound(logical_id.to_string()))?;

            if record.version != expected_version {
                return Err(StateError::Conflict {
                    expected: expected_version,
                    actual: record.version,
                });
            }
            if record.is_terminal() {
                return Err(StateError::InvalidTransition {
                    from: describe((record.status, record.role)),
                    to: "heartbeat".to_string(),
                });
            }

            if record.status == LifecycleStatus::Launching {
                record.status = LifecycleStatus::Running;
                record.launch_confirmed_at = Some(now);
            }
            record.last_heartbeat_at = Some(now);
            record.updated_at = now;
            record.version += 1;

            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(logical_id, value.as_slice())
                .map_err(map_err!(Write))?;
            updated = record;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    /// Atomically promote a replica instance to primary and demote the
    /// current primary to zombie — one transaction, never two calls.
    ///
    /// The version check applies to the replica instance row. There is no
    /// observable window in which two primaries exist.
    pub fn promote_replica(
        &self,
        agent_id: &str,
        replica_instance_id: &str,
        expected_version: u64,
        now: u64,
    ) -> StateResult<PromotionOutcome> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let mut rising = read_instance(&instances, replica_instance_id)?
                .ok_or_else(|| StateError::NotFound(replica_instance_id.to_string()))?;

            if rising.version != expected_version {
                return Err(StateError::Conflict {
                    expected: expected_version,
                    actual: rising.version,
                });
            }

            let from = (rising.status, rising.role);
            let promotable = matches!(
                from,
                (LifecycleStatus::Running, InstanceRole::Replica)
                    | (LifecycleStatus::Promoting, InstanceRole::Replica)
            );
            if !promotable {
                return Err(StateError::InvalidTransition {
                    from: describe(from),
                    to: describe((LifecycleStatus::Running, InstanceRole::Primary)),
                });
            }

            // Demote the current primary in the same transaction.
            let demoted = match scan_active_primary(
                &instances,
                agent_id,
                Some(replica_instance_id),
            )? {
                Some(mut prior) => {
                    apply_transition(
                        &mut prior,
                        LifecycleStatus::Zombie,
                        InstanceRole::Zombie,
                        now,
                    );
                    let value = serde_json::to_vec(&prior).map_err(map_err!(Serialize))?;
                    instances
                        .insert(prior.logical_id.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                    Some(prior)
                }
                None => None,
            };

            apply_transition(
                &mut rising,
                LifecycleStatus::Running,
                InstanceRole::Primary,
                now,
            );
            let value = serde_json::to_vec(&rising).map_err(map_err!(Serialize))?;
            instances
                .insert(replica_instance_id, value.as_slice())
                .map_err(map_err!(Write))?;
            drop(instances);

            // Mark the tracked replica record as promoted (exactly once).
            let mut replicas = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
            let live = scan_live_replica(&replicas, agent_id)?;
            let replica = match live {
                Some(mut rec) => {
                    rec.status = ReplicaStatus::Promoted;
                    rec.sync_status = SyncStatus::InSync;
                    rec.updated_at = now;
                    rec.version += 1;
                    let value = serde_json::to_vec(&rec).map_err(map_err!(Serialize))?;
                    replicas
                        .insert(rec.table_key().as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                    Some(rec)
                }
                None => None,
            };

            outcome = PromotionOutcome {
                new_primary: rising,
                demoted,
                replica,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            %agent_id,
            new_primary = %outcome.new_primary.logical_id,
            demoted = ?outcome.demoted.as_ref().map(|d| d.logical_id.clone()),
            "replica promoted"
        );
        Ok(outcome)
    }

    // ── Replicas ───────────────────────────────────────────────────

    /// Insert a replica record. Rejects a second live replica per agent.
    pub fn insert_replica(&self, replica: &ReplicaRecord) -> StateResult<()> {
        let value = serde_json::to_vec(replica).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
            if replica.is_live() && scan_live_replica(&table, &replica.agent_id)?.is_some() {
                return Err(StateError::ReplicaExists(replica.agent_id.clone()));
            }
            table
                .insert(replica.table_key().as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(agent_id = %replica.agent_id, replica_id = %replica.id, "replica recorded");
        Ok(())
    }

    /// The agent's live (provisioning or ready) replica, if any.
    pub fn live_replica_for_agent(&self, agent_id: &str) -> StateResult<Option<ReplicaRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
        scan_live_replica(&table, agent_id)
    }

    /// Version-checked replica update.
    pub fn update_replica(
        &self,
        replica: &ReplicaRecord,
        expected_version: u64,
        now: u64,
    ) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let new_version;
        {
            let mut table = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
            let key = replica.table_key();
            let current: ReplicaRecord = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(key)),
            };
            if current.version != expected_version {
                return Err(StateError::Conflict {
                    expected: expected_version,
                    actual: current.version,
                });
            }
            let mut updated = replica.clone();
            updated.version = expected_version + 1;
            updated.updated_at = now;
            new_version = updated.version;
            let value = serde_json::to_vec(&updated).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(new_version)
    }

    // ── Raw pricing tier ───────────────────────────────────────────

    /// Append a raw price sample. Re-ingesting the identical tuple maps
    /// to the same key and overwrites itself.
    pub fn append_raw_sample(&self, sample: &RawPriceSample) -> StateResult<()> {
        let key = sample.table_key();
        let value = serde_json::to_vec(sample).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RAW_PRICE_SAMPLES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Raw samples for a pool with `captured_at` in `[from, to)`.
    pub fn list_raw_samples(
        &self,
        pool_id: &str,
        from: u64,
        to: u64,
    ) -> StateResult<Vec<RawPriceSample>> {
        let prefix = format!("{pool_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RAW_PRICE_SAMPLES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let sample: RawPriceSample =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if sample.captured_at >= from && sample.captured_at < to {
                    results.push(sample);
                }
            }
        }
        Ok(results)
    }

    /// Earliest raw sample timestamp for a pool, if any samples exist.
    pub fn earliest_raw_sample_at(&self, pool_id: &str) -> StateResult<Option<u64>> {
        let prefix = format!("{pool_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RAW_PRICE_SAMPLES).map_err(map_err!(Table))?;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let sample: RawPriceSample =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                return Ok(Some(sample.captured_at));
            }
        }
        Ok(None)
    }

    /// All pool ids present in the raw tier.
    pub fn raw_sample_pools(&self) -> StateResult<Vec<PoolId>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RAW_PRICE_SAMPLES).map_err(map_err!(Table))?;
        let mut pools: Vec<PoolId> = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let sample: RawPriceSample =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if !pools.contains(&sample.pool_id) {
                pools.push(sample.pool_id);
            }
        }
        Ok(pools)
    }

    // ── Canonical pricing tier ─────────────────────────────────────

    /// Upsert a canonical price point (replace-on-conflict, keyed by
    /// pool + bucket). Written only by the consolidator.
    pub fn upsert_price_point(&self, point: &PricePoint) -> StateResult<()> {
        let key = point.table_key();
        let value = serde_json::to_vec(point).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PRICE_POINTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get the canonical point for a (pool, bucket), if consolidated.
    pub fn get_price_point(&self, pool_id: &str, bucket: u64) -> StateResult<Option<PricePoint>> {
        let key = format!("{pool_id}:{bucket:020}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PRICE_POINTS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let point: PricePoint =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(point))
            }
            None => Ok(None),
        }
    }

    /// Canonical points for a pool with bucket in `[from, to)`, ascending.
    pub fn list_price_points(
        &self,
        pool_id: &str,
        from: u64,
        to: u64,
    ) -> StateResult<Vec<PricePoint>> {
        let prefix = format!("{pool_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PRICE_POINTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let point: PricePoint =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if point.bucket >= from && point.bucket < to {
                    results.push(point);
                }
            }
        }
        Ok(results)
    }

    /// The most recent canonical point for a pool, if any.
    pub fn latest_price_point(&self, pool_id: &str) -> StateResult<Option<PricePoint>> {
        let prefix = format!("{pool_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PRICE_POINTS).map_err(map_err!(Table))?;
        let mut latest = None;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let point: PricePoint =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                latest = Some(point);
            }
        }
        Ok(latest)
    }

    // ── Commands ───────────────────────────────────────────────────

    /// Insert a command, idempotent on `request_id`.
    ///
    /// The `command_requests` index is checked and written in the same
    /// transaction — re-enqueueing a request id returns the existing
    /// command without creating a second row. Returns `(command, deduped)`.
    pub fn insert_command(&self, cmd: &CommandRecord) -> StateResult<(CommandRecord, bool)> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result;
        {
            let mut requests = txn.open_table(COMMAND_REQUESTS).map_err(map_err!(Table))?;
            let existing_key: Option<String> = requests
                .get(cmd.request_id.as_str())
                .map_err(map_err!(Read))?
                .map(|g| g.value().to_string());

            let mut commands = txn.open_table(COMMANDS).map_err(map_err!(Table))?;
            match existing_key {
                Some(key) => {
                    let record: CommandRecord =
                        match commands.get(key.as_str()).map_err(map_err!(Read))? {
                            Some(guard) => serde_json::from_slice(guard.value())
                                .map_err(map_err!(Deserialize))?,
                            None => return Err(StateError::NotFound(key)),
                        };
                    result = (record, true);
                }
                None => {
                    let key = cmd.table_key();
                    let value = serde_json::to_vec(cmd).map_err(map_err!(Serialize))?;
                    commands
                        .insert(key.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                    requests
                        .insert(cmd.request_id.as_str(), key.as_str())
                        .map_err(map_err!(Write))?;
                    result = (cmd.clone(), false);
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }

    /// Get a command by id (scans the agent-keyed table).
    pub fn get_command(&self, command_id: &str) -> StateResult<Option<CommandRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(COMMANDS).map_err(map_err!(Table))?;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: CommandRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if record.id == command_id {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Atomically take the agent's pending commands and mark them
    /// delivered. Returned in priority order (emergency first, FIFO
    /// within a class). Concurrent polls cannot double-deliver.
    pub fn pop_pending_commands(
        &self,
        agent_id: &str,
        now: u64,
    ) -> StateResult<Vec<CommandRecord>> {
        let prefix = format!("{agent_id}:");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut delivered = Vec::new();
        {
            let mut table = txn.open_table(COMMANDS).map_err(map_err!(Table))?;
            let mut pending = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                if key.value().starts_with(&prefix) {
                    let record: CommandRecord =
                        serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                    if record.status == CommandStatus::Pending && record.expires_at > now {
                        pending.push(record);
                    }
                }
            }
            for mut record in pending {
                record.status = CommandStatus::Delivered;
                record.delivered_at = Some(now);
                let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                table
                    .insert(record.table_key().as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                delivered.push(record);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        delivered.sort_by_key(|c| (c.priority.rank(), c.created_at, c.id.clone()));
        Ok(delivered)
    }

    /// Acknowledge a command outcome. Idempotent: a command already in a
    /// terminal status is returned unchanged with `newly_acked = false`.
    pub fn ack_command(
        &self,
        command_id: &str,
        success: bool,
        error: Option<String>,
        post_state: Option<serde_json::Value>,
        now: u64,
    ) -> StateResult<(CommandRecord, bool)> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result;
        {
            let mut table = txn.open_table(COMMANDS).map_err(map_err!(Table))?;
            let mut found: Option<CommandRecord> = None;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let record: CommandRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if record.id == command_id {
                    found = Some(record);
                    break;
                }
            }
            let mut record =
                found.ok_or_else(|| StateError::NotFound(command_id.to_string()))?;

            if record.status.is_terminal() {
                result = (record, false);
            } else {
                record.status = CommandStatus::Executed;
                record.success = Some(success);
                record.error = error;
                record.post_state = post_state;
                record.acked_at = Some(now);
                let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                table
                    .insert(record.table_key().as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                result = (record, true);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }

    /// Expire commands unacknowledged past their deadline. Returns the
    /// commands expired by this sweep, for operator attention.
    pub fn expire_commands(&self, now: u64) -> StateResult<Vec<CommandRecord>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut expired = Vec::new();
        {
            let mut table = txn.open_table(COMMANDS).map_err(map_err!(Table))?;
            let mut stale = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let record: CommandRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if !record.status.is_terminal() && record.expires_at <= now {
                    stale.push(record);
                }
            }
            for mut record in stale {
                record.status = CommandStatus::Expired;
                let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                table
                    .insert(record.table_key().as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                expired.push(record);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(expired)
    }

    /// All commands currently in the `Expired` status.
    pub fn list_expired_commands(&self) -> StateResult<Vec<CommandRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(COMMANDS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: CommandRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if record.status == CommandStatus::Expired {
                results.push(record);
            }
        }
        Ok(results)
    }

    // ── Consolidation jobs ─────────────────────────────────────────

    /// Insert or update a consolidation job record.
    pub fn put_job(&self, job: &ConsolidationJob) -> StateResult<()> {
        let key = job.table_key();
        let value = serde_json::to_vec(job).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CONSOLIDATION_JOBS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// The most recently started job, if any (keys are start-time ordered).
    pub fn latest_job(&self) -> StateResult<Option<ConsolidationJob>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CONSOLIDATION_JOBS).map_err(map_err!(Table))?;
        let mut latest = None;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let job: ConsolidationJob =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            latest = Some(job);
        }
        Ok(latest)
    }

    // ── Agent controls ─────────────────────────────────────────────

    /// Get the control row for an agent.
    pub fn get_agent_control(&self, agent_id: &str) -> StateResult<Option<AgentControl>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AGENT_CONTROLS).map_err(map_err!(Table))?;
        match table.get(agent_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let control: AgentControl =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(control))
            }
            None => Ok(None),
        }
    }

    /// Version-checked agent control update. Creating a row requires
    /// `expected_version = 0` and no existing row.
    pub fn put_agent_control(
        &self,
        control: &AgentControl,
        expected_version: u64,
        now: u64,
    ) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let new_version;
        {
            let mut table = txn.open_table(AGENT_CONTROLS).map_err(map_err!(Table))?;
            let current: Option<AgentControl> =
                match table.get(control.agent_id.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => Some(
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                    ),
                    None => None,
                };
            match current {
                Some(existing) if existing.version != expected_version => {
                    return Err(StateError::Conflict {
                        expected: expected_version,
                        actual: existing.version,
                    });
                }
                None if expected_version != 0 => {
                    return Err(StateError::NotFound(control.agent_id.clone()));
                }
                _ => {}
            }
            let mut updated = control.clone();
            updated.version = expected_version + 1;
            updated.updated_at = now;
            new_version = updated.version;
            let value = serde_json::to_vec(&updated).map_err(map_err!(Serialize))?;
            table
                .insert(control.agent_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(new_version)
    }

    // ── Boot stats ─────────────────────────────────────────────────

    /// Upsert a boot-time observation (newest wins).
    pub fn upsert_boot_stat(&self, stat: &BootStat) -> StateResult<()> {
        let key = stat.table_key();
        let value = serde_json::to_vec(stat).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(BOOT_STATS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// The pool with the fastest observed boot for an agent, if any.
    pub fn fastest_pool_for_agent(&self, agent_id: &str) -> StateResult<Option<BootStat>> {
        let prefix = format!("{agent_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BOOT_STATS).map_err(map_err!(Table))?;
        let mut fastest: Option<BootStat> = None;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let stat: BootStat =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                let faster = fastest
                    .as_ref()
                    .is_none_or(|f| stat.boot_seconds < f.boot_seconds);
                if faster {
                    fastest = Some(stat);
                }
            }
        }
        Ok(fastest)
    }

    // ── Audit trails ───────────────────────────────────────────────

    /// Append a failover history event.
    pub fn append_failover_event(&self, event: &FailoverEvent) -> StateResult<()> {
        let key = event.table_key();
        let value = serde_json::to_vec(event).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(FAILOVER_EVENTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Failover history for an agent, oldest first.
    pub fn list_failover_events(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> StateResult<Vec<FailoverEvent>> {
        let prefix = format!("{agent_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(FAILOVER_EVENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let event: FailoverEvent =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(event);
                if results.len() >= limit {
                    break;
                }
            }
        }
        Ok(results)
    }

    /// Append a decision audit entry.
    pub fn append_decision_audit(&self, audit: &DecisionAudit) -> StateResult<()> {
        let key = audit.table_key();
        let value = serde_json::to_vec(audit).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DECISION_AUDIT).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Decision audit entries for an agent, oldest first.
    pub fn list_decision_audit(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> StateResult<Vec<DecisionAudit>> {
        let prefix = format!("{agent_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DECISION_AUDIT).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let audit: DecisionAudit =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(audit);
                if results.len() >= limit {
                    break;
                }
            }
        }
        Ok(results)
    }

    // ── Engine config ──────────────────────────────────────────────

    /// The persisted engine config, if one has been stored.
    pub fn get_engine_config(&self) -> StateResult<Option<EngineConfig>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENGINE_CONFIG).map_err(map_err!(Table))?;
        match table.get("engine").map_err(map_err!(Read))? {
            Some(guard) => {
                let cfg: EngineConfig =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(cfg))
            }
            None => Ok(None),
        }
    }

    /// Persist the engine config.
    pub fn put_engine_config(&self, cfg: &EngineConfig) -> StateResult<()> {
        let value = serde_json::to_vec(cfg).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ENGINE_CONFIG).map_err(map_err!(Table))?;
            table
                .insert("engine", value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

// ── Transaction-scoped helpers ─────────────────────────────────────

fn read_instance(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    logical_id: &str,
) -> StateResult<Option<InstanceRecord>> {
    match table.get(logical_id).map_err(map_err!(Read))? {
        Some(guard) => {
            let record: InstanceRecord =
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

/// Scan for the agent's active primary inside a transaction, optionally
/// excluding one logical id.
fn scan_active_primary(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    agent_id: &str,
    exclude: Option<&str>,
) -> StateResult<Option<InstanceRecord>> {
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let record: InstanceRecord =
            serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        if record.agent_id == agent_id
            && record.is_active_primary()
            && exclude != Some(record.logical_id.as_str())
        {
            return Ok(Some(record));
        }
    }
    Ok(None)
}

/// Scan for the agent's live replica inside a transaction.
fn scan_live_replica(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    agent_id: &str,
) -> StateResult<Option<ReplicaRecord>> {
    let prefix = format!("{agent_id}:");
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(&prefix) {
            let record: ReplicaRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if record.is_live() {
                return Ok(Some(record));
            }
        }
    }
    Ok(None)
}

/// Apply a validated transition to a record: status, role, lifecycle
/// timestamps, version bump.
fn apply_transition(
    record: &mut InstanceRecord,
    new_status: LifecycleStatus,
    new_role: InstanceRole,
    now: u64,
) {
    if record.status == LifecycleStatus::Launching && new_status == LifecycleStatus::Running {
        record.launch_confirmed_at = Some(now);
    }
    if new_status == LifecycleStatus::Terminating && record.termination_requested_at.is_none() {
        record.termination_requested_at = Some(now);
    }
    if new_status == LifecycleStatus::Terminated {
        record.termination_confirmed_at = Some(now);
    }
    record.status = new_status;
    record.role = new_role;
    record.updated_at = now;
    record.version += 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_instance(logical_id: &str, agent_id: &str, role: InstanceRole) -> InstanceRecord {
        InstanceRecord {
            logical_id: logical_id.to_string(),
            provider_id: format!("i-{logical_id}"),
            agent_id: agent_id.to_string(),
            role,
            status: LifecycleStatus::Launching,
            mode: CapacityMode::Discounted,
            pool_id: "m5.large/us-east-1a".to_string(),
            version: 0,
            launch_requested_at: 1000,
            launch_confirmed_at: None,
            termination_requested_at: None,
            termination_confirmed_at: None,
            last_heartbeat_at: None,
            updated_at: 1000,
            pool_entered_at: 1000,
        }
    }

    fn running(mut record: InstanceRecord) -> InstanceRecord {
        record.status = LifecycleStatus::Running;
        record.launch_confirmed_at = Some(1010);
        record
    }

    fn test_replica(agent_id: &str, id: &str) -> ReplicaRecord {
        ReplicaRecord {
            id: id.to_string(),
            agent_id: agent_id.to_string(),
            instance_logical_id: None,
            pool_id: "m5.large/us-east-1b".to_string(),
            creation_reason: ReplicaReason::Emergency,
            sync_status: SyncStatus::Pending,
            boot_time_seconds: None,
            request_id: format!("req-{id}"),
            status: ReplicaStatus::Provisioning,
            version: 0,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_command(agent_id: &str, id: &str, request_id: &str) -> CommandRecord {
        CommandRecord {
            id: id.to_string(),
            agent_id: agent_id.to_string(),
            kind: CommandKind::CreateReplica,
            payload: serde_json::json!({"pool_id": "m5.large/us-east-1b"}),
            request_id: request_id.to_string(),
            priority: CommandPriority::Emergency,
            status: CommandStatus::Pending,
            success: None,
            error: None,
            pre_state: None,
            post_state: None,
            created_at: 1000,
            delivered_at: None,
            acked_at: None,
            expires_at: 2000,
        }
    }

    // ── Instance lifecycle ─────────────────────────────────────────

    #[test]
    fn register_and_get_instance() {
        let store = StateStore::open_in_memory().unwrap();
        let inst = test_instance("lg-1", "agent-1", InstanceRole::Primary);

        store.register_instance(&inst).unwrap();
        let retrieved = store.get_instance("lg-1").unwrap();

        assert_eq!(retrieved, Some(inst));
    }

    #[test]
    fn register_duplicate_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let inst = test_instance("lg-1", "agent-1", InstanceRole::Primary);

        store.register_instance(&inst).unwrap();
        let err = store.register_instance(&inst).unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));
    }

    #[test]
    fn second_active_primary_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .register_instance(&running(test_instance("lg-1", "agent-1", InstanceRole::Primary)))
            .unwrap();

        let second = running(test_instance("lg-2", "agent-1", InstanceRole::Primary));
        let err = store.register_instance(&second).unwrap_err();
        assert!(matches!(err, StateError::PrimaryExists(_)));

        // A replica for the same agent is fine.
        store
            .register_instance(&test_instance("lg-3", "agent-1", InstanceRole::Replica))
            .unwrap();
    }

    #[test]
    fn transition_happy_path_bumps_version() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .register_instance(&test_instance("lg-1", "agent-1", InstanceRole::Primary))
            .unwrap();

        let v = store
            .transition_instance("lg-1", 0, LifecycleStatus::Running, InstanceRole::Primary, 1010)
            .unwrap();
        assert_eq!(v, 1);

        let inst = store.get_instance("lg-1").unwrap().unwrap();
        assert_eq!(inst.status, LifecycleStatus::Running);
        assert_eq!(inst.launch_confirmed_at, Some(1010));
        assert_eq!(inst.launch_duration_seconds(), Some(10));
    }

    #[test]
    fn transition_with_stale_version_conflicts_without_mutation() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .register_instance(&test_instance("lg-1", "agent-1", InstanceRole::Primary))
            .unwrap();
        store
            .transition_instance("lg-1", 0, LifecycleStatus::Running, InstanceRole::Primary, 1010)
            .unwrap();

        // Second caller still holds version 0.
        let err = store
            .transition_instance("lg-1", 0, LifecycleStatus::Zombie, InstanceRole::Zombie, 1020)
            .unwrap_err();
        assert!(matches!(err, StateError::Conflict { expected: 0, actual: 1 }));

        // Row untouched by the losing call.
        let inst = store.get_instance("lg-1").unwrap().unwrap();
        assert_eq!(inst.status, LifecycleStatus::Running);
        assert_eq!(inst.version, 1);
    }

    #[test]
    fn concurrent_cas_exactly_one_winner() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .register_instance(&running(test_instance("lg-1", "agent-1", InstanceRole::Primary)))
            .unwrap();

        // Both callers observed version 0; the store serializes them.
        let first = store.transition_instance(
            "lg-1",
            0,
            LifecycleStatus::Zombie,
            InstanceRole::Zombie,
            1020,
        );
        let second = store.transition_instance(
            "lg-1",
            0,
            LifecycleStatus::Terminating,
            InstanceRole::Primary,
            1021,
        );

        assert!(first.is_ok());
        assert!(matches!(second, Err(StateError::Conflict { .. })));
        let inst = store.get_instance("lg-1").unwrap().unwrap();
        assert_eq!(inst.status, LifecycleStatus::Zombie);
        assert_eq!(inst.version, 1);
    }

    #[test]
    fn invalid_transition_rejected_without_mutation() {
        let store = StateStore::open_in_memory().unwrap();
        let mut inst = test_instance("lg-1", "agent-1", InstanceRole::Zombie);
        inst.status = LifecycleStatus::Zombie;
        store.register_instance(&inst).unwrap();

        let err = store
            .transition_instance("lg-1", 0, LifecycleStatus::Running, InstanceRole::Primary, 1020)
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));

        let stored = store.get_instance("lg-1").unwrap().unwrap();
        assert_eq!(stored.version, 0);
    }

    #[test]
    fn zombie_lifecycle_reaches_terminated() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .register_instance(&running(test_instance("lg-1", "agent-1", InstanceRole::Primary)))
            .unwrap();

        store
            .transition_instance("lg-1", 0, LifecycleStatus::Zombie, InstanceRole::Zombie, 2000)
            .unwrap();
        store
            .transition_instance("lg-1", 1, LifecycleStatus::Terminating, InstanceRole::Zombie, 2010)
            .unwrap();
        store
            .transition_instance("lg-1", 2, LifecycleStatus::Terminated, InstanceRole::Zombie, 2050)
            .unwrap();

        let inst = store.get_instance("lg-1").unwrap().unwrap();
        assert!(inst.is_terminal());
        assert_eq!(inst.termination_duration_seconds(), Some(40));
    }

    #[test]
    fn heartbeat_confirms_launch_and_bumps_version() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .register_instance(&test_instance("lg-1", "agent-1", InstanceRole::Primary))
            .unwrap();

        let inst = store.record_heartbeat("lg-1", 0, 1030).unwrap();
        assert_eq!(inst.status, LifecycleStatus::Running);
        assert_eq!(inst.last_heartbeat_at, Some(1030));
        assert_eq!(inst.version, 1);

        // Stale heartbeat loses the race.
        let err = store.record_heartbeat("lg-1", 0, 1040).unwrap_err();
        assert!(matches!(err, StateError::Conflict { .. }));
    }

    // ── Promotion ──────────────────────────────────────────────────

    #[test]
    fn promote_replica_demotes_primary_atomically() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .register_instance(&running(test_instance("lg-p", "agent-1", InstanceRole::Primary)))
            .unwrap();
        store
            .register_instance(&running(test_instance("lg-r", "agent-1", InstanceRole::Replica)))
            .unwrap();
        let mut replica = test_replica("agent-1", "rep-1");
        replica.instance_logical_id = Some("lg-r".to_string());
        replica.status = ReplicaStatus::Ready;
        store.insert_replica(&replica).unwrap();

        let outcome = store.promote_replica("agent-1", "lg-r", 0, 3000).unwrap();

        assert_eq!(outcome.new_primary.role, InstanceRole::Primary);
        assert_eq!(outcome.new_primary.status, LifecycleStatus::Running);
        let demoted = outcome.demoted.unwrap();
        assert_eq!(demoted.logical_id, "lg-p");
        assert_eq!(demoted.role, InstanceRole::Zombie);
        assert_eq!(outcome.replica.unwrap().status, ReplicaStatus::Promoted);

        // Single-primary invariant holds after the transaction.
        let primaries: Vec<_> = store
            .instances_for_agent("agent-1")
            .unwrap()
            .into_iter()
            .filter(|r| r.is_active_primary())
            .collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].logical_id, "lg-r");
    }

    #[test]
    fn promote_with_stale_version_conflicts() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .register_instance(&running(test_instance("lg-r", "agent-1", InstanceRole::Replica)))
            .unwrap();
        store.record_heartbeat("lg-r", 0, 1030).unwrap();

        let err = store.promote_replica("agent-1", "lg-r", 0, 3000).unwrap_err();
        assert!(matches!(err, StateError::Conflict { .. }));
    }

    #[test]
    fn promote_terminated_instance_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let mut inst = test_instance("lg-r", "agent-1", InstanceRole::Replica);
        inst.status = LifecycleStatus::Terminated;
        store.register_instance(&inst).unwrap();

        let err = store.promote_replica("agent-1", "lg-r", 0, 3000).unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
    }

    #[test]
    fn promote_without_prior_primary_still_succeeds() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .register_instance(&running(test_instance("lg-r", "agent-1", InstanceRole::Replica)))
            .unwrap();

        let outcome = store.promote_replica("agent-1", "lg-r", 0, 3000).unwrap();
        assert!(outcome.demoted.is_none());
        assert_eq!(outcome.new_primary.role, InstanceRole::Primary);
    }

    // ── Replicas ───────────────────────────────────────────────────

    #[test]
    fn second_live_replica_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_replica(&test_replica("agent-1", "rep-1")).unwrap();

        let err = store
            .insert_replica(&test_replica("agent-1", "rep-2"))
            .unwrap_err();
        assert!(matches!(err, StateError::ReplicaExists(_)));

        // A different agent is unaffected.
        store.insert_replica(&test_replica("agent-2", "rep-3")).unwrap();
    }

    #[test]
    fn promoted_replica_frees_the_slot() {
        let store = StateStore::open_in_memory().unwrap();
        let mut replica = test_replica("agent-1", "rep-1");
        replica.status = ReplicaStatus::Promoted;
        store.insert_replica(&replica).unwrap();

        assert!(store.live_replica_for_agent("agent-1").unwrap().is_none());
        store.insert_replica(&test_replica("agent-1", "rep-2")).unwrap();
    }

    // ── Commands ───────────────────────────────────────────────────

    #[test]
    fn insert_command_idempotent_on_request_id() {
        let store = StateStore::open_in_memory().unwrap();
        let cmd = test_command("agent-1", "cmd-1", "req-A");

        let (first, deduped) = store.insert_command(&cmd).unwrap();
        assert!(!deduped);
        assert_eq!(first.id, "cmd-1");

        // Same request id, different command id: no second row.
        let retry = test_command("agent-1", "cmd-2", "req-A");
        let (second, deduped) = store.insert_command(&retry).unwrap();
        assert!(deduped);
        assert_eq!(second.id, "cmd-1");

        let pending = store.pop_pending_commands("agent-1", 1500).unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn pop_orders_by_priority_then_age() {
        let store = StateStore::open_in_memory().unwrap();
        let mut manual = test_command("agent-1", "cmd-m", "req-m");
        manual.priority = CommandPriority::Manual;
        manual.created_at = 900;
        let mut scheduled = test_command("agent-1", "cmd-s", "req-s");
        scheduled.priority = CommandPriority::Scheduled;
        let emergency = test_command("agent-1", "cmd-e", "req-e");

        store.insert_command(&manual).unwrap();
        store.insert_command(&scheduled).unwrap();
        store.insert_command(&emergency).unwrap();

        let popped = store.pop_pending_commands("agent-1", 1500).unwrap();
        let ids: Vec<_> = popped.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["cmd-e", "cmd-s", "cmd-m"]);
        assert!(popped.iter().all(|c| c.status == CommandStatus::Delivered));

        // Second poll delivers nothing.
        assert!(store.pop_pending_commands("agent-1", 1500).unwrap().is_empty());
    }

    #[test]
    fn ack_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_command(&test_command("agent-1", "cmd-1", "req-A")).unwrap();
        store.pop_pending_commands("agent-1", 1500).unwrap();

        let (acked, newly) = store
            .ack_command("cmd-1", true, None, Some(serde_json::json!({"ok": true})), 1600)
            .unwrap();
        assert!(newly);
        assert_eq!(acked.status, CommandStatus::Executed);
        assert_eq!(acked.success, Some(true));

        let (again, newly) = store.ack_command("cmd-1", false, None, None, 1700).unwrap();
        assert!(!newly);
        // First outcome preserved.
        assert_eq!(again.success, Some(true));
        assert_eq!(again.acked_at, Some(1600));
    }

    #[test]
    fn expiry_surfaces_unacked_commands() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_command(&test_command("agent-1", "cmd-1", "req-A")).unwrap();

        // Not yet expired.
        assert!(store.expire_commands(1500).unwrap().is_empty());

        let expired = store.expire_commands(2000).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, CommandStatus::Expired);
        assert_eq!(store.list_expired_commands().unwrap().len(), 1);

        // Expired commands are not delivered or re-expired.
        assert!(store.pop_pending_commands("agent-1", 2100).unwrap().is_empty());
        assert!(store.expire_commands(2100).unwrap().is_empty());
    }

    // ── Pricing tiers ──────────────────────────────────────────────

    #[test]
    fn raw_samples_roundtrip_and_range_scan() {
        let store = StateStore::open_in_memory().unwrap();
        for (ts, price, source) in [
            (1000, 0.05, ReporterRole::Primary),
            (1000, 0.07, ReporterRole::Replica),
            (1300, 0.06, ReporterRole::Primary),
        ] {
            store
                .append_raw_sample(&RawPriceSample {
                    pool_id: "m5.large/us-east-1a".to_string(),
                    captured_at: ts,
                    price,
                    source,
                    agent_id: "agent-1".to_string(),
                })
                .unwrap();
        }

        let bucket = store.list_raw_samples("m5.large/us-east-1a", 1000, 1300).unwrap();
        assert_eq!(bucket.len(), 2);
        assert_eq!(store.earliest_raw_sample_at("m5.large/us-east-1a").unwrap(), Some(1000));
        assert_eq!(store.raw_sample_pools().unwrap().len(), 1);
    }

    #[test]
    fn duplicate_raw_sample_overwrites_itself() {
        let store = StateStore::open_in_memory().unwrap();
        let sample = RawPriceSample {
            pool_id: "m5.large/us-east-1a".to_string(),
            captured_at: 1000,
            price: 0.05,
            source: ReporterRole::Primary,
            agent_id: "agent-1".to_string(),
        };
        store.append_raw_sample(&sample).unwrap();
        store.append_raw_sample(&sample).unwrap();

        assert_eq!(
            store.list_raw_samples("m5.large/us-east-1a", 0, 2000).unwrap().len(),
            1
        );
    }

    #[test]
    fn price_point_upsert_replaces() {
        let store = StateStore::open_in_memory().unwrap();
        let mut point = PricePoint {
            pool_id: "m5.large/us-east-1a".to_string(),
            bucket: 1200,
            price: 0.06,
            confidence: 0.8,
            is_interpolated: false,
            source_count: 2,
        };
        store.upsert_price_point(&point).unwrap();

        point.price = 0.061;
        store.upsert_price_point(&point).unwrap();

        let stored = store.get_price_point("m5.large/us-east-1a", 1200).unwrap().unwrap();
        assert_eq!(stored.price, 0.061);
        assert_eq!(
            store.list_price_points("m5.large/us-east-1a", 0, 9999).unwrap().len(),
            1
        );
    }

    // ── Jobs, controls, boot stats ─────────────────────────────────

    #[test]
    fn latest_job_is_most_recently_started() {
        let store = StateStore::open_in_memory().unwrap();
        for (id, started) in [("job-a", 1000), ("job-b", 2000)] {
            store
                .put_job(&ConsolidationJob {
                    id: id.to_string(),
                    started_at: started,
                    finished_at: None,
                    status: JobStatus::Running,
                    last_bucket: None,
                    buckets_written: 0,
                    samples_read: 0,
                    gaps_unfilled: 0,
                })
                .unwrap();
        }
        assert_eq!(store.latest_job().unwrap().unwrap().id, "job-b");
    }

    #[test]
    fn agent_control_cas() {
        let store = StateStore::open_in_memory().unwrap();
        let control = AgentControl::new("agent-1", 1000);

        let v = store.put_agent_control(&control, 0, 1000).unwrap();
        assert_eq!(v, 1);

        // Stale write loses.
        let err = store.put_agent_control(&control, 0, 1100).unwrap_err();
        assert!(matches!(err, StateError::Conflict { .. }));

        let mut updated = store.get_agent_control("agent-1").unwrap().unwrap();
        updated.auto_emergency_active = true;
        let v = store.put_agent_control(&updated, 1, 1200).unwrap();
        assert_eq!(v, 2);
    }

    #[test]
    fn fastest_pool_picks_minimum_boot_time() {
        let store = StateStore::open_in_memory().unwrap();
        for (pool, secs) in [("pool-a", 90), ("pool-b", 45), ("pool-c", 120)] {
            store
                .upsert_boot_stat(&BootStat {
                    agent_id: "agent-1".to_string(),
                    pool_id: pool.to_string(),
                    boot_seconds: secs,
                    observed_at: 1000,
                })
                .unwrap();
        }

        let fastest = store.fastest_pool_for_agent("agent-1").unwrap().unwrap();
        assert_eq!(fastest.pool_id, "pool-b");
        assert!(store.fastest_pool_for_agent("agent-9").unwrap().is_none());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store
                .register_instance(&test_instance("lg-1", "agent-1", InstanceRole::Primary))
                .unwrap();
            store
                .put_engine_config(&EngineConfig::default())
                .unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_instance("lg-1").unwrap().is_some());
        assert!(store.get_engine_config().unwrap().is_some());
    }

    // ── Edge cases ─────────────────────────────────────────────────

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_instances().unwrap().is_empty());
        assert!(store.active_primary_for_agent("any").unwrap().is_none());
        assert!(store.live_replica_for_agent("any").unwrap().is_none());
        assert!(store.latest_job().unwrap().is_none());
        assert!(store.get_engine_config().unwrap().is_none());
        assert!(store.latest_price_point("any").unwrap().is_none());
        assert!(store.get_command("any").unwrap().is_none());
    }
}
