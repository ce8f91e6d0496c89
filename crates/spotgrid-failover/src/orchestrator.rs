//! The failover orchestrator.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use spotgrid_queue::{CommandQueue, derive_request_id};
use spotgrid_state::{
    AgentControl, CommandKind, CommandPriority, CommandRecord, FailoverCause, FailoverEvent,
    FailoverSettings, InstanceRole, LifecycleStatus, ReplicaReason, ReplicaRecord, ReplicaStatus,
    StateError, StateResult, StateStore, SyncStatus,
};

use crate::notifier::{FailoverNotification, Notifier};

/// Orchestrator tunables, lifted from the engine config.
#[derive(Debug, Clone)]
pub struct FailoverOptions {
    /// Hard budget from termination notice to completed promotion.
    pub promotion_budget_ms: u64,
    /// Pool used when no boot observation is cached, and for best-effort
    /// fresh launches.
    pub fallback_stable_pool: String,
}

impl From<&FailoverSettings> for FailoverOptions {
    fn from(cfg: &FailoverSettings) -> Self {
        Self {
            promotion_budget_ms: cfg.promotion_budget_ms,
            fallback_stable_pool: cfg.fallback_stable_pool.clone(),
        }
    }
}

/// What a signal handler did.
#[derive(Debug, Clone, PartialEq)]
pub enum FailoverOutcome {
    /// An emergency replica was requested in the given pool.
    ReplicaRequested { pool_id: String },
    /// A replica is already provisioning; the signal was deduplicated.
    AlreadyProvisioning,
    /// A ready replica was promoted to primary.
    Promoted {
        new_primary: String,
        demoted: Option<String>,
        elapsed_ms: u64,
    },
    /// No replica existed; a best-effort fresh launch was enqueued.
    FreshLaunch { pool_id: String },
}

/// Drives replica creation and promotion off interruption signals.
pub struct FailoverOrchestrator {
    store: StateStore,
    queue: CommandQueue,
    opts: FailoverOptions,
    notifier: Arc<dyn Notifier>,
}

impl FailoverOrchestrator {
    pub fn new(
        store: StateStore,
        queue: CommandQueue,
        opts: FailoverOptions,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            queue,
            opts,
            notifier,
        }
    }

    // ── Interruption signals ───────────────────────────────────────

    /// Soft warning: make sure a standby replica exists.
    ///
    /// Idempotent end to end — a second notice while a replica is
    /// already launching is a no-op, recorded as deduplicated.
    pub fn handle_rebalance(
        &self,
        agent_id: &str,
        instance_id: &str,
        now: u64,
    ) -> StateResult<FailoverOutcome> {
        let started = Instant::now();

        if self.store.live_replica_for_agent(agent_id)?.is_some() {
            debug!(%agent_id, "rebalance notice deduplicated, replica already live");
            self.record_event(
                agent_id,
                instance_id,
                FailoverCause::RebalanceNotice,
                "replica already provisioning",
                true,
                elapsed_ms(started),
                now,
            )?;
            return Ok(FailoverOutcome::AlreadyProvisioning);
        }

        // Fastest-booting pool from cached observations; the configured
        // stable pool when this agent has no history.
        let pool_id = self
            .store
            .fastest_pool_for_agent(agent_id)?
            .map(|s| s.pool_id)
            .unwrap_or_else(|| self.opts.fallback_stable_pool.clone());

        let request_id = derive_request_id(CommandKind::CreateReplica, agent_id, instance_id);
        let replica = ReplicaRecord {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            instance_logical_id: None,
            pool_id: pool_id.clone(),
            creation_reason: ReplicaReason::Emergency,
            sync_status: SyncStatus::Pending,
            boot_time_seconds: None,
            request_id: request_id.clone(),
            status: ReplicaStatus::Provisioning,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        match self.store.insert_replica(&replica) {
            Ok(()) => {}
            // Lost the race against a concurrent notice: same outcome.
            Err(StateError::ReplicaExists(_)) => {
                self.record_event(
                    agent_id,
                    instance_id,
                    FailoverCause::RebalanceNotice,
                    "replica already provisioning",
                    true,
                    elapsed_ms(started),
                    now,
                )?;
                return Ok(FailoverOutcome::AlreadyProvisioning);
            }
            Err(e) => return Err(e),
        }

        let pre_state = self.instance_snapshot(instance_id)?;
        let enq = self.queue.enqueue(
            &agent_id.to_string(),
            CommandKind::CreateReplica,
            serde_json::json!({ "pool_id": pool_id, "replica_id": replica.id }),
            request_id,
            CommandPriority::Emergency,
            pre_state,
            now,
        )?;

        info!(%agent_id, %pool_id, deduplicated = enq.deduplicated, "emergency replica requested");
        self.record_event(
            agent_id,
            instance_id,
            FailoverCause::RebalanceNotice,
            "emergency replica requested",
            enq.deduplicated,
            elapsed_ms(started),
            now,
        )?;
        self.fire_notification(agent_id, FailoverCause::RebalanceNotice, "emergency replica requested", now);

        Ok(FailoverOutcome::ReplicaRequested { pool_id })
    }

    /// Hard warning: promote the ready replica now, or degrade to a
    /// fresh launch. This path never calls the decision provider — only
    /// locally cached state — and is measured against the promotion
    /// budget.
    pub fn handle_termination(
        &self,
        agent_id: &str,
        instance_id: &str,
        now: u64,
    ) -> StateResult<FailoverOutcome> {
        let started = Instant::now();
        let replica = self.store.live_replica_for_agent(agent_id)?;

        let ready_target = replica.as_ref().and_then(|r| {
            (r.status == ReplicaStatus::Ready)
                .then(|| r.instance_logical_id.clone())
                .flatten()
        });

        let outcome = match ready_target {
            Some(target) => self.promote(agent_id, instance_id, &target, started, now)?,
            None => {
                // Best-effort degradation: a longer downtime beats doing
                // nothing.
                warn!(%agent_id, "termination notice without a ready replica, launching fresh");
                let pool_id = self.opts.fallback_stable_pool.clone();
                let request_id =
                    derive_request_id(CommandKind::LaunchInstance, agent_id, instance_id);
                let pre_state = self.instance_snapshot(instance_id)?;
                let enq = self.queue.enqueue(
                    &agent_id.to_string(),
                    CommandKind::LaunchInstance,
                    serde_json::json!({ "pool_id": pool_id, "replaces": instance_id }),
                    request_id,
                    CommandPriority::Emergency,
                    pre_state,
                    now,
                )?;
                self.record_event(
                    agent_id,
                    instance_id,
                    FailoverCause::TerminationNotice,
                    "fresh launch (no replica available)",
                    enq.deduplicated,
                    elapsed_ms(started),
                    now,
                )?;
                self.fire_notification(
                    agent_id,
                    FailoverCause::TerminationNotice,
                    "fresh launch (no replica available)",
                    now,
                );
                FailoverOutcome::FreshLaunch { pool_id }
            }
        };

        Ok(outcome)
    }

    fn promote(
        &self,
        agent_id: &str,
        instance_id: &str,
        target: &str,
        started: Instant,
        now: u64,
    ) -> StateResult<FailoverOutcome> {
        let rising = self
            .store
            .get_instance(target)?
            .ok_or_else(|| StateError::NotFound(target.to_string()))?;

        // One conflict retry: a concurrent heartbeat may have bumped the
        // version between our read and the promotion.
        let promotion =
            match self
                .store
                .promote_replica(agent_id, target, rising.version, now)
            {
                Err(StateError::Conflict { .. }) => {
                    let rising = self
                        .store
                        .get_instance(target)?
                        .ok_or_else(|| StateError::NotFound(target.to_string()))?;
                    self.store
                        .promote_replica(agent_id, target, rising.version, now)?
                }
                other => other?,
            };

        let request_id = derive_request_id(CommandKind::PromoteReplica, agent_id, instance_id);
        let enq = self.queue.enqueue(
            &agent_id.to_string(),
            CommandKind::PromoteReplica,
            serde_json::json!({ "instance_id": target }),
            request_id,
            CommandPriority::Emergency,
            promotion
                .demoted
                .as_ref()
                .map(|d| serde_json::to_value(d).unwrap_or_default()),
            now,
        )?;

        let elapsed = elapsed_ms(started);
        if elapsed > self.opts.promotion_budget_ms {
            warn!(
                %agent_id,
                elapsed_ms = elapsed,
                budget_ms = self.opts.promotion_budget_ms,
                "promotion exceeded the hard latency budget"
            );
        }

        info!(
            %agent_id,
            new_primary = %promotion.new_primary.logical_id,
            demoted = ?promotion.demoted.as_ref().map(|d| d.logical_id.clone()),
            elapsed_ms = elapsed,
            "replica promoted to primary"
        );
        self.record_event(
            agent_id,
            instance_id,
            FailoverCause::TerminationNotice,
            "replica promoted to primary",
            enq.deduplicated,
            elapsed,
            now,
        )?;
        self.fire_notification(
            agent_id,
            FailoverCause::TerminationNotice,
            "replica promoted to primary",
            now,
        );

        Ok(FailoverOutcome::Promoted {
            new_primary: promotion.new_primary.logical_id,
            demoted: promotion.demoted.map(|d| d.logical_id),
            elapsed_ms: elapsed,
        })
    }

    // ── Manual replica requests ────────────────────────────────────

    /// Operator-requested standby replica. Requires manual mode.
    pub fn request_manual_replica(
        &self,
        agent_id: &str,
        pool_id: &str,
        now: u64,
    ) -> StateResult<ReplicaRecord> {
        let control = self
            .store
            .get_agent_control(agent_id)?
            .unwrap_or_else(|| AgentControl::new(agent_id, now));
        if !control.manual_replica_active {
            return Err(StateError::ModeConflict {
                agent_id: agent_id.to_string(),
                detail: "manual replica mode is not active".to_string(),
            });
        }

        let request_id = derive_request_id(CommandKind::CreateReplica, agent_id, pool_id);
        let replica = ReplicaRecord {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            instance_logical_id: None,
            pool_id: pool_id.to_string(),
            creation_reason: ReplicaReason::Manual,
            sync_status: SyncStatus::Pending,
            boot_time_seconds: None,
            request_id: request_id.clone(),
            status: ReplicaStatus::Provisioning,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_replica(&replica)?;
        self.queue.enqueue(
            &agent_id.to_string(),
            CommandKind::CreateReplica,
            serde_json::json!({ "pool_id": pool_id, "replica_id": replica.id }),
            request_id,
            CommandPriority::Manual,
            None,
            now,
        )?;
        info!(%agent_id, %pool_id, "manual replica requested");
        Ok(replica)
    }

    // ── Mode mutual exclusion ──────────────────────────────────────

    /// Enable manual replica mode. Rejected while automatic emergency
    /// mode is active — never silently overridden.
    pub fn enable_manual_replica(&self, agent_id: &str, now: u64) -> StateResult<AgentControl> {
        self.set_mode(agent_id, now, |control| {
            if control.auto_emergency_active {
                return Err(StateError::ModeConflict {
                    agent_id: control.agent_id.clone(),
                    detail: "automatic emergency mode is active".to_string(),
                });
            }
            control.manual_replica_active = true;
            Ok(())
        })
    }

    /// Enable automatic emergency mode. Rejected while manual replica
    /// mode is active.
    pub fn enable_auto_emergency(&self, agent_id: &str, now: u64) -> StateResult<AgentControl> {
        self.set_mode(agent_id, now, |control| {
            if control.manual_replica_active {
                return Err(StateError::ModeConflict {
                    agent_id: control.agent_id.clone(),
                    detail: "manual replica mode is active".to_string(),
                });
            }
            control.auto_emergency_active = true;
            Ok(())
        })
    }

    pub fn disable_manual_replica(&self, agent_id: &str, now: u64) -> StateResult<AgentControl> {
        self.set_mode(agent_id, now, |control| {
            control.manual_replica_active = false;
            Ok(())
        })
    }

    pub fn disable_auto_emergency(&self, agent_id: &str, now: u64) -> StateResult<AgentControl> {
        self.set_mode(agent_id, now, |control| {
            control.auto_emergency_active = false;
            Ok(())
        })
    }

    fn set_mode(
        &self,
        agent_id: &str,
        now: u64,
        mutate: impl FnOnce(&mut AgentControl) -> StateResult<()>,
    ) -> StateResult<AgentControl> {
        let mut control = self
            .store
            .get_agent_control(agent_id)?
            .unwrap_or_else(|| AgentControl::new(agent_id, now));
        let expected = control.version;
        mutate(&mut control)?;
        let version = self.store.put_agent_control(&control, expected, now)?;
        control.version = version;
        control.updated_at = now;
        Ok(control)
    }

    /// Detect the both-flags-set state (bootstrap race). Alarmed, never
    /// silently resolved. Returns true when the invariant is violated.
    pub fn check_mode_invariant(&self, agent_id: &str) -> StateResult<bool> {
        if let Some(control) = self.store.get_agent_control(agent_id)?
            && control.manual_replica_active
            && control.auto_emergency_active
        {
            error!(
                %agent_id,
                "INVARIANT VIOLATION: manual and automatic failover modes both active"
            );
            return Ok(true);
        }
        Ok(false)
    }

    // ── Command finalization ───────────────────────────────────────

    /// Apply an agent's execution outcome to engine state. Called after
    /// the queue has recorded the acknowledgement.
    pub fn finalize_command(
        &self,
        command: &CommandRecord,
        success: bool,
        now: u64,
    ) -> StateResult<()> {
        match command.kind {
            CommandKind::CreateReplica => self.finalize_create_replica(command, success, now),
            CommandKind::TerminateInstance => {
                self.finalize_terminate_instance(command, success, now)
            }
            CommandKind::PromoteReplica | CommandKind::LaunchInstance | CommandKind::SwitchPool => {
                debug!(command_id = %command.id, kind = ?command.kind, success, "command finalized");
                Ok(())
            }
        }
    }

    fn finalize_create_replica(
        &self,
        command: &CommandRecord,
        success: bool,
        now: u64,
    ) -> StateResult<()> {
        let Some(mut replica) = self.store.live_replica_for_agent(&command.agent_id)? else {
            debug!(command_id = %command.id, "no live replica to finalize");
            return Ok(());
        };

        if success {
            let boot_seconds = now.saturating_sub(command.created_at);
            replica.status = ReplicaStatus::Ready;
            replica.sync_status = SyncStatus::InSync;
            replica.boot_time_seconds = Some(boot_seconds);
            // The agent reports the replica instance id alongside the ack.
            if let Some(instance_id) = command
                .post_state
                .as_ref()
                .and_then(|s| s.get("instance_id"))
                .and_then(|v| v.as_str())
            {
                replica.instance_logical_id = Some(instance_id.to_string());
            }
            let version = replica.version;
            self.store.update_replica(&replica, version, now)?;

            // The replica instance registered as Launching; a successful
            // create confirms it is up and serving as standby.
            if let Some(instance_id) = replica.instance_logical_id.clone()
                && let Some(inst) = self.store.get_instance(&instance_id)?
                && inst.status == LifecycleStatus::Launching
            {
                match self.store.transition_instance(
                    &instance_id,
                    inst.version,
                    LifecycleStatus::Running,
                    inst.role,
                    now,
                ) {
                    Ok(_) | Err(StateError::Conflict { .. }) => {}
                    Err(e) => return Err(e),
                }
            }

            self.store.upsert_boot_stat(&spotgrid_state::BootStat {
                agent_id: replica.agent_id.clone(),
                pool_id: replica.pool_id.clone(),
                boot_seconds,
                observed_at: now,
            })?;
            info!(
                agent_id = %replica.agent_id,
                replica_id = %replica.id,
                boot_seconds,
                "replica ready"
            );
        } else {
            replica.status = ReplicaStatus::Abandoned;
            let version = replica.version;
            self.store.update_replica(&replica, version, now)?;
            warn!(
                agent_id = %replica.agent_id,
                replica_id = %replica.id,
                error = ?command.error,
                "replica creation failed, slot freed"
            );
        }
        Ok(())
    }

    fn finalize_terminate_instance(
        &self,
        command: &CommandRecord,
        success: bool,
        now: u64,
    ) -> StateResult<()> {
        if !success {
            warn!(
                command_id = %command.id,
                agent_id = %command.agent_id,
                error = ?command.error,
                "termination command failed"
            );
            return Ok(());
        }
        let Some(instance_id) = command
            .payload
            .get("instance_id")
            .and_then(|v| v.as_str())
        else {
            return Ok(());
        };
        let Some(instance) = self.store.get_instance(instance_id)? else {
            return Ok(());
        };
        if instance.status != LifecycleStatus::Terminating {
            return Ok(());
        }
        match self.store.transition_instance(
            instance_id,
            instance.version,
            LifecycleStatus::Terminated,
            instance.role,
            now,
        ) {
            Ok(_) => {
                info!(%instance_id, "termination confirmed");
                Ok(())
            }
            // Lost a race; the next execution report settles it.
            Err(StateError::Conflict { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ── Internals ──────────────────────────────────────────────────

    fn instance_snapshot(&self, instance_id: &str) -> StateResult<Option<serde_json::Value>> {
        Ok(self
            .store
            .get_instance(instance_id)?
            .map(|i| serde_json::to_value(&i).unwrap_or_default()))
    }

    #[allow(clippy::too_many_arguments)]
    fn record_event(
        &self,
        agent_id: &str,
        instance_id: &str,
        cause: FailoverCause,
        action: &str,
        deduplicated: bool,
        elapsed: u64,
        now: u64,
    ) -> StateResult<()> {
        self.store.append_failover_event(&FailoverEvent {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            instance_logical_id: instance_id.to_string(),
            cause,
            action: action.to_string(),
            deduplicated,
            elapsed_ms: elapsed,
            created_at: now,
        })
    }

    fn fire_notification(&self, agent_id: &str, cause: FailoverCause, action: &str, now: u64) {
        let notifier = self.notifier.clone();
        let notification = FailoverNotification {
            agent_id: agent_id.to_string(),
            cause,
            action: action.to_string(),
            created_at: now,
        };
        // Fire-and-forget: delivery never blocks the failover path.
        tokio::spawn(async move {
            notifier.notify(notification).await;
        });
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::LogNotifier;
    use spotgrid_state::{CapacityMode, InstanceRecord};

    fn orchestrator() -> (FailoverOrchestrator, StateStore, CommandQueue) {
        let store = StateStore::open_in_memory().unwrap();
        let queue = CommandQueue::new(store.clone(), 300);
        let orch = FailoverOrchestrator::new(
            store.clone(),
            queue.clone(),
            FailoverOptions {
                promotion_budget_ms: 15_000,
                fallback_stable_pool: "on-demand/default".to_string(),
            },
            Arc::new(LogNotifier),
        );
        (orch, store, queue)
    }

    fn running_instance(logical_id: &str, agent_id: &str, role: InstanceRole) -> InstanceRecord {
        InstanceRecord {
            logical_id: logical_id.to_string(),
            provider_id: format!("i-{logical_id}"),
            agent_id: agent_id.to_string(),
            role,
            status: LifecycleStatus::Running,
            mode: CapacityMode::Discounted,
            pool_id: "m5.large/us-east-1a".to_string(),
            version: 0,
            launch_requested_at: 1000,
            launch_confirmed_at: Some(1010),
            termination_requested_at: None,
            termination_confirmed_at: None,
            last_heartbeat_at: Some(1100),
            updated_at: 1100,
            pool_entered_at: 1000,
        }
    }

    fn ready_replica(store: &StateStore, agent_id: &str, instance_id: &str) {
        store
            .register_instance(&running_instance(instance_id, agent_id, InstanceRole::Replica))
            .unwrap();
        store
            .insert_replica(&ReplicaRecord {
                id: "rep-1".to_string(),
                agent_id: agent_id.to_string(),
                instance_logical_id: Some(instance_id.to_string()),
                pool_id: "m5.large/us-east-1b".to_string(),
                creation_reason: ReplicaReason::Emergency,
                sync_status: SyncStatus::InSync,
                boot_time_seconds: Some(45),
                request_id: "req-rep-1".to_string(),
                status: ReplicaStatus::Ready,
                version: 0,
                created_at: 1000,
                updated_at: 1000,
            })
            .unwrap();
    }

    // ── Rebalance notices ──────────────────────────────────────────

    #[tokio::test]
    async fn rebalance_requests_replica_in_fastest_pool() {
        let (orch, store, queue) = orchestrator();
        store
            .register_instance(&running_instance("lg-p", "agent-1", InstanceRole::Primary))
            .unwrap();
        for (pool, secs) in [("m5.large/us-east-1b", 40), ("m5.large/us-east-1c", 90)] {
            store
                .upsert_boot_stat(&spotgrid_state::BootStat {
                    agent_id: "agent-1".to_string(),
                    pool_id: pool.to_string(),
                    boot_seconds: secs,
                    observed_at: 900,
                })
                .unwrap();
        }

        let outcome = orch.handle_rebalance("agent-1", "lg-p", 2000).unwrap();
        assert_eq!(
            outcome,
            FailoverOutcome::ReplicaRequested {
                pool_id: "m5.large/us-east-1b".to_string()
            }
        );

        let replica = store.live_replica_for_agent("agent-1").unwrap().unwrap();
        assert_eq!(replica.creation_reason, ReplicaReason::Emergency);
        assert_eq!(replica.pool_id, "m5.large/us-east-1b");

        let commands = queue.poll("agent-1", 2010).unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].kind, CommandKind::CreateReplica);
        assert_eq!(commands[0].priority, CommandPriority::Emergency);
    }

    #[tokio::test]
    async fn second_rebalance_notice_is_a_no_op() {
        let (orch, store, queue) = orchestrator();
        store
            .register_instance(&running_instance("lg-p", "agent-1", InstanceRole::Primary))
            .unwrap();

        orch.handle_rebalance("agent-1", "lg-p", 2000).unwrap();
        let outcome = orch.handle_rebalance("agent-1", "lg-p", 2005).unwrap();
        assert_eq!(outcome, FailoverOutcome::AlreadyProvisioning);

        // Still exactly one command.
        assert_eq!(queue.poll("agent-1", 2010).unwrap().len(), 1);

        // History shows the dedup.
        let events = store.list_failover_events("agent-1", 10).unwrap();
        assert_eq!(events.len(), 2);
        assert!(!events[0].deduplicated);
        assert!(events[1].deduplicated);
    }

    #[tokio::test]
    async fn rebalance_without_boot_history_uses_fallback_pool() {
        let (orch, store, _) = orchestrator();
        store
            .register_instance(&running_instance("lg-p", "agent-1", InstanceRole::Primary))
            .unwrap();

        let outcome = orch.handle_rebalance("agent-1", "lg-p", 2000).unwrap();
        assert_eq!(
            outcome,
            FailoverOutcome::ReplicaRequested {
                pool_id: "on-demand/default".to_string()
            }
        );
    }

    // ── Termination notices ────────────────────────────────────────

    #[tokio::test]
    async fn termination_with_ready_replica_promotes_atomically() {
        let (orch, store, queue) = orchestrator();
        store
            .register_instance(&running_instance("lg-p", "agent-1", InstanceRole::Primary))
            .unwrap();
        ready_replica(&store, "agent-1", "lg-r");

        let outcome = orch.handle_termination("agent-1", "lg-p", 3000).unwrap();
        let FailoverOutcome::Promoted {
            new_primary,
            demoted,
            elapsed_ms,
        } = outcome
        else {
            panic!("expected promotion, got {outcome:?}");
        };

        assert_eq!(new_primary, "lg-r");
        assert_eq!(demoted.as_deref(), Some("lg-p"));
        assert!(elapsed_ms < 15_000);

        // The former replica serves, the former primary is a zombie.
        let new_primary = store.get_instance("lg-r").unwrap().unwrap();
        assert_eq!(new_primary.role, InstanceRole::Primary);
        assert_eq!(new_primary.status, LifecycleStatus::Running);
        let old = store.get_instance("lg-p").unwrap().unwrap();
        assert_eq!(old.role, InstanceRole::Zombie);
        assert_eq!(old.status, LifecycleStatus::Zombie);

        let commands = queue.poll("agent-1", 3010).unwrap();
        assert_eq!(commands[0].kind, CommandKind::PromoteReplica);
    }

    #[tokio::test]
    async fn termination_survives_a_concurrent_heartbeat() {
        let (orch, store, _) = orchestrator();
        store
            .register_instance(&running_instance("lg-p", "agent-1", InstanceRole::Primary))
            .unwrap();
        ready_replica(&store, "agent-1", "lg-r");

        // A heartbeat bumped the replica's version after the replica
        // went ready; promotion reads the fresh version and proceeds.
        store.record_heartbeat("lg-r", 0, 2990).unwrap();

        let outcome = orch.handle_termination("agent-1", "lg-p", 3000).unwrap();
        assert!(matches!(outcome, FailoverOutcome::Promoted { .. }));
    }

    #[tokio::test]
    async fn termination_without_replica_degrades_to_fresh_launch() {
        let (orch, store, queue) = orchestrator();
        store
            .register_instance(&running_instance("lg-p", "agent-1", InstanceRole::Primary))
            .unwrap();

        let outcome = orch.handle_termination("agent-1", "lg-p", 3000).unwrap();
        assert_eq!(
            outcome,
            FailoverOutcome::FreshLaunch {
                pool_id: "on-demand/default".to_string()
            }
        );

        let commands = queue.poll("agent-1", 3010).unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].kind, CommandKind::LaunchInstance);

        let events = store.list_failover_events("agent-1", 10).unwrap();
        assert_eq!(events[0].cause, FailoverCause::TerminationNotice);
    }

    // ── Mode mutual exclusion ──────────────────────────────────────

    #[tokio::test]
    async fn manual_and_auto_modes_exclude_each_other() {
        let (orch, _, _) = orchestrator();

        orch.enable_auto_emergency("agent-1", 1000).unwrap();
        let err = orch.enable_manual_replica("agent-1", 1010).unwrap_err();
        assert!(matches!(err, StateError::ModeConflict { .. }));

        // And the other direction.
        orch.disable_auto_emergency("agent-1", 1020).unwrap();
        orch.enable_manual_replica("agent-1", 1030).unwrap();
        let err = orch.enable_auto_emergency("agent-1", 1040).unwrap_err();
        assert!(matches!(err, StateError::ModeConflict { .. }));
    }

    #[tokio::test]
    async fn both_flags_set_is_alarmed_not_resolved() {
        let (orch, store, _) = orchestrator();

        // Simulate the bootstrap race writing both flags.
        let mut control = AgentControl::new("agent-1", 1000);
        control.manual_replica_active = true;
        control.auto_emergency_active = true;
        store.put_agent_control(&control, 0, 1000).unwrap();

        assert!(orch.check_mode_invariant("agent-1").unwrap());

        // Still both set afterwards, not silently resolved.
        let stored = store.get_agent_control("agent-1").unwrap().unwrap();
        assert!(stored.manual_replica_active && stored.auto_emergency_active);
    }

    #[tokio::test]
    async fn manual_replica_requires_manual_mode() {
        let (orch, _, _) = orchestrator();

        let err = orch
            .request_manual_replica("agent-1", "m5.large/us-east-1b", 1000)
            .unwrap_err();
        assert!(matches!(err, StateError::ModeConflict { .. }));

        orch.enable_manual_replica("agent-1", 1010).unwrap();
        let replica = orch
            .request_manual_replica("agent-1", "m5.large/us-east-1b", 1020)
            .unwrap();
        assert_eq!(replica.creation_reason, ReplicaReason::Manual);
    }

    // ── Command finalization ───────────────────────────────────────

    #[tokio::test]
    async fn create_replica_ack_marks_ready_and_caches_boot_time() {
        let (orch, store, queue) = orchestrator();
        store
            .register_instance(&running_instance("lg-p", "agent-1", InstanceRole::Primary))
            .unwrap();
        orch.handle_rebalance("agent-1", "lg-p", 2000).unwrap();

        let delivered = queue.poll("agent-1", 2010).unwrap();
        let ack = queue
            .ack(
                &delivered[0].id,
                true,
                None,
                Some(serde_json::json!({"instance_id": "lg-r"})),
                2045,
            )
            .unwrap();
        orch.finalize_command(ack.command(), true, 2045).unwrap();

        let replica = store
            .live_replica_for_agent("agent-1")
            .unwrap()
            .expect("replica should still be live (ready)");
        assert_eq!(replica.status, ReplicaStatus::Ready);
        assert_eq!(replica.boot_time_seconds, Some(45));
        assert_eq!(replica.instance_logical_id.as_deref(), Some("lg-r"));

        // Boot time cached for the next emergency pool choice.
        let fastest = store.fastest_pool_for_agent("agent-1").unwrap().unwrap();
        assert_eq!(fastest.boot_seconds, 45);
    }

    #[tokio::test]
    async fn failed_replica_creation_frees_the_slot() {
        let (orch, store, queue) = orchestrator();
        store
            .register_instance(&running_instance("lg-p", "agent-1", InstanceRole::Primary))
            .unwrap();
        orch.handle_rebalance("agent-1", "lg-p", 2000).unwrap();

        let delivered = queue.poll("agent-1", 2010).unwrap();
        let ack = queue
            .ack(
                &delivered[0].id,
                false,
                Some("capacity unavailable".to_string()),
                None,
                2030,
            )
            .unwrap();
        orch.finalize_command(ack.command(), false, 2030).unwrap();

        assert!(store.live_replica_for_agent("agent-1").unwrap().is_none());
        // A later rebalance notice can provision again.
        let outcome = orch.handle_rebalance("agent-1", "lg-p", 2100).unwrap();
        assert!(matches!(outcome, FailoverOutcome::ReplicaRequested { .. }));
    }

    #[tokio::test]
    async fn terminate_ack_confirms_termination() {
        let (orch, store, queue) = orchestrator();
        let mut zombie = running_instance("lg-z", "agent-1", InstanceRole::Zombie);
        zombie.status = LifecycleStatus::Terminating;
        zombie.termination_requested_at = Some(2000);
        store.register_instance(&zombie).unwrap();

        let enq = queue
            .enqueue(
                &"agent-1".to_string(),
                CommandKind::TerminateInstance,
                serde_json::json!({"instance_id": "lg-z"}),
                "req-term".to_string(),
                CommandPriority::Scheduled,
                None,
                2000,
            )
            .unwrap();
        queue.poll("agent-1", 2005).unwrap();
        let ack = queue.ack(&enq.command.id, true, None, None, 2060).unwrap();
        orch.finalize_command(ack.command(), true, 2060).unwrap();

        let inst = store.get_instance("lg-z").unwrap().unwrap();
        assert!(inst.is_terminal());
        assert_eq!(inst.termination_confirmed_at, Some(2060));
    }
}
