//! Queue operations over the state store.

use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use spotgrid_state::{
    AgentId, CommandKind, CommandPriority, CommandRecord, CommandStatus, StateResult, StateStore,
};

/// Result of an enqueue: the command (new or pre-existing) and whether
/// the request id was deduplicated.
#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub command: CommandRecord,
    pub deduplicated: bool,
}

/// Result of an acknowledgement.
#[derive(Debug, Clone)]
pub enum AckOutcome {
    /// First acknowledgement; the outcome was recorded.
    Acked(CommandRecord),
    /// The command was already terminal; nothing changed.
    AlreadyFinal(CommandRecord),
}

impl AckOutcome {
    pub fn command(&self) -> &CommandRecord {
        match self {
            AckOutcome::Acked(cmd) | AckOutcome::AlreadyFinal(cmd) => cmd,
        }
    }

    pub fn newly_acked(&self) -> bool {
        matches!(self, AckOutcome::Acked(_))
    }
}

/// Derive a deterministic request id from the logical operation, so that
/// retried signals map to the same command.
pub fn derive_request_id(kind: CommandKind, agent_id: &str, discriminator: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{kind:?}:{agent_id}:{discriminator}").as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// The durable command queue.
#[derive(Clone)]
pub struct CommandQueue {
    store: StateStore,
    expiry_secs: u64,
}

impl CommandQueue {
    pub fn new(store: StateStore, expiry_secs: u64) -> Self {
        Self { store, expiry_secs }
    }

    /// Enqueue a command for an agent. Re-enqueueing the same
    /// `request_id` returns the existing command and does not duplicate
    /// work.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue(
        &self,
        agent_id: &AgentId,
        kind: CommandKind,
        payload: serde_json::Value,
        request_id: String,
        priority: CommandPriority,
        pre_state: Option<serde_json::Value>,
        now: u64,
    ) -> StateResult<EnqueueOutcome> {
        let cmd = CommandRecord {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.clone(),
            kind,
            payload,
            request_id,
            priority,
            status: CommandStatus::Pending,
            success: None,
            error: None,
            pre_state,
            post_state: None,
            created_at: now,
            delivered_at: None,
            acked_at: None,
            expires_at: now + self.expiry_secs,
        };

        let (command, deduplicated) = self.store.insert_command(&cmd)?;
        if deduplicated {
            debug!(
                %agent_id,
                command_id = %command.id,
                request_id = %command.request_id,
                "enqueue deduplicated onto existing command"
            );
        } else {
            info!(
                %agent_id,
                command_id = %command.id,
                kind = ?command.kind,
                priority = ?command.priority,
                "command enqueued"
            );
        }
        Ok(EnqueueOutcome {
            command,
            deduplicated,
        })
    }

    /// Take the agent's pending commands, priority-ordered, marking them
    /// delivered.
    pub fn poll(&self, agent_id: &str, now: u64) -> StateResult<Vec<CommandRecord>> {
        self.store.pop_pending_commands(agent_id, now)
    }

    /// Record an agent's execution outcome. Idempotent: a second ack of
    /// the same command has no further effect.
    pub fn ack(
        &self,
        command_id: &str,
        success: bool,
        error: Option<String>,
        post_state: Option<serde_json::Value>,
        now: u64,
    ) -> StateResult<AckOutcome> {
        let (command, newly_acked) =
            self.store
                .ack_command(command_id, success, error, post_state, now)?;
        if newly_acked {
            info!(
                command_id = %command.id,
                agent_id = %command.agent_id,
                success,
                "command acknowledged"
            );
            Ok(AckOutcome::Acked(command))
        } else {
            debug!(command_id = %command.id, "duplicate acknowledgement ignored");
            Ok(AckOutcome::AlreadyFinal(command))
        }
    }

    /// Mark overdue commands expired and surface them.
    pub fn expire_stale(&self, now: u64) -> StateResult<Vec<CommandRecord>> {
        let expired = self.store.expire_commands(now)?;
        for cmd in &expired {
            warn!(
                command_id = %cmd.id,
                agent_id = %cmd.agent_id,
                kind = ?cmd.kind,
                "command expired without acknowledgement, needs operator attention"
            );
        }
        Ok(expired)
    }

    /// Commands currently sitting in the expired state.
    pub fn expired(&self) -> StateResult<Vec<CommandRecord>> {
        self.store.list_expired_commands()
    }

    /// Run the periodic expiry sweeper.
    pub async fn run_sweeper(
        &self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "command sweeper started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.expire_stale(epoch_secs()) {
                        tracing::error!(error = %e, "command expiry sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("command sweeper shutting down");
                    break;
                }
            }
        }
    }
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> (CommandQueue, StateStore) {
        let store = StateStore::open_in_memory().unwrap();
        (CommandQueue::new(store.clone(), 300), store)
    }

    fn enqueue_simple(
        q: &CommandQueue,
        request_id: &str,
        priority: CommandPriority,
        now: u64,
    ) -> EnqueueOutcome {
        q.enqueue(
            &"agent-1".to_string(),
            CommandKind::CreateReplica,
            serde_json::json!({"pool_id": "m5.large/us-east-1b"}),
            request_id.to_string(),
            priority,
            None,
            now,
        )
        .unwrap()
    }

    #[test]
    fn enqueue_is_idempotent_on_request_id() {
        let (q, _) = queue();

        let first = enqueue_simple(&q, "req-A", CommandPriority::Emergency, 1000);
        assert!(!first.deduplicated);

        let second = enqueue_simple(&q, "req-A", CommandPriority::Emergency, 1001);
        assert!(second.deduplicated);
        assert_eq!(second.command.id, first.command.id);

        // Exactly one command exists.
        assert_eq!(q.poll("agent-1", 1002).unwrap().len(), 1);
    }

    #[test]
    fn poll_delivers_in_priority_order_once() {
        let (q, _) = queue();
        enqueue_simple(&q, "req-manual", CommandPriority::Manual, 1000);
        enqueue_simple(&q, "req-emergency", CommandPriority::Emergency, 1001);
        enqueue_simple(&q, "req-scheduled", CommandPriority::Scheduled, 1002);

        let delivered = q.poll("agent-1", 1010).unwrap();
        let priorities: Vec<_> = delivered.iter().map(|c| c.priority).collect();
        assert_eq!(
            priorities,
            vec![
                CommandPriority::Emergency,
                CommandPriority::Scheduled,
                CommandPriority::Manual
            ]
        );

        assert!(q.poll("agent-1", 1011).unwrap().is_empty());
    }

    #[test]
    fn ack_records_outcome_exactly_once() {
        let (q, _) = queue();
        let cmd = enqueue_simple(&q, "req-A", CommandPriority::Emergency, 1000).command;
        q.poll("agent-1", 1010).unwrap();

        let first = q
            .ack(&cmd.id, true, None, Some(serde_json::json!({"state": "ready"})), 1020)
            .unwrap();
        assert!(first.newly_acked());
        assert_eq!(first.command().status, CommandStatus::Executed);

        let second = q
            .ack(&cmd.id, false, Some("late duplicate".to_string()), None, 1030)
            .unwrap();
        assert!(!second.newly_acked());
        assert_eq!(second.command().success, Some(true));
    }

    #[test]
    fn stale_commands_expire_and_surface() {
        let (q, _) = queue();
        enqueue_simple(&q, "req-A", CommandPriority::Scheduled, 1000);

        assert!(q.expire_stale(1100).unwrap().is_empty());

        let expired = q.expire_stale(1300).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, CommandStatus::Expired);
        assert_eq!(q.expired().unwrap().len(), 1);

        // An expired command is no longer delivered.
        assert!(q.poll("agent-1", 1400).unwrap().is_empty());
    }

    #[test]
    fn derived_request_ids_are_stable_and_distinct() {
        let a = derive_request_id(CommandKind::CreateReplica, "agent-1", "lg-1");
        let b = derive_request_id(CommandKind::CreateReplica, "agent-1", "lg-1");
        let c = derive_request_id(CommandKind::PromoteReplica, "agent-1", "lg-1");
        let d = derive_request_id(CommandKind::CreateReplica, "agent-2", "lg-1");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 32);
    }
}
