//! Zombie reaper — demoted primaries are eventually terminated.
//!
//! Promotion leaves the former primary in `Zombie`; this background task
//! owns the rest of its life: enqueue an idempotent terminate command
//! and move the row to `Terminating`. The final `Terminated` transition
//! happens when the agent acknowledges execution.

use std::time::Duration;

use tracing::{debug, error, info};

use spotgrid_queue::{CommandQueue, derive_request_id};
use spotgrid_state::{
    CommandKind, CommandPriority, InstanceRole, LifecycleStatus, StateError, StateResult,
    StateStore,
};

/// Scans for zombie instances and issues their termination.
pub struct ZombieReaper {
    store: StateStore,
    queue: CommandQueue,
}

impl ZombieReaper {
    pub fn new(store: StateStore, queue: CommandQueue) -> Self {
        Self { store, queue }
    }

    /// One reaper pass. Returns how many zombies were moved to
    /// `Terminating`. Conflicts are skipped; the next pass retries with
    /// a fresh version.
    pub fn sweep(&self, now: u64) -> StateResult<u32> {
        let mut reaped = 0;
        for instance in self.store.instances_in_status(LifecycleStatus::Zombie)? {
            let request_id = derive_request_id(
                CommandKind::TerminateInstance,
                &instance.agent_id,
                &instance.logical_id,
            );
            self.queue.enqueue(
                &instance.agent_id,
                CommandKind::TerminateInstance,
                serde_json::json!({ "instance_id": instance.logical_id }),
                request_id,
                CommandPriority::Scheduled,
                Some(serde_json::to_value(&instance).unwrap_or_default()),
                now,
            )?;

            match self.store.transition_instance(
                &instance.logical_id,
                instance.version,
                LifecycleStatus::Terminating,
                InstanceRole::Zombie,
                now,
            ) {
                Ok(_) => {
                    info!(
                        logical_id = %instance.logical_id,
                        agent_id = %instance.agent_id,
                        "zombie scheduled for termination"
                    );
                    reaped += 1;
                }
                Err(StateError::Conflict { .. }) => {
                    debug!(logical_id = %instance.logical_id, "zombie changed underneath the reaper, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reaped)
    }

    /// Run the periodic reaper loop.
    pub async fn run(
        &self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "zombie reaper started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep(epoch_secs()) {
                        error!(error = %e, "reaper sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("zombie reaper shutting down");
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
