//! Notification out-contract.
//!
//! The real notification subsystem (email, dashboards) is an external
//! collaborator; the orchestrator only fires events at this trait and
//! never waits on delivery.

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use spotgrid_state::FailoverCause;

/// A failover event worth telling a human about.
#[derive(Debug, Clone, Serialize)]
pub struct FailoverNotification {
    pub agent_id: String,
    pub cause: FailoverCause,
    pub action: String,
    pub created_at: u64,
}

/// Fire-and-forget notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: FailoverNotification);
}

/// Default sink: structured log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: FailoverNotification) {
        info!(
            agent_id = %notification.agent_id,
            cause = ?notification.cause,
            action = %notification.action,
            "failover notification"
        );
    }
}
