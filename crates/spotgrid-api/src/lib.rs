//! spotgrid-api — REST API for spotgrid.
//!
//! Agent-facing routes carry the ingestion contracts (§ pricing,
//! heartbeats, interruption notices, command polling and execution
//! reports); operator-facing routes expose instances, canonical pricing,
//! failover history, mode control, and expired commands.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/agents/register` | Register an instance for an agent |
//! | POST | `/api/v1/pricing` | Report a raw price sample |
//! | POST | `/api/v1/heartbeat` | Liveness + optimistic version, config delivery |
//! | POST | `/api/v1/notices/rebalance` | Soft interruption warning |
//! | POST | `/api/v1/notices/termination` | Hard interruption warning |
//! | GET | `/api/v1/agents/{agent_id}/commands` | Poll pending commands |
//! | POST | `/api/v1/commands/{id}/execution` | Report command outcome |
//! | GET | `/api/v1/instances` | List instances |
//! | GET | `/api/v1/instances/{logical_id}` | Instance detail |
//! | GET | `/api/v1/pools/{pool_id}/prices` | Canonical price series |
//! | GET | `/api/v1/agents/{agent_id}/events` | Failover history |
//! | GET | `/api/v1/agents/{agent_id}/mode` | Control flags + invariant check |
//! | POST | `/api/v1/agents/{agent_id}/mode` | Enable/disable failover modes |
//! | POST | `/api/v1/agents/{agent_id}/evaluate` | Run a switch evaluation |
//! | GET | `/api/v1/commands/expired` | Commands needing operator attention |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use spotgrid_decision::DecisionGateway;
use spotgrid_failover::FailoverOrchestrator;
use spotgrid_ingest::IngestValidator;
use spotgrid_queue::CommandQueue;
use spotgrid_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub validator: Arc<IngestValidator>,
    pub queue: CommandQueue,
    pub orchestrator: Arc<FailoverOrchestrator>,
    pub gateway: Arc<DecisionGateway>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/agents/register", post(handlers::register_agent))
        .route("/pricing", post(handlers::report_pricing))
        .route("/heartbeat", post(handlers::report_heartbeat))
        .route("/notices/rebalance", post(handlers::report_rebalance_notice))
        .route("/notices/termination", post(handlers::report_termination_notice))
        .route("/agents/{agent_id}/commands", get(handlers::poll_commands))
        .route("/commands/{id}/execution", post(handlers::report_execution))
        .route("/instances", get(handlers::list_instances))
        .route("/instances/{logical_id}", get(handlers::get_instance))
        .route("/pools/{pool_id}/prices", get(handlers::get_pool_prices))
        .route("/agents/{agent_id}/events", get(handlers::list_events))
        .route(
            "/agents/{agent_id}/mode",
            get(handlers::get_mode).post(handlers::set_mode),
        )
        .route("/agents/{agent_id}/evaluate", post(handlers::evaluate_agent))
        .route("/commands/expired", get(handlers::list_expired_commands))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
