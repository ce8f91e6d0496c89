//! REST API handlers.
//!
//! Each handler delegates to the owning subsystem and maps its typed
//! errors onto status codes: validation failures are 422, optimistic
//! concurrency conflicts and mode conflicts are 409, missing rows are
//! 404. Lost races are the caller's retry decision, so the 409 body
//! carries enough context to re-read.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use spotgrid_decision::{DecisionContext, RecommendedAction};
use spotgrid_ingest::{HeartbeatReport, IngestError, NoticeKind, NoticeReport, PriceReport};
use spotgrid_queue::derive_request_id;
use spotgrid_state::{
    CapacityMode, CommandKind, CommandPriority, FailoverCause, FailoverEvent, InstanceRecord,
    InstanceRole, LifecycleStatus, StateError,
};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse + use<> {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn state_error(e: &StateError) -> impl IntoResponse {
    let status = match e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::Conflict { .. }
        | StateError::ModeConflict { .. }
        | StateError::PrimaryExists(_)
        | StateError::ReplicaExists(_)
        | StateError::AlreadyExists(_) => StatusCode::CONFLICT,
        StateError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

fn ingest_error(e: &IngestError) -> impl IntoResponse {
    match e {
        IngestError::State(inner) => state_error(inner).into_response(),
        _ => error_response(&e.to_string(), StatusCode::UNPROCESSABLE_ENTITY).into_response(),
    }
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Registration ───────────────────────────────────────────────

/// Registration request for a new monitored instance.
#[derive(Deserialize)]
pub struct RegisterRequest {
    pub agent_id: String,
    pub provider_id: String,
    pub pool_id: String,
    pub mode: CapacityMode,
    #[serde(default = "default_role")]
    pub role: InstanceRole,
}

fn default_role() -> InstanceRole {
    InstanceRole::Primary
}

/// POST /api/v1/agents/register
pub async fn register_agent(
    State(state): State<ApiState>,
    Json(req): Json<RegisterRequest>,
) -> impl IntoResponse {
    if req.agent_id.is_empty() || req.pool_id.is_empty() {
        return error_response("agent_id and pool_id are required", StatusCode::UNPROCESSABLE_ENTITY)
            .into_response();
    }

    let now = epoch_secs();
    let record = InstanceRecord {
        logical_id: Uuid::new_v4().to_string(),
        provider_id: req.provider_id,
        agent_id: req.agent_id.clone(),
        role: req.role,
        status: LifecycleStatus::Launching,
        mode: req.mode,
        pool_id: req.pool_id,
        version: 0,
        launch_requested_at: now,
        launch_confirmed_at: None,
        termination_requested_at: None,
        termination_confirmed_at: None,
        last_heartbeat_at: None,
        updated_at: now,
        pool_entered_at: now,
    };

    if let Err(e) = state.store.register_instance(&record) {
        return state_error(&e).into_response();
    }

    // First contact also creates the agent's control row.
    if state.store.get_agent_control(&req.agent_id).ok().flatten().is_none() {
        let control = spotgrid_state::AgentControl::new(&req.agent_id, now);
        if let Err(e) = state.store.put_agent_control(&control, 0, now) {
            warn!(agent_id = %req.agent_id, error = %e, "control row creation raced");
        }
    }

    (
        StatusCode::CREATED,
        ApiResponse::ok(serde_json::json!({
            "logical_id": record.logical_id,
            "version": record.version,
        })),
    )
        .into_response()
}

// ── Telemetry ──────────────────────────────────────────────────

/// POST /api/v1/pricing
pub async fn report_pricing(
    State(state): State<ApiState>,
    Json(report): Json<PriceReport>,
) -> impl IntoResponse {
    match state.validator.ingest_price(&state.store, report, epoch_secs()) {
        Ok(sample) => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(serde_json::json!({
                "pool_id": sample.pool_id,
                "captured_at": sample.captured_at,
                "price": sample.price,
            })),
        )
            .into_response(),
        Err(e) => ingest_error(&e).into_response(),
    }
}

/// POST /api/v1/heartbeat
///
/// A stale `version` returns 409 with the current version so the agent
/// re-reads; a stale `config_version` gets the current engine config in
/// the response.
pub async fn report_heartbeat(
    State(state): State<ApiState>,
    Json(report): Json<HeartbeatReport>,
) -> impl IntoResponse {
    let hb = match state.validator.validate_heartbeat(report) {
        Ok(hb) => hb,
        Err(e) => return ingest_error(&e).into_response(),
    };
    if !hb.healthy {
        warn!(agent_id = %hb.agent_id, pool = %hb.current_pool, "agent reported degraded status");
    }

    let primary = match state.store.active_primary_for_agent(&hb.agent_id) {
        Ok(Some(primary)) => primary,
        Ok(None) => return error_response("no active primary for agent", StatusCode::NOT_FOUND).into_response(),
        Err(e) => return state_error(&e).into_response(),
    };

    let now = epoch_secs();
    let updated = match state.store.record_heartbeat(&primary.logical_id, hb.version, now) {
        Ok(updated) => updated,
        Err(StateError::Conflict { expected, actual }) => {
            // The agent holds a stale version; hand back the current one
            // so it can re-read and retry.
            return (
                StatusCode::CONFLICT,
                Json(ApiResponse {
                    success: false,
                    data: Some(serde_json::json!({
                        "logical_id": primary.logical_id,
                        "expected_version": expected,
                        "current_version": actual,
                    })),
                    error: Some("version conflict".to_string()),
                }),
            )
                .into_response();
        }
        Err(e) => return state_error(&e).into_response(),
    };

    // Config versioning: deliver the current config when the agent's
    // cached copy is stale.
    let config = match state.store.get_engine_config() {
        Ok(cfg) => cfg.filter(|c| c.version > hb.config_version),
        Err(e) => return state_error(&e).into_response(),
    };

    ApiResponse::ok(serde_json::json!({
        "logical_id": updated.logical_id,
        "version": updated.version,
        "status": updated.status,
        "config": config,
    }))
    .into_response()
}

// ── Interruption notices ───────────────────────────────────────

/// POST /api/v1/notices/rebalance
pub async fn report_rebalance_notice(
    State(state): State<ApiState>,
    Json(report): Json<NoticeReport>,
) -> impl IntoResponse {
    let notice = match state.validator.validate_notice(report, NoticeKind::Rebalance) {
        Ok(n) => n,
        Err(e) => return ingest_error(&e).into_response(),
    };
    match state
        .orchestrator
        .handle_rebalance(&notice.agent_id, &notice.instance_id, epoch_secs())
    {
        Ok(outcome) => ApiResponse::ok(serde_json::json!({ "outcome": format!("{outcome:?}") }))
            .into_response(),
        Err(e) => state_error(&e).into_response(),
    }
}

/// POST /api/v1/notices/termination
pub async fn report_termination_notice(
    State(state): State<ApiState>,
    Json(report): Json<NoticeReport>,
) -> impl IntoResponse {
    let notice = match state.validator.validate_notice(report, NoticeKind::Termination) {
        Ok(n) => n,
        Err(e) => return ingest_error(&e).into_response(),
    };
    match state
        .orchestrator
        .handle_termination(&notice.agent_id, &notice.instance_id, epoch_secs())
    {
        Ok(outcome) => ApiResponse::ok(serde_json::json!({ "outcome": format!("{outcome:?}") }))
            .into_response(),
        Err(e) => state_error(&e).into_response(),
    }
}

// ── Commands ───────────────────────────────────────────────────

/// GET /api/v1/agents/{agent_id}/commands
pub async fn poll_commands(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
) -> impl IntoResponse {
    match state.queue.poll(&agent_id, epoch_secs()) {
        Ok(commands) => ApiResponse::ok(commands).into_response(),
        Err(e) => state_error(&e).into_response(),
    }
}

/// Execution report body.
#[derive(Deserialize)]
pub struct ExecutionReport {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub post_state: Option<serde_json::Value>,
}

/// POST /api/v1/commands/{id}/execution
pub async fn report_execution(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(report): Json<ExecutionReport>,
) -> impl IntoResponse {
    let now = epoch_secs();
    let ack = match state
        .queue
        .ack(&id, report.success, report.error, report.post_state, now)
    {
        Ok(ack) => ack,
        Err(e) => return state_error(&e).into_response(),
    };

    // Only the first acknowledgement drives state finalization.
    if ack.newly_acked()
        && let Err(e) = state
            .orchestrator
            .finalize_command(ack.command(), report.success, now)
    {
        warn!(command_id = %id, error = %e, "command finalization failed");
    }

    ApiResponse::ok(serde_json::json!({
        "command_id": ack.command().id,
        "status": ack.command().status,
        "deduplicated": !ack.newly_acked(),
    }))
    .into_response()
}

/// GET /api/v1/commands/expired
pub async fn list_expired_commands(State(state): State<ApiState>) -> impl IntoResponse {
    match state.queue.expired() {
        Ok(commands) => ApiResponse::ok(commands).into_response(),
        Err(e) => state_error(&e).into_response(),
    }
}

// ── Instances ──────────────────────────────────────────────────

/// GET /api/v1/instances
pub async fn list_instances(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_instances() {
        Ok(instances) => ApiResponse::ok(instances).into_response(),
        Err(e) => state_error(&e).into_response(),
    }
}

/// GET /api/v1/instances/{logical_id}
pub async fn get_instance(
    State(state): State<ApiState>,
    Path(logical_id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_instance(&logical_id) {
        Ok(Some(instance)) => ApiResponse::ok(instance).into_response(),
        Ok(None) => error_response("instance not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => state_error(&e).into_response(),
    }
}

// ── Pricing ────────────────────────────────────────────────────

/// Range query for the canonical series.
#[derive(Deserialize)]
pub struct PriceRangeQuery {
    #[serde(default)]
    pub from: u64,
    #[serde(default = "default_to")]
    pub to: u64,
}

fn default_to() -> u64 {
    u64::MAX
}

/// GET /api/v1/pools/{pool_id}/prices
pub async fn get_pool_prices(
    State(state): State<ApiState>,
    Path(pool_id): Path<String>,
    Query(range): Query<PriceRangeQuery>,
) -> impl IntoResponse {
    match state.store.list_price_points(&pool_id, range.from, range.to) {
        Ok(points) => ApiResponse::ok(points).into_response(),
        Err(e) => state_error(&e).into_response(),
    }
}

// ── Failover history & modes ───────────────────────────────────

/// GET /api/v1/agents/{agent_id}/events
pub async fn list_events(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
) -> impl IntoResponse {
    match state.store.list_failover_events(&agent_id, 100) {
        Ok(events) => ApiResponse::ok(events).into_response(),
        Err(e) => state_error(&e).into_response(),
    }
}

/// Mode change body.
#[derive(Deserialize)]
pub struct ModeRequest {
    /// "manual" or "automatic".
    pub mode: String,
    pub enabled: bool,
}

/// GET /api/v1/agents/{agent_id}/mode
///
/// The invariant check runs on every read: both flags being set is a
/// bootstrap-race artifact that gets alarmed and surfaced here, never
/// silently cleared.
pub async fn get_mode(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
) -> impl IntoResponse {
    let control = match state.store.get_agent_control(&agent_id) {
        Ok(Some(control)) => control,
        Ok(None) => {
            return error_response("no control state for agent", StatusCode::NOT_FOUND)
                .into_response();
        }
        Err(e) => return state_error(&e).into_response(),
    };
    let invariant_violated = match state.orchestrator.check_mode_invariant(&agent_id) {
        Ok(violated) => violated,
        Err(e) => return state_error(&e).into_response(),
    };
    ApiResponse::ok(serde_json::json!({
        "control": control,
        "invariant_violated": invariant_violated,
    }))
    .into_response()
}

/// POST /api/v1/agents/{agent_id}/mode
pub async fn set_mode(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
    Json(req): Json<ModeRequest>,
) -> impl IntoResponse {
    let now = epoch_secs();
    let result = match (req.mode.as_str(), req.enabled) {
        ("manual", true) => state.orchestrator.enable_manual_replica(&agent_id, now),
        ("manual", false) => state.orchestrator.disable_manual_replica(&agent_id, now),
        ("automatic", true) => state.orchestrator.enable_auto_emergency(&agent_id, now),
        ("automatic", false) => state.orchestrator.disable_auto_emergency(&agent_id, now),
        _ => {
            return error_response("mode must be \"manual\" or \"automatic\"", StatusCode::UNPROCESSABLE_ENTITY)
                .into_response();
        }
    };
    match result {
        Ok(control) => ApiResponse::ok(control).into_response(),
        Err(e) => state_error(&e).into_response(),
    }
}

// ── Switch evaluation ──────────────────────────────────────────

/// Evaluation request: candidate discounted pool vs. stable price.
#[derive(Deserialize)]
pub struct EvaluateRequest {
    pub candidate_pool: String,
    pub stable_price: f64,
}

/// POST /api/v1/agents/{agent_id}/evaluate
///
/// Runs the decision gateway over the canonical series and, on a switch
/// recommendation, enqueues a `SwitchPool` command keyed to the latest
/// consolidated bucket — retrying the evaluation cannot duplicate the
/// command.
pub async fn evaluate_agent(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
    Json(req): Json<EvaluateRequest>,
) -> impl IntoResponse {
    let now = epoch_secs();

    let instance = match state.store.active_primary_for_agent(&agent_id) {
        Ok(Some(instance)) => instance,
        Ok(None) => return error_response("no active primary for agent", StatusCode::NOT_FOUND).into_response(),
        Err(e) => return state_error(&e).into_response(),
    };
    let prices = match state.store.list_price_points(&req.candidate_pool, 0, u64::MAX) {
        Ok(points) => points,
        Err(e) => return state_error(&e).into_response(),
    };

    let ctx = DecisionContext {
        instance: instance.clone(),
        prices,
        stable_price: req.stable_price,
        now,
    };
    let recommendation = match state.gateway.decide(&ctx).await {
        Ok(rec) => rec,
        Err(e) => return state_error(&e).into_response(),
    };

    let mut command_id = None;
    let mut deduplicated = false;
    if recommendation.action == RecommendedAction::Switch
        && let Some(target) = recommendation.target_pool.clone()
    {
        let bucket = ctx.latest_point().map(|p| p.bucket).unwrap_or_default();
        let request_id = derive_request_id(
            CommandKind::SwitchPool,
            &agent_id,
            &format!("{target}:{bucket}"),
        );
        let action = format!("switch to {target} enqueued");
        let enq = match state.queue.enqueue(
            &agent_id,
            CommandKind::SwitchPool,
            serde_json::json!({
                "instance_id": instance.logical_id,
                "target_pool": target,
                "est_savings_per_hour": recommendation.est_savings_per_hour,
            }),
            request_id,
            CommandPriority::Scheduled,
            Some(serde_json::to_value(&instance).unwrap_or_default()),
            now,
        ) {
            Ok(enq) => enq,
            Err(e) => return state_error(&e).into_response(),
        };
        deduplicated = enq.deduplicated;
        command_id = Some(enq.command.id.clone());

        if let Err(e) = state.store.append_failover_event(&FailoverEvent {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.clone(),
            instance_logical_id: instance.logical_id.clone(),
            cause: FailoverCause::CostOptimization,
            action,
            deduplicated,
            elapsed_ms: 0,
            created_at: now,
        }) {
            warn!(%agent_id, error = %e, "failed to record evaluation event");
        }
    }

    ApiResponse::ok(serde_json::json!({
        "recommendation": recommendation,
        "command_id": command_id,
        "deduplicated": deduplicated,
    }))
    .into_response()
}
