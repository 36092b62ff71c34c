//! API handlers

use super::AppState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use steward_core::error::CoreError;
use steward_core::types::{CriterionValue, DecisionContext, DecisionLevel, RecordKind};
use tracing::debug;
use utoipa::ToSchema;
use uuid::Uuid;

/// Error payload returned by every endpoint.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub status: u16,
    pub message: String,
    pub error_type: String,
}

impl ErrorResponse {
    pub fn from_core(error: &CoreError) -> (StatusCode, Self) {
        let status = match error {
            CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CoreError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            CoreError::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Transient(_) => StatusCode::BAD_GATEWAY,
            CoreError::Inconsistent(_) | CoreError::Fatal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Self {
                status: status.as_u16(),
                message: error.to_string(),
                error_type: error.kind().to_string(),
            },
        )
    }
}

fn core_error(error: &CoreError) -> Response {
    let (status, body) = ErrorResponse::from_core(error);
    (status, Json(body)).into_response()
}

fn not_found(message: impl Into<String>) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            status: StatusCode::NOT_FOUND.as_u16(),
            message: message.into(),
            error_type: "not_found".to_string(),
        }),
    )
        .into_response()
}

/// Per-level threshold view.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ThresholdView {
    pub advisory: f64,
    pub autonomous: f64,
    pub emergency: f64,
}

/// Core status response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StewardStatus {
    pub mode: String,
    pub ticks: u64,
    pub ticks_skipped: u64,
    pub total_decisions: u64,
    pub approved: u64,
    pub rejected: u64,
    pub thresholds: ThresholdView,
    pub memory_records: usize,
    pub executor_queue_depth: usize,
}

/// Get core status
#[utoipa::path(
    get,
    path = "/api/v1/status",
    responses(
        (status = 200, description = "Core status", body = StewardStatus)
    ),
    tag = "status"
)]
pub async fn status(State(state): State<Arc<AppState>>) -> Response {
    let stats = state.governance.stats();
    let status = StewardStatus {
        mode: state.mode.current().as_str().to_string(),
        ticks: stats.ticks,
        ticks_skipped: stats.ticks_skipped,
        total_decisions: stats.decisions_total,
        approved: stats.decisions_approved,
        rejected: stats.decisions_rejected,
        thresholds: ThresholdView {
            advisory: state.confidence.threshold_for(DecisionLevel::Advisory),
            autonomous: state.confidence.threshold_for(DecisionLevel::Autonomous),
            emergency: state.confidence.threshold_for(DecisionLevel::Emergency),
        },
        memory_records: state.memory.long_term_len(),
        executor_queue_depth: state.executor.queue_depth(),
    };
    Json(status).into_response()
}

/// Pause request body.
#[derive(Debug, Deserialize, ToSchema)]
pub struct PauseRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Pause the core
#[utoipa::path(
    post,
    path = "/api/v1/mode/pause",
    request_body = PauseRequest,
    responses(
        (status = 200, description = "Paused", body = StewardStatus),
        (status = 400, description = "Transition refused", body = ErrorResponse)
    ),
    tag = "mode"
)]
pub async fn pause(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PauseRequest>,
) -> Response {
    let reason = request.reason.unwrap_or_else(|| "operator request".to_string());
    debug!(reason, "pause requested");
    match state.orchestrator.pause(&reason).await {
        Ok(()) => status(State(state)).await,
        Err(e) => core_error(&e),
    }
}

/// Resume the core
#[utoipa::path(
    post,
    path = "/api/v1/mode/resume",
    responses(
        (status = 200, description = "Resumed", body = StewardStatus),
        (status = 400, description = "Transition refused", body = ErrorResponse)
    ),
    tag = "mode"
)]
pub async fn resume(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.resume().await {
        Ok(()) => status(State(state)).await,
        Err(e) => core_error(&e),
    }
}

/// Acknowledge an emergency and recover into Paused
#[utoipa::path(
    post,
    path = "/api/v1/mode/recover",
    responses(
        (status = 200, description = "Recovered to paused", body = StewardStatus),
        (status = 400, description = "Transition refused", body = ErrorResponse)
    ),
    tag = "mode"
)]
pub async fn recover(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.recover().await {
        Ok(()) => status(State(state)).await,
        Err(e) => core_error(&e),
    }
}

/// Get the latest health snapshot
#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Latest health snapshot"),
        (status = 404, description = "No snapshot taken yet", body = ErrorResponse)
    ),
    tag = "status"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    match state.health.last_snapshot() {
        Some(snapshot) => Json(snapshot).into_response(),
        None => not_found("no health snapshot taken yet"),
    }
}

/// Query parameters for the audit log.
#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub last: Option<usize>,
}

/// Recent decisions, newest last
#[utoipa::path(
    get,
    path = "/api/v1/decisions/audit",
    params(
        ("last" = Option<usize>, Query, description = "Number of recent decisions (default 100)")
    ),
    responses(
        (status = 200, description = "Recent decision contexts")
    ),
    tag = "decisions"
)]
pub async fn decisions_audit(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuditQuery>,
) -> Response {
    let last = params.last.unwrap_or(100);
    let mut records = state.memory.range(
        RecordKind::Decision,
        chrono::DateTime::<chrono::Utc>::MIN_UTC,
        chrono::Utc::now() + chrono::Duration::seconds(1),
    );
    if records.len() > last {
        records.drain(..records.len() - last);
    }
    let payloads: Vec<serde_json::Value> = records.into_iter().map(|r| r.payload).collect();
    Json(payloads).into_response()
}

/// Query parameters for explanations.
#[derive(Debug, Deserialize)]
pub struct ExplainQuery {
    pub id: Uuid,
}

/// Explanation for a decision
#[utoipa::path(
    get,
    path = "/api/v1/decisions/explain",
    params(
        ("id" = String, Query, description = "Decision id")
    ),
    responses(
        (status = 200, description = "Explanation with confidence analysis"),
        (status = 404, description = "Unknown decision", body = ErrorResponse)
    ),
    tag = "decisions"
)]
pub async fn decision_explain(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ExplainQuery>,
) -> Response {
    match state.memory.load_decision(&params.id) {
        Some(record) => Json(record.explanation).into_response(),
        None => not_found(format!("no decision {}", params.id)),
    }
}

/// Dry-run evaluation request.
#[derive(Debug, Deserialize, ToSchema)]
pub struct PreviewRequest {
    /// One of advisory, autonomous, emergency.
    #[schema(value_type = String)]
    pub level: DecisionLevel,
    /// criterion name -> numeric [0,1] or category.
    #[schema(value_type = Object)]
    pub inputs: BTreeMap<String, CriterionValue>,
    #[serde(default)]
    pub proposer: Option<String>,
}

/// Dry-run evaluation response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PreviewResponse {
    pub weighted_score: f64,
    pub confidence: f64,
    pub risk: String,
    pub threshold: f64,
    pub would_execute: bool,
}

/// Evaluate a context without admitting any action
#[utoipa::path(
    post,
    path = "/api/v1/decisions/preview",
    request_body = PreviewRequest,
    responses(
        (status = 200, description = "Evaluation preview", body = PreviewResponse),
        (status = 400, description = "Malformed context", body = ErrorResponse)
    ),
    tag = "decisions"
)]
pub async fn decision_preview(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PreviewRequest>,
) -> Response {
    let mut context = DecisionContext::new(
        request.level,
        request.proposer.unwrap_or_else(|| "preview".to_string()),
    );
    context.inputs = request.inputs;

    match state.evaluator.evaluate(&context) {
        Ok(evaluation) => {
            let threshold = state.confidence.threshold_for(request.level);
            let would_execute = evaluation.confidence >= threshold
                && matches!(
                    state.mode.current(),
                    steward_core::types::OperatingMode::Normal
                        | steward_core::types::OperatingMode::Degraded
                );
            Json(PreviewResponse {
                weighted_score: evaluation.weighted_score,
                confidence: evaluation.confidence,
                risk: evaluation.risk.as_str().to_string(),
                threshold,
                would_execute,
            })
            .into_response()
        }
        Err(e) => core_error(&e),
    }
}

/// List improvement candidates
#[utoipa::path(
    get,
    path = "/api/v1/improvements",
    responses(
        (status = 200, description = "All candidates with states")
    ),
    tag = "improvements"
)]
pub async fn improvements_list(State(state): State<Arc<AppState>>) -> Response {
    Json(state.improvement.list()).into_response()
}

/// Candidate proposal body.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ProposeRequest {
    pub target_path: String,
    pub diff: String,
    pub motivation: String,
    #[serde(default)]
    pub tests_added: bool,
}

/// Candidate proposal receipt.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ProposeResponse {
    #[schema(value_type = String)]
    pub id: Uuid,
}

/// Propose an improvement candidate
#[utoipa::path(
    post,
    path = "/api/v1/improvements",
    request_body = ProposeRequest,
    responses(
        (status = 200, description = "Candidate queued", body = ProposeResponse),
        (status = 400, description = "Malformed candidate", body = ErrorResponse)
    ),
    tag = "improvements"
)]
pub async fn improvement_propose(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ProposeRequest>,
) -> Response {
    match state
        .improvement
        .propose(
            request.target_path,
            request.diff,
            request.motivation,
            request.tests_added,
        )
        .await
    {
        Ok(id) => Json(ProposeResponse { id }).into_response(),
        Err(e) => core_error(&e),
    }
}

/// Query parameters for rollback.
#[derive(Debug, Deserialize)]
pub struct RollbackQuery {
    pub id: Uuid,
}

/// Roll back an auto-merged candidate
#[utoipa::path(
    post,
    path = "/api/v1/improvements/rollback",
    params(
        ("id" = String, Query, description = "Candidate id")
    ),
    responses(
        (status = 200, description = "Rolled back (idempotent)"),
        (status = 400, description = "Candidate not rollbackable", body = ErrorResponse)
    ),
    tag = "improvements"
)]
pub async fn improvement_rollback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RollbackQuery>,
) -> Response {
    match state.improvement.rollback(params.id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => core_error(&e),
    }
}
