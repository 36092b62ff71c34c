//! Control API
//!
//! REST surface over the coordination core: status, mode control,
//! decision audit and explanations, health, and the improvement pipeline.
//! Swagger UI is served at /swagger-ui.

pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use steward_core::confidence::ConfidenceManager;
use steward_core::evaluator::Evaluator;
use steward_core::executor::ActionExecutor;
use steward_core::governance::GovernanceLoop;
use steward_core::health::HealthMonitor;
use steward_core::improvement::ImprovementEngine;
use steward_core::memory::MemoryStore;
use steward_core::orchestrator::{ModeHandle, Orchestrator};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Shared handles behind every handler.
pub struct AppState {
    pub mode: ModeHandle,
    pub orchestrator: Arc<Orchestrator>,
    pub governance: Arc<GovernanceLoop>,
    pub memory: Arc<MemoryStore>,
    pub confidence: Arc<ConfidenceManager>,
    pub evaluator: Arc<Evaluator>,
    pub executor: Arc<ActionExecutor>,
    pub health: Arc<HealthMonitor>,
    pub improvement: Arc<ImprovementEngine>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::status,
        handlers::pause,
        handlers::resume,
        handlers::recover,
        handlers::health,
        handlers::decisions_audit,
        handlers::decision_explain,
        handlers::decision_preview,
        handlers::improvements_list,
        handlers::improvement_propose,
        handlers::improvement_rollback,
    ),
    components(schemas(
        handlers::StewardStatus,
        handlers::ThresholdView,
        handlers::PauseRequest,
        handlers::PreviewRequest,
        handlers::PreviewResponse,
        handlers::ProposeRequest,
        handlers::ProposeResponse,
        handlers::ErrorResponse,
    )),
    tags(
        (name = "status", description = "Daemon and core status"),
        (name = "mode", description = "Operating mode control"),
        (name = "decisions", description = "Decision audit and preview"),
        (name = "improvements", description = "Self-improvement pipeline"),
    )
)]
pub struct ApiDoc;

/// Build the API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/api/v1/status", get(handlers::status))
        .route("/api/v1/mode/pause", post(handlers::pause))
        .route("/api/v1/mode/resume", post(handlers::resume))
        .route("/api/v1/mode/recover", post(handlers::recover))
        .route("/api/v1/health", get(handlers::health))
        .route("/api/v1/decisions/audit", get(handlers::decisions_audit))
        .route("/api/v1/decisions/explain", get(handlers::decision_explain))
        .route("/api/v1/decisions/preview", post(handlers::decision_preview))
        .route(
            "/api/v1/improvements",
            get(handlers::improvements_list).post(handlers::improvement_propose),
        )
        .route(
            "/api/v1/improvements/rollback",
            post(handlers::improvement_rollback),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
