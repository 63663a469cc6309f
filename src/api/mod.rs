// HTTP surface: agent output for the monitoring backend plus executor introspection

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use http::header::CONTENT_TYPE;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::app::{RunReport, RunRequest, Watchpost};

pub type AppState = Arc<Watchpost>;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(agent_output))
        .route("/healthcheck", get(health_check))
        .route("/executor/statistics", get(executor_statistics))
        .route("/executor/errored", get(executor_errored))
        .route("/run", post(run_checks))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

async fn health_check() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Run all due checks and answer in the Checkmk agent format.
async fn agent_output(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.run_and_render(&RunRequest::all()).await;
    ([(CONTENT_TYPE, "text/plain; charset=utf-8")], body)
}

async fn executor_statistics(State(state): State<AppState>) -> Json<Value> {
    let statistics = state.statistics();
    Json(serde_json::json!({
        "statistics": statistics,
        "dedup_ratio": statistics.dedup_ratio(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn executor_errored(State(state): State<AppState>) -> Json<Value> {
    let errors = state.errors();
    Json(serde_json::json!({
        "errors": errors,
        "count": errors.len(),
    }))
}

/// Run a subset of checks (or all, when `checks` is omitted) and return the report.
async fn run_checks(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunReport>, (StatusCode, Json<Value>)> {
    if let Some(ids) = &request.checks {
        let unknown: Vec<_> = ids
            .iter()
            .filter(|id| state.registry().get(id.as_str()).is_none())
            .collect();
        if !unknown.is_empty() {
            warn!(?unknown, "Run requested for unknown checks");
            return Err((
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": "unknown checks", "checks": unknown })),
            ));
        }
    }

    Ok(Json(state.run(&request).await))
}
