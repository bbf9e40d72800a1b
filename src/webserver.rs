use crate::metrics::DriftMetrics;
use crate::sink::ResultStore;
use crate::state::ControllerContext;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::{Router, http::StatusCode};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<ControllerContext>,
    pub results: Arc<ResultStore>,
    pub metrics: Arc<DriftMetrics>,
}

pub async fn readiness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

/// Starts a version check in the background.
pub async fn run_check(State(state): State<AppState>) -> impl IntoResponse {
    let Some(guard) = state.controller.try_begin_cycle() else {
        return (StatusCode::CONFLICT, "version check already running");
    };
    info!("Version check triggered via HTTP");
    let controller = Arc::clone(&state.controller);
    tokio::spawn(async move {
        controller.run_cycle(guard).await;
    });
    (StatusCode::ACCEPTED, "version check started")
}

pub async fn reload_config(State(state): State<AppState>) -> Response {
    match state.controller.reload_config().await {
        Ok(()) => (StatusCode::OK, "config reloaded").into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("config reload failed: {:#}", e),
        )
            .into_response(),
    }
}

pub async fn latest_results(State(state): State<AppState>) -> Response {
    match state.results.latest().await {
        Some(batch) => Json(batch).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    match state.metrics.encode_text() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {:?}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/run", post(run_check))
        .route("/reload", post(reload_config))
        .route("/results", get(latest_results))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}
