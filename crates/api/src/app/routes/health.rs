//! Health, readiness and liveness probes. Not rate limited.

use std::sync::Arc;
use std::time::Instant;

use axum::{Extension, Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use serde_json::json;

use storefront_infra::ServiceRegistry;

/// When this process started serving.
#[derive(Debug, Clone, Copy)]
pub struct StartedAt(pub Instant);

pub fn router() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
        .route("/health/live", get(live))
}

/// GET /health - per-component report; 503 unless every component is healthy
pub async fn health(Extension(registry): Extension<Arc<ServiceRegistry>>) -> impl IntoResponse {
    let report = registry.health_check().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// GET /health/ready
pub async fn ready(Extension(registry): Extension<Arc<ServiceRegistry>>) -> impl IntoResponse {
    if registry.health_check().await.is_healthy() {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready" })),
        )
    }
}

/// GET /health/live
pub async fn live(Extension(StartedAt(started)): Extension<StartedAt>) -> impl IntoResponse {
    Json(json!({
        "status": "alive",
        "uptime_secs": started.elapsed().as_secs(),
    }))
}
