//! Operator endpoints for the job queue and rate limits.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;

use storefront_core::UserId;
use storefront_infra::ServiceRegistry;

use crate::app::errors::{json_error, service_error_to_response};

const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;
const MAX_DEAD_LETTER_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

pub fn router() -> Router {
    Router::new()
        .route("/jobs/stats", get(job_stats))
        .route("/jobs/dead-letters", get(dead_letters))
        .route("/rate-limits/users/:id/reset", post(reset_user_limits))
}

/// GET /admin/jobs/stats - queue depths; store failures are a 500
pub async fn job_stats(
    Extension(registry): Extension<Arc<ServiceRegistry>>,
) -> axum::response::Response {
    let queue = match registry.job_queue().await {
        Ok(queue) => queue,
        Err(e) => return service_error_to_response(e),
    };

    match queue.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => service_error_to_response(e),
    }
}

/// GET /admin/jobs/dead-letters?limit=N - newest entries first
pub async fn dead_letters(
    Extension(registry): Extension<Arc<ServiceRegistry>>,
    Query(query): Query<DeadLetterQuery>,
) -> axum::response::Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
        .min(MAX_DEAD_LETTER_LIMIT);

    let queue = match registry.job_queue().await {
        Ok(queue) => queue,
        Err(e) => return service_error_to_response(e),
    };

    match queue.dead_letters(limit).await {
        Ok(entries) => Json(json!({ "count": entries.len(), "entries": entries })).into_response(),
        Err(e) => service_error_to_response(e),
    }
}

/// POST /admin/rate-limits/users/:id/reset
pub async fn reset_user_limits(
    Extension(registry): Extension<Arc<ServiceRegistry>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let user: UserId = match id.parse() {
        Ok(user) => user,
        Err(_) => {
            return json_error(
                StatusCode::BAD_REQUEST,
                "invalid_user_id",
                "user id must be a non-negative integer",
            );
        }
    };

    let limiter = match registry.rate_limiter().await {
        Ok(limiter) => limiter,
        Err(e) => return service_error_to_response(e),
    };

    match limiter.reset_user_limits(user).await {
        Ok(removed) => Json(json!({ "user_id": user, "removed": removed })).into_response(),
        Err(e) => service_error_to_response(e),
    }
}
