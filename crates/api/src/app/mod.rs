//! Axum router wiring.
//!
//! - `routes/health.rs`: health, readiness and liveness probes
//! - `routes/admin.rs`: queue inspection and rate-limit resets
//! - `errors.rs`: consistent error responses

use std::sync::Arc;
use std::time::Instant;

use axum::{Extension, Router};
use tower::ServiceBuilder;

use storefront_infra::ServiceRegistry;

use crate::middleware;

pub mod errors;
pub mod routes;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so the
/// rate limiter can fall back to the peer address.
pub fn build_app(registry: Arc<ServiceRegistry>) -> Router {
    let limited = routes::router().layer(axum::middleware::from_fn_with_state(
        registry.clone(),
        middleware::rate_limit,
    ));

    Router::new()
        .merge(routes::health::router())
        .merge(limited)
        .layer(
            ServiceBuilder::new()
                .layer(Extension(registry))
                .layer(Extension(routes::health::StartedAt(Instant::now()))),
        )
}
