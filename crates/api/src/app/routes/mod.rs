use axum::Router;

pub mod admin;
pub mod health;

/// Router for every rate-limited endpoint.
pub fn router() -> Router {
    Router::new().nest("/admin", admin::router())
}
