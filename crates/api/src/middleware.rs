use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tracing::debug;

use storefront_core::UserId;
use storefront_infra::ServiceRegistry;
use storefront_infra::rate_limit::Remaining;

use crate::app::errors::json_error_with;
use crate::context::UserContext;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";
const UNKNOWN_IP: &str = "unknown";

/// Admission control in front of every rate-limited route.
///
/// Admits everything while the registry has no rate limiter, so an
/// uninitialized store never blocks traffic.
pub async fn rate_limit(
    State(registry): State<Arc<ServiceRegistry>>,
    req: Request,
    next: Next,
) -> Response {
    let limiter = match registry.rate_limiter().await {
        Ok(limiter) => limiter,
        Err(err) => {
            debug!(error = %err, "rate limiter unavailable; admitting request");
            return next.run(req).await;
        }
    };

    let user = req
        .extensions()
        .get::<UserContext>()
        .map(UserContext::user_id)
        .unwrap_or(UserId::ANONYMOUS);
    let ip = client_ip(&req);

    let allowed = limiter.allow(user, &ip).await;
    let remaining = limiter.remaining(user).await;
    let limit = limiter.user_rule().limit;

    if !allowed {
        let retry_after = remaining.reset_after.as_secs().max(1);
        let mut response = json_error_with(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit_exceeded",
            "too many requests",
            serde_json::json!({ "retry_after": retry_after }),
        );
        let headers = response.headers_mut();
        set_limit_headers(headers, limit, remaining);
        headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        return response;
    }

    let mut response = next.run(req).await;
    set_limit_headers(response.headers_mut(), limit, remaining);
    response
}

fn set_limit_headers(headers: &mut HeaderMap, limit: u32, remaining: Remaining) {
    let reset_after = i64::try_from(remaining.reset_after.as_secs()).unwrap_or(i64::MAX);
    let reset_at = Utc::now().timestamp().saturating_add(reset_after);
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_at));
}

/// First hop of `X-Forwarded-For`, then `X-Real-IP`, then the peer address.
pub fn client_ip(req: &Request) -> String {
    let from_header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    from_header(X_FORWARDED_FOR)
        .or_else(|| from_header(X_REAL_IP))
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| UNKNOWN_IP.to_string())
}
