use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use storefront_infra::ServiceError;

pub fn service_error_to_response(err: ServiceError) -> axum::response::Response {
    match err {
        ServiceError::NotInitialized(component) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "service_unavailable",
            format!("{component} is not initialized"),
        ),
        ServiceError::Initialization { .. } => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", err.to_string())
        }
        ServiceError::Store(e) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
        ServiceError::Serialization(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialization_error", msg)
        }
        ServiceError::Deserialization(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "deserialization_error", msg)
        }
        ServiceError::RaceCondition(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    json_error_with(status, code, message, json!({}))
}

/// Like [`json_error`], with extra fields merged into the body.
pub fn json_error_with(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
    extra: serde_json::Value,
) -> axum::response::Response {
    let mut body = json!({
        "error": code,
        "message": message.into(),
    });
    if let (Some(body), serde_json::Value::Object(extra)) = (body.as_object_mut(), extra) {
        body.extend(extra);
    }
    (status, axum::Json(body)).into_response()
}
