//! Error responses in the Prometheus HTTP API envelope.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// Build `{"status":"error","errorType":...,"error":...}` with `status`.
pub(crate) fn api_error(status: StatusCode, error_type: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "status": "error",
            "errorType": error_type,
            "error": message.into(),
        })),
    )
        .into_response()
}
