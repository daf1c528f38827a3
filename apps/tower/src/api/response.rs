//! Small helpers for uniform JSON API responses.

use axum::response::{IntoResponse, Json};
use serde_json::{json, Value};

/// A bare success acknowledgement.
pub fn api_ok() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

/// A success response with a payload.
pub fn api_success(value: Value) -> impl IntoResponse {
    Json(value)
}
