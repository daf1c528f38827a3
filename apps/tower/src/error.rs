//! Centralized error types for the tower binary.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type for the tower process.
#[derive(Debug, Error)]
pub enum TowerError {
    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A station event failed schema validation.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// A source-graph control request named a node that does not exist.
    #[error("Unknown source node: {0}")]
    UnknownSource(String),

    /// A source-graph control request was structurally valid but not
    /// applicable (e.g. popping an empty override stack).
    #[error("Source control rejected: {0}")]
    SourceControl(String),

    /// Configuration error detected at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Fallback file could not be loaded or has the wrong format.
    #[error("Fallback file error: {0}")]
    FallbackFile(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TowerError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidEvent(_) => "invalid_event",
            Self::UnknownSource(_) => "unknown_source",
            Self::SourceControl(_) => "source_control_rejected",
            Self::Configuration(_) => "configuration_error",
            Self::FallbackFile(_) => "fallback_file_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_)
            | Self::InvalidEvent(_)
            | Self::UnknownSource(_)
            | Self::SourceControl(_) => StatusCode::BAD_REQUEST,
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for tower-wide operations.
pub type TowerResult<T> = Result<T, TowerError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for TowerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}
