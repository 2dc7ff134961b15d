//! # Daemon Error Types
//!
//! Error taxonomy for the daemon's HTTP surface and internals, with
//! automatic mapping to HTTP responses for handler use.
//!
//! The mapping follows the callback-ingress contract: a missing scheduler
//! answers 503, malformed payloads answer 400, and internal faults answer
//! 500 with a typed body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use mediasort_worker_sdk::WorkerError;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by daemon components and HTTP handlers.
#[derive(Error, Debug)]
pub enum DaemonError {
    /// Errors talking to a worker instance
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Invalid or malformed request errors
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// The scheduler is not running (workers disabled or shut down)
    #[error("scheduler unavailable")]
    SchedulerUnavailable,

    /// A named file is not tracked by the state manager
    #[error("unknown file: {path}")]
    UnknownFile { path: String },

    /// Configuration and setup errors
    #[error("configuration error: {message}")]
    Config { message: String },

    /// JSON serialization and deserialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal daemon errors
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            DaemonError::InvalidRequest { .. } => (StatusCode::BAD_REQUEST, "invalid_request"),
            DaemonError::SchedulerUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "scheduler_unavailable")
            }
            DaemonError::UnknownFile { .. } => (StatusCode::NOT_FOUND, "unknown_file"),
            DaemonError::Config { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "configuration_error"),
            DaemonError::Worker(_) => (StatusCode::BAD_GATEWAY, "worker_error"),
            DaemonError::Serialization(_) => (StatusCode::BAD_REQUEST, "serialization_error"),
            DaemonError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
                "code": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}
