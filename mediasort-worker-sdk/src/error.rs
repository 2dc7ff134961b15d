//! # Worker Error Types
//!
//! Error types for the worker HTTP contract. Every failure mode of talking
//! to a container plugin is represented here so the daemon can classify
//! outcomes (transient worker error, rejection, timeout) without inspecting
//! strings.

use thiserror::Error;

/// Errors produced while talking to a worker instance over HTTP.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Transport-level failure (connection refused, DNS, TLS, non-2xx body).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The request did not complete within its deadline.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The worker answered `/process` with a status other than `accepted`.
    #[error("worker rejected task: {reason}")]
    Rejected { reason: String },

    /// The worker's health endpoint reported it is not ready for work.
    #[error("worker unhealthy: {message}")]
    Unhealthy { message: String },

    /// The worker answered with an HTTP status the contract does not allow.
    #[error("unexpected status code: {status}")]
    UnexpectedStatus { status: u16 },

    /// The response body did not match the wire contract.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The worker accepted a configuration push but reported failure.
    #[error("configuration rejected: {message}")]
    ConfigureFailed { message: String },
}

impl WorkerError {
    /// Whether this error leaves the instance selectable for future tasks.
    ///
    /// Only health-probe failures mark an instance unhealthy; a single
    /// rejected or timed-out dispatch fails the task but keeps the
    /// instance in rotation.
    pub fn is_transient(&self) -> bool {
        !matches!(self, WorkerError::Unhealthy { .. })
    }
}
