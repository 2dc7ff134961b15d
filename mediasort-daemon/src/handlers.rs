//! # HTTP Handlers
//!
//! Endpoint handlers for the daemon's HTTP surface:
//!
//! - `POST /api/plugins/callback`: worker callback ingress. Answers 204
//!   on acceptance (including unknown task ids, which are logged and
//!   dropped) and 503 when no scheduler is running.
//! - `POST /api/files`: discovery ingress feeding the pipeline.
//! - `GET /health`: liveness.
//! - `GET /stats`: scheduler, pipeline and state counters.
//! - `GET /admin/*`: plugin population, gate control, drain, file state
//!   and the failure log.

use crate::error::DaemonError;
use crate::server::AppState;
use crate::state::FilePhase;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use mediasort_worker_sdk::protocol::CallbackPayload;
use serde::Deserialize;
use serde_json::{json, Value};

/// `GET /health`
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `POST /api/plugins/callback`
///
/// Worker-initiated task termination. Unknown task ids are acknowledged
/// and dropped; only a missing scheduler is an error.
pub async fn plugin_callback(
    State(state): State<AppState>,
    Json(payload): Json<CallbackPayload>,
) -> Result<StatusCode, DaemonError> {
    let Some(scheduler) = &state.scheduler else {
        return Err(DaemonError::SchedulerUnavailable);
    };
    scheduler.handle_callback(payload);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub path: String,
}

/// `POST /api/files`: feed one discovered file into the pipeline.
pub async fn ingest_file(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Result<StatusCode, DaemonError> {
    if request.path.is_empty() {
        return Err(DaemonError::InvalidRequest {
            message: "path cannot be empty".to_string(),
        });
    }
    state.pipeline.ingest(request.path);
    Ok(StatusCode::ACCEPTED)
}

/// `GET /stats`
pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "scheduler": state.scheduler.as_ref().map(|s| s.stats()),
        "pipeline": state.pipeline.stats(),
        "files": state.file_state.snapshot(),
    }))
}

/// `GET /admin/plugins`
pub async fn list_plugins(State(state): State<AppState>) -> Json<Value> {
    let plugins = state
        .workers
        .as_ref()
        .map(|workers| workers.snapshot())
        .unwrap_or_default();
    Json(json!({ "plugins": plugins }))
}

#[derive(Debug, Deserialize)]
pub struct RestartRequest {
    pub plugin_id: String,
}

/// `POST /admin/plugins/restart`: stop and respawn one plugin's replicas.
pub async fn restart_plugin(
    State(state): State<AppState>,
    Json(request): Json<RestartRequest>,
) -> Result<Json<Value>, DaemonError> {
    let Some(workers) = &state.workers else {
        return Err(DaemonError::SchedulerUnavailable);
    };
    workers
        .restart(&request.plugin_id)
        .await
        .map_err(|error| DaemonError::Internal {
            message: error.to_string(),
        })?;
    Ok(Json(json!({ "restarted": request.plugin_id })))
}

/// `GET /admin/gate`
pub async fn gate_status(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.gate.status()).unwrap_or(Value::Null))
}

#[derive(Debug, Deserialize)]
pub struct GateRequest {
    pub open: bool,
}

/// `POST /admin/gate`
pub async fn set_gate(
    State(state): State<AppState>,
    Json(request): Json<GateRequest>,
) -> Json<Value> {
    state.gate.set_open(request.open);
    Json(serde_json::to_value(state.gate.status()).unwrap_or(Value::Null))
}

#[derive(Debug, Deserialize)]
pub struct DrainRequest {
    /// Maximum time to wait for both queues to empty, in milliseconds.
    #[serde(default = "default_drain_ms")]
    pub timeout_ms: u64,
}

fn default_drain_ms() -> u64 {
    120_000
}

/// `POST /admin/drain`: close the gate and wait for in-flight work.
pub async fn drain(
    State(state): State<AppState>,
    Json(request): Json<DrainRequest>,
) -> Result<Json<Value>, DaemonError> {
    let Some(scheduler) = &state.scheduler else {
        return Err(DaemonError::SchedulerUnavailable);
    };
    scheduler.set_gate(false);
    let drained = scheduler
        .wait_for_empty(std::time::Duration::from_millis(request.timeout_ms))
        .await;
    Ok(Json(json!({ "drained": drained, "gate": state.gate.status() })))
}

/// `GET /admin/files`
pub async fn list_files(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "files": state.file_state.snapshot() }))
}

/// `GET /admin/failures`
pub async fn list_failures(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "failures": state.file_state.failed_files() }))
}

#[derive(Debug, Deserialize)]
pub struct RetryRequest {
    pub path: String,
}

/// Re-run a retried file at its resume phase. A file that failed during
/// the full-hash phase resumes there; anything earlier goes back through
/// validation.
fn resume_file(state: &AppState, path: String, phase: FilePhase) {
    let identity = state
        .file_state
        .get(&path)
        .and_then(|record| record.file_hash);
    match (phase, identity) {
        (FilePhase::Hash, Some(identity)) => state.pipeline.resume_background(path, identity),
        _ => state.pipeline.ingest(path),
    }
}

/// `POST /admin/files/retry`: reset one failed file and re-run it.
pub async fn retry_file(
    State(state): State<AppState>,
    Json(request): Json<RetryRequest>,
) -> Result<Json<Value>, DaemonError> {
    let Some(phase) = state.file_state.retry_file(&request.path) else {
        return Err(DaemonError::UnknownFile {
            path: request.path.clone(),
        });
    };
    resume_file(&state, request.path.clone(), phase);
    Ok(Json(json!({ "path": request.path, "resumed_at": phase })))
}

/// `POST /admin/files/retry-all`: reset every failed file.
pub async fn retry_all_failed(State(state): State<AppState>) -> Json<Value> {
    let resumed: Vec<(String, FilePhase)> = state.file_state.retry_all_failed();
    for (path, phase) in &resumed {
        resume_file(&state, path.clone(), *phase);
    }
    Json(json!({ "retried": resumed.len() }))
}
