//! # Worker Wire Protocol
//!
//! This module defines the HTTP wire contract between the mediasort daemon
//! and container-plugin workers. Every type here maps to a request or
//! response body exchanged over one of the worker endpoints.
//!
//! ## Overview
//!
//! A worker is a sandboxed process that extracts or transforms metadata for
//! one media file per request. The daemon consumes four endpoints on each
//! worker instance:
//!
//! - `GET /health` → [`HealthResponse`]: liveness and readiness probe
//! - `GET /manifest` → [`PluginManifest`]: identity, priority, dependencies
//! - `POST /configure` → [`ConfigureResponse`]: push persisted configuration
//! - `POST /process` → [`ProcessResponse`]: dispatch one task
//!
//! Processing is asynchronous: accepting a `/process` request obligates the
//! worker to later POST a [`CallbackPayload`] to the `callback_url` carried
//! in the request. The callback is the task's termination signal.
//!
//! ## Wire format
//!
//! All bodies are JSON with camelCase field names. Example `/process`
//! exchange:
//!
//! ```json
//! {
//!   "taskId": "6e9c2f1a-...",
//!   "cid": "b3a1...",
//!   "filePath": "/library/movie.mkv",
//!   "callbackUrl": "http://core:3000/api/plugins/callback",
//!   "metaCoreUrl": "http://core:3000",
//!   "existingMeta": { "size": 731906048 }
//! }
//! ```
//!
//! answered by `{"status": "accepted", "taskId": "6e9c2f1a-..."}`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which of the two scheduler tiers a task runs on.
///
/// Fast tasks starve background tasks: the background queue only
/// makes progress while the fast queue is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    /// High-priority tier for cheap extraction work.
    Fast,
    /// Low-priority tier for expensive work (full decodes, transcodes).
    Background,
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueKind::Fast => write!(f, "fast"),
            QueueKind::Background => write!(f, "background"),
        }
    }
}

/// File-selection filter advertised by a plugin.
///
/// A plugin only receives tasks for files matching its filter. Empty lists
/// match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginFilter {
    /// Accepted file extensions, lowercase, without the dot.
    pub ext: Vec<String>,
    /// Accepted MIME type prefixes.
    pub mime: Vec<String>,
    /// Minimum file size in bytes.
    pub min: Option<u64>,
    /// Maximum file size in bytes.
    pub max: Option<u64>,
}

impl PluginFilter {
    /// Whether a file with the given extension and size passes this filter.
    pub fn accepts(&self, ext: &str, size: u64) -> bool {
        if !self.ext.is_empty() && !self.ext.iter().any(|e| e.eq_ignore_ascii_case(ext)) {
            return false;
        }
        if let Some(min) = self.min {
            if size < min {
                return false;
            }
        }
        if let Some(max) = self.max {
            if size > max {
                return false;
            }
        }
        true
    }
}

/// Self-description served by a worker at `GET /manifest`.
///
/// The manifest is immutable for a given worker instance: the daemon fetches
/// it once per spawn and treats it as the plugin's contract until restart.
/// `dependencies` must resolve to known plugin ids over the active set;
/// activation performs a topological sort and rejects cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Unique plugin identifier, e.g. `"ffprobe"`.
    pub id: String,
    /// Plugin version string.
    pub version: String,
    /// Relative priority among plugins (lower runs earlier in listings).
    #[serde(default)]
    pub priority: i32,
    /// Queue tier used when no measured classification exists.
    #[serde(default = "default_queue")]
    pub default_queue: QueueKind,
    /// Plugin ids whose output this plugin reads. Dispatch for a file waits
    /// for each dependency to settle before this plugin runs.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Per-task callback deadline in milliseconds. Falls back to the
    /// daemon's default (60 000 ms) when absent.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Number of replicas to spawn. Defaults to 1.
    #[serde(default)]
    pub instances: Option<u32>,
    /// File-selection filter; `None` matches every file.
    #[serde(default)]
    pub filter: Option<PluginFilter>,
    /// JSON schema of the plugin's configuration object.
    #[serde(default)]
    pub config_schema: Option<serde_json::Value>,
    /// JSON schema of the metadata the plugin writes.
    #[serde(default)]
    pub output_schema: Option<serde_json::Value>,
}

fn default_queue() -> QueueKind {
    QueueKind::Fast
}

impl PluginManifest {
    /// Replica count with the `≥ 1` floor applied.
    pub fn instance_count(&self) -> u32 {
        self.instances.unwrap_or(1).max(1)
    }
}

/// Health probe status reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Body of `GET /health`.
///
/// An instance is considered healthy if and only if `status` is `healthy`
/// and `ready` is true.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub ready: bool,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy && self.ready
    }
}

/// Body of `POST /configure`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureRequest {
    /// Opaque plugin configuration, validated by the plugin against its
    /// `config_schema`.
    pub config: serde_json::Value,
}

/// Response to `POST /configure`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Body of `POST /process`: one task dispatched to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequest {
    /// Task identifier; echoed back in the callback.
    pub task_id: Uuid,
    /// Content identifier of the file (identity hash).
    pub cid: String,
    /// Absolute path of the file inside the worker's mount.
    pub file_path: String,
    /// Where the worker must POST its [`CallbackPayload`].
    pub callback_url: String,
    /// Base URL of the metadata core, for plugins that read other records.
    pub meta_core_url: String,
    /// Metadata already persisted for this file, including output of any
    /// dependencies that settled before dispatch.
    #[serde(default)]
    pub existing_meta: serde_json::Value,
}

/// Whether the worker took the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Accepted,
    Rejected,
}

/// Synchronous response to `POST /process`.
///
/// `accepted` means the worker owns the task and will deliver a callback;
/// anything else fails the task immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResponse {
    pub status: ProcessStatus,
    pub task_id: Uuid,
    #[serde(default)]
    pub error: Option<String>,
}

/// Terminal outcome the worker reports for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackStatus {
    /// The plugin processed the file and persisted its output.
    Completed,
    /// The plugin attempted the file and failed.
    Failed,
    /// The plugin declined the file (filter mismatch discovered late,
    /// nothing to do). Terminal, treated as success.
    Skipped,
}

/// Worker-initiated termination signal for a task, POSTed to the daemon's
/// callback ingress.
///
/// Matched to exactly one outstanding task by `task_id`; callbacks for
/// unknown or expired tasks are acknowledged and dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    pub task_id: Uuid,
    pub plugin_id: String,
    /// Content identifier the task was dispatched with.
    pub cid: String,
    pub status: CallbackStatus,
    /// Wall-clock processing time measured by the worker.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Failure detail when `status` is `failed`.
    #[serde(default)]
    pub error: Option<String>,
    /// Explanation when `status` is `skipped`.
    #[serde(default)]
    pub reason: Option<String>,
}
