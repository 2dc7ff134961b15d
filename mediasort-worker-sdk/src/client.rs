//! # Worker HTTP Client
//!
//! Typed wrapper over the four worker endpoints. One [`WorkerClient`] is
//! held per worker instance; all clients share a single connection pool
//! through a cloned `reqwest::Client`.
//!
//! ## Timeouts
//!
//! Each endpoint carries its own deadline, enforced here rather than on the
//! pooled client so one slow `/process` dispatch cannot inherit the short
//! health-probe budget:
//!
//! - health probe: caller-supplied, 5 s by convention
//! - manifest / configure: the client default (10 s)
//! - process dispatch: caller-supplied, 10 s by convention; the worker must
//!   answer `accepted` within it, actual processing continues async
//!
//! ## Usage
//!
//! ```rust
//! use mediasort_worker_sdk::client::WorkerClient;
//! use std::time::Duration;
//!
//! let client = WorkerClient::new("http://meta-plugin-ffprobe-0:8080")?;
//! let health = client.health(Duration::from_secs(5)).await?;
//! if health.is_healthy() {
//!     let manifest = client.manifest().await?;
//! }
//! ```

use crate::error::WorkerError;
use crate::protocol::{
    ConfigureRequest, ConfigureResponse, HealthResponse, PluginManifest, ProcessRequest,
    ProcessResponse, ProcessStatus,
};
use reqwest::Client;
use std::time::Duration;

/// Default deadline for manifest and configure calls.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client bound to one worker instance's base URL.
#[derive(Clone)]
pub struct WorkerClient {
    http: Client,
    base_url: String,
}

impl WorkerClient {
    /// Create a client with its own connection pool.
    pub fn new(base_url: impl Into<String>) -> Result<Self, WorkerError> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(WorkerError::Http)?;
        Ok(Self::with_http(http, base_url))
    }

    /// Create a client sharing an existing connection pool.
    ///
    /// The worker manager constructs one `reqwest::Client` and hands clones
    /// to every instance so sockets are reused across probes.
    pub fn with_http(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Base URL this client talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `GET /health` with the given probe deadline.
    pub async fn health(&self, timeout: Duration) -> Result<HealthResponse, WorkerError> {
        let resp = self
            .http
            .get(self.url("/health"))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_timeout(e, timeout))?;
        if !resp.status().is_success() {
            return Err(WorkerError::UnexpectedStatus {
                status: resp.status().as_u16(),
            });
        }
        Ok(resp.json::<HealthResponse>().await?)
    }

    /// `GET /manifest`.
    pub async fn manifest(&self) -> Result<PluginManifest, WorkerError> {
        let resp = self.http.get(self.url("/manifest")).send().await?;
        if !resp.status().is_success() {
            return Err(WorkerError::UnexpectedStatus {
                status: resp.status().as_u16(),
            });
        }
        Ok(resp.json::<PluginManifest>().await?)
    }

    /// `POST /configure`: push persisted plugin configuration.
    ///
    /// A `success: false` answer is surfaced as
    /// [`WorkerError::ConfigureFailed`].
    pub async fn configure(&self, config: serde_json::Value) -> Result<(), WorkerError> {
        let resp = self
            .http
            .post(self.url("/configure"))
            .json(&ConfigureRequest { config })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(WorkerError::UnexpectedStatus {
                status: resp.status().as_u16(),
            });
        }
        let body = resp.json::<ConfigureResponse>().await?;
        if !body.success {
            return Err(WorkerError::ConfigureFailed {
                message: body.error.unwrap_or_else(|| "unspecified".to_string()),
            });
        }
        Ok(())
    }

    /// `POST /process`: dispatch one task within `dispatch_timeout`.
    ///
    /// Returns `Ok` only when the worker answered `accepted`; a `rejected`
    /// answer becomes [`WorkerError::Rejected`] and a missed deadline
    /// becomes [`WorkerError::Timeout`].
    pub async fn process(
        &self,
        request: &ProcessRequest,
        dispatch_timeout: Duration,
    ) -> Result<ProcessResponse, WorkerError> {
        let resp = self
            .http
            .post(self.url("/process"))
            .timeout(dispatch_timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| classify_timeout(e, dispatch_timeout))?;
        if !resp.status().is_success() {
            return Err(WorkerError::UnexpectedStatus {
                status: resp.status().as_u16(),
            });
        }
        let body = resp.json::<ProcessResponse>().await?;
        if body.status != ProcessStatus::Accepted {
            let reason = body.error.unwrap_or_else(|| "worker rejected task".to_string());
            tracing::debug!(task = %request.task_id, url = %self.base_url, %reason, "dispatch rejected");
            return Err(WorkerError::Rejected { reason });
        }
        tracing::trace!(task = %request.task_id, url = %self.base_url, "dispatch accepted");
        Ok(body)
    }
}

fn classify_timeout(err: reqwest::Error, timeout: Duration) -> WorkerError {
    if err.is_timeout() {
        WorkerError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    } else {
        WorkerError::Http(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CallbackStatus;
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn health_decodes_contract_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "healthy",
                "ready": true,
                "version": "1.4.2"
            })))
            .mount(&server)
            .await;

        let client = WorkerClient::new(server.uri()).unwrap();
        let health = client.health(Duration::from_secs(5)).await.unwrap();
        assert!(health.is_healthy());
        assert_eq!(health.version.as_deref(), Some("1.4.2"));
    }

    #[tokio::test]
    async fn process_accepts() {
        let server = MockServer::start().await;
        let task_id = Uuid::new_v4();
        Mock::given(method("POST"))
            .and(path("/process"))
            .and(body_partial_json(json!({ "taskId": task_id })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "accepted",
                "taskId": task_id
            })))
            .mount(&server)
            .await;

        let client = WorkerClient::new(server.uri()).unwrap();
        let request = ProcessRequest {
            task_id,
            cid: "cid-1".to_string(),
            file_path: "/library/a.mkv".to_string(),
            callback_url: "http://core/api/plugins/callback".to_string(),
            meta_core_url: "http://core".to_string(),
            existing_meta: json!({}),
        };
        let resp = client
            .process(&request, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(resp.task_id, task_id);
    }

    #[tokio::test]
    async fn process_rejection_is_an_error() {
        let server = MockServer::start().await;
        let task_id = Uuid::new_v4();
        Mock::given(method("POST"))
            .and(path("/process"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "rejected",
                "taskId": task_id,
                "error": "queue full"
            })))
            .mount(&server)
            .await;

        let client = WorkerClient::new(server.uri()).unwrap();
        let request = ProcessRequest {
            task_id,
            cid: "cid-1".to_string(),
            file_path: "/library/a.mkv".to_string(),
            callback_url: "http://core/api/plugins/callback".to_string(),
            meta_core_url: "http://core".to_string(),
            existing_meta: json!(null),
        };
        let err = client
            .process(&request, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Rejected { reason } if reason == "queue full"));
    }

    #[tokio::test]
    async fn process_honours_dispatch_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/process"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(500))
                    .set_body_json(json!({ "status": "accepted", "taskId": Uuid::new_v4() })),
            )
            .mount(&server)
            .await;

        let client = WorkerClient::new(server.uri()).unwrap();
        let request = ProcessRequest {
            task_id: Uuid::new_v4(),
            cid: "cid-1".to_string(),
            file_path: "/library/a.mkv".to_string(),
            callback_url: "http://core/api/plugins/callback".to_string(),
            meta_core_url: "http://core".to_string(),
            existing_meta: json!(null),
        };
        let err = client
            .process(&request, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Timeout { timeout_ms: 50 }));
    }

    #[test]
    fn skipped_callbacks_parse() {
        let payload: crate::protocol::CallbackPayload = serde_json::from_value(json!({
            "taskId": Uuid::new_v4(),
            "pluginId": "subtitles",
            "cid": "cid-9",
            "status": "skipped",
            "reason": "no subtitle streams"
        }))
        .unwrap();
        assert_eq!(payload.status, CallbackStatus::Skipped);
        assert_eq!(payload.reason.as_deref(), Some("no subtitle streams"));
    }
}
