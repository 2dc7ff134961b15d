//! # Mediasort Daemon Library
//!
//! A media-file metadata pipeline whose core is a two-tier plugin task
//! scheduler: work for each discovered file fans out to sandboxed worker
//! processes ("container plugins") under priority, dependency, and
//! backpressure constraints.
//!
//! ## Architecture
//!
//! - **`worker_manager`**: spawns and health-tracks N replicas of each
//!   plugin, routes selections round-robin over the healthy set
//! - **`scheduler`**: two cooperative queues (fast starves background),
//!   async dispatch/callback protocol, per-file dependency fence, and
//!   exactly-once `file:complete` emission
//! - **`pipeline`**: discovery → validation → identity hash → plugin
//!   fan-out → full hash, with batched VFS change notification and
//!   collision suppression
//! - **`state`**: per-file phase tracking with retries and a failure log
//! - **`gate`**: the admission flag behind safe drain
//! - **`events`**: the closed set of typed events every transition emits
//! - **`server`** / **`handlers`**: the axum surface: worker callback
//!   ingress, discovery ingress, stats and admin
//! - **`config`**: TOML + environment configuration of every knob
//!
//! External collaborators (the container runtime, the metadata KV store,
//! the change pub/sub channel) are traits (`runtime`, `store`,
//! `notifier`) with in-process defaults.
//!
//! ## Quick start
//!
//! ```rust
//! use mediasort_daemon::config::Config;
//! use mediasort_daemon::server::{create_server, Collaborators};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("mediasort.toml")?;
//!     let collaborators = Collaborators::from_config(&config);
//!     let (app, _state) = create_server(config, collaborators).await?;
//!     // serve `app` with axum
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod handlers;
pub mod hashing;
pub mod notifier;
pub mod pipeline;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod store;
pub mod worker_manager;

pub use server::create_server;

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::server::{create_server, Collaborators};
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use serde_json::Value;

    async fn test_server() -> TestServer {
        let mut config = Config::default();
        // No plugins configured; scheduler runs with an empty worker set
        config.workers.plugins.clear();
        let collaborators = Collaborators::from_config(&config);
        let (app, _state) = create_server(config, collaborators).await.unwrap();
        TestServer::new(app).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let server = test_server().await;
        let response = server.get("/health").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body = response.json::<Value>();
        assert_eq!(body["status"], "healthy");
        assert!(body["timestamp"].is_string());
        assert!(body["version"].is_string());
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let server = test_server().await;
        let response = server.get("/stats").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body = response.json::<Value>();
        assert!(body["scheduler"].is_object());
        assert!(body["pipeline"].is_object());
    }

    #[tokio::test]
    async fn test_gate_round_trip() {
        let server = test_server().await;

        let response = server.get("/admin/gate").await;
        assert_eq!(response.json::<Value>()["open"], true);

        let response = server
            .post("/admin/gate")
            .json(&serde_json::json!({ "open": false }))
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.json::<Value>()["open"], false);

        let response = server.get("/admin/gate").await;
        assert_eq!(response.json::<Value>()["open"], false);
    }

    #[tokio::test]
    async fn test_callback_unknown_task_is_dropped_with_204() {
        let server = test_server().await;
        let response = server
            .post("/api/plugins/callback")
            .json(&serde_json::json!({
                "taskId": uuid::Uuid::new_v4(),
                "pluginId": "ghost",
                "cid": "none",
                "status": "completed"
            }))
            .await;
        assert_eq!(response.status_code(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_callback_without_scheduler_is_503() {
        let mut config = Config::default();
        config.scheduler.enabled = false;
        let collaborators = Collaborators::from_config(&config);
        let (app, _state) = create_server(config, collaborators).await.unwrap();
        let server = TestServer::new(app).unwrap();

        let response = server
            .post("/api/plugins/callback")
            .json(&serde_json::json!({
                "taskId": uuid::Uuid::new_v4(),
                "pluginId": "ghost",
                "cid": "none",
                "status": "completed"
            }))
            .await;
        assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_retry_resumes_failed_hash_phase_without_refanning() {
        let config = Config::default();
        let collaborators = Collaborators::from_config(&config);
        let (app, state) = create_server(config, collaborators).await.unwrap();
        let server = TestServer::new(app).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("clip.mkv");
        tokio::fs::write(&file, b"payload").await.unwrap();
        let path = file.to_string_lossy().into_owned();

        // A file that failed during the full-hash phase, fast phase done
        state.file_state.add_discovered(&path);
        state.file_state.set_hash(&path, "id-1");
        state
            .file_state
            .mark_failed(&path, crate::state::FilePhase::Hash, "decode error");

        let response = server
            .post("/admin/files/retry")
            .json(&serde_json::json!({ "path": path }))
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.json::<Value>()["resumed_at"], "hash");

        // The file finishes without re-entering validation, so the fast
        // phase (and its plugin fan-out) is not re-run
        for _ in 0..200 {
            if state.file_state.get(&path).map(|record| record.phase)
                == Some(crate::state::FilePhase::Done)
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(
            state.file_state.get(&path).unwrap().phase,
            crate::state::FilePhase::Done
        );
        assert_eq!(state.pipeline.stats().validated, 0);
    }

    #[tokio::test]
    async fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.server.port = 0;
        assert!(config.validate().is_err());

        config.server.port = 3000;
        config.server.max_body_size = 0;
        assert!(config.validate().is_err());
    }
}
