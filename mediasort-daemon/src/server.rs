//! # HTTP Server Module
//!
//! Server construction for the mediasort daemon: component wiring, shared
//! application state, route registration, and the middleware stack.
//!
//! ## Overview
//!
//! [`create_server`] builds the entire core from a [`Config`]:
//!
//! 1. event bus, gate, file state and metadata store
//! 2. worker manager (spawn plugins, probe health, fetch manifests),
//!    unless scheduling is disabled
//! 3. scheduler, bound to the worker manager and gate
//! 4. change batcher and streaming pipeline
//! 5. axum router with trace and timeout layers
//!
//! The returned [`AppState`] hands the binary the pieces it needs for
//! graceful shutdown (close the gate, drain, stop workers).
//!
//! ## Routes
//!
//! - `POST /api/plugins/callback`: worker callback ingress
//! - `POST /api/files`: discovery ingress
//! - `GET /health`, `GET /stats`
//! - `GET /admin/plugins`, `GET|POST /admin/gate`, `POST /admin/drain`
//! - `GET /admin/files`, `GET /admin/failures`,
//!   `POST /admin/files/retry`, `POST /admin/files/retry-all`

use crate::config::Config;
use crate::events::EventBus;
use crate::gate::GateController;
use crate::handlers;
use crate::notifier::{ChangeBatcher, ChangeNotifier, LogNotifier};
use crate::pipeline::StreamingPipeline;
use crate::runtime::{ContainerRuntime, StaticRuntime};
use crate::scheduler::Scheduler;
use crate::state::StateManager;
use crate::store::{MemoryMetadataStore, MetadataStore};
use crate::worker_manager::WorkerManager;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Application state shared across all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Absent when scheduling is disabled in the configuration.
    pub scheduler: Option<Arc<Scheduler>>,
    pub workers: Option<Arc<WorkerManager>>,
    pub pipeline: Arc<StreamingPipeline>,
    pub file_state: Arc<StateManager>,
    pub gate: Arc<GateController>,
    pub events: EventBus,
    pub batcher: Arc<ChangeBatcher>,
}

/// External collaborators the daemon is wired to. Defaults cover tests
/// and single-node development.
pub struct Collaborators {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub store: Arc<dyn MetadataStore>,
    pub notifier: Arc<dyn ChangeNotifier>,
}

impl Collaborators {
    /// Static worker endpoints, in-memory store, log-only notifier.
    pub fn from_config(config: &Config) -> Self {
        Self {
            runtime: Arc::new(StaticRuntime::from_plugin_specs(&config.workers.plugins)),
            store: Arc::new(MemoryMetadataStore::new()),
            notifier: Arc::new(LogNotifier),
        }
    }
}

/// Build every component and the axum router.
///
/// Worker initialization happens here: plugins are spawned, probed and
/// activated before the router is returned, so a ready router means the
/// dispatchable plugin set is known.
pub async fn create_server(
    config: Config,
    collaborators: Collaborators,
) -> anyhow::Result<(Router, AppState)> {
    let events = EventBus::new();
    let gate = Arc::new(GateController::new());
    let file_state = Arc::new(StateManager::new());

    let (workers, scheduler) = if config.scheduler.enabled {
        let workers = WorkerManager::new(
            config.workers.clone(),
            collaborators.runtime,
            events.clone(),
        );
        workers.initialize().await;
        let scheduler = Scheduler::new(
            config.scheduler.clone(),
            Arc::clone(&workers),
            Arc::clone(&collaborators.store),
            Arc::clone(&gate),
            events.clone(),
            config.workers.callback_url.clone(),
            config.workers.meta_core_url.clone(),
        );
        (Some(workers), Some(scheduler))
    } else {
        tracing::info!("scheduler disabled, pipeline will self-complete files");
        (None, None)
    };

    let batcher = ChangeBatcher::new(collaborators.notifier, config.pipeline.batch_interval);
    batcher.start();

    let pipeline = StreamingPipeline::new(
        config.pipeline.clone(),
        scheduler.clone(),
        collaborators.store,
        Arc::clone(&file_state),
        Arc::clone(&batcher),
    );

    let state = AppState {
        config: Arc::new(config.clone()),
        scheduler,
        workers,
        pipeline,
        file_state,
        gate,
        events,
        batcher,
    };

    let app = Router::new()
        .route("/api/plugins/callback", post(handlers::plugin_callback))
        .route("/api/files", post(handlers::ingest_file))
        .route("/health", get(handlers::health_check))
        .route("/stats", get(handlers::stats))
        .route("/admin/plugins", get(handlers::list_plugins))
        .route("/admin/plugins/restart", post(handlers::restart_plugin))
        .route(
            "/admin/gate",
            get(handlers::gate_status).post(handlers::set_gate),
        )
        .route("/admin/drain", post(handlers::drain))
        .route("/admin/files", get(handlers::list_files))
        .route("/admin/failures", get(handlers::list_failures))
        .route("/admin/files/retry", post(handlers::retry_file))
        .route("/admin/files/retry-all", post(handlers::retry_all_failed))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(config.server.timeout)),
        )
        .with_state(state.clone());

    Ok((app, state))
}
