//! Shared harness: wiremock workers, a fully wired scheduler, and event
//! helpers.

use mediasort_daemon::config::{PluginSpec, SchedulerConfig, WorkersConfig};
use mediasort_daemon::events::{Event, EventBus};
use mediasort_daemon::gate::GateController;
use mediasort_daemon::runtime::StaticRuntime;
use mediasort_daemon::scheduler::Scheduler;
use mediasort_daemon::store::MemoryMetadataStore;
use mediasort_daemon::worker_manager::WorkerManager;
use mediasort_worker_sdk::protocol::{CallbackPayload, CallbackStatus, ProcessRequest};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A wiremock worker serving the full contract: healthy `/health`, the
/// given `/manifest`, and an accepting `/process`.
pub async fn accepting_worker(manifest: serde_json::Value) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"status": "healthy", "ready": true})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/manifest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(manifest))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/process"))
        .respond_with(move |request: &wiremock::Request| {
            let body: ProcessRequest = serde_json::from_slice(&request.body).unwrap();
            ResponseTemplate::new(200)
                .set_body_json(json!({"status": "accepted", "taskId": body.task_id}))
        })
        .mount(&server)
        .await;
    server
}

pub struct Harness {
    pub scheduler: Arc<Scheduler>,
    pub workers: Arc<WorkerManager>,
    pub gate: Arc<GateController>,
    pub events: EventBus,
}

/// Wire a scheduler over the given `(plugin_id, endpoint)` pairs.
pub async fn harness(plugins: Vec<(&str, String)>) -> Harness {
    harness_with_config(plugins, SchedulerConfig::default()).await
}

pub async fn harness_with_config(
    plugins: Vec<(&str, String)>,
    scheduler_config: SchedulerConfig,
) -> Harness {
    let specs: Vec<PluginSpec> = plugins
        .iter()
        .map(|(id, endpoint)| PluginSpec {
            id: id.to_string(),
            image: None,
            endpoints: vec![endpoint.clone()],
            instances: None,
            config: None,
            env: HashMap::new(),
        })
        .collect();
    let workers_config = WorkersConfig {
        startup_timeout: Duration::from_secs(3),
        plugins: specs.clone(),
        ..WorkersConfig::default()
    };

    let events = EventBus::new();
    let gate = Arc::new(GateController::new());
    let runtime = Arc::new(StaticRuntime::from_plugin_specs(&specs));
    let workers = WorkerManager::new(workers_config, runtime, events.clone());
    workers.initialize().await;

    let scheduler = Scheduler::new(
        scheduler_config,
        Arc::clone(&workers),
        Arc::new(MemoryMetadataStore::new()),
        Arc::clone(&gate),
        events.clone(),
        "http://core/api/plugins/callback".to_string(),
        "http://core".to_string(),
    );

    Harness {
        scheduler,
        workers,
        gate,
        events,
    }
}

/// Poll a worker until it has received `count` `/process` requests.
pub async fn wait_for_process(server: &MockServer, count: usize) -> Vec<ProcessRequest> {
    for _ in 0..300 {
        let requests = process_requests(server).await;
        if requests.len() >= count {
            return requests;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("worker never received {count} process request(s)");
}

pub async fn process_requests(server: &MockServer) -> Vec<ProcessRequest> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == "/process")
        .map(|request| serde_json::from_slice(&request.body).unwrap())
        .collect()
}

/// Completed callback for a dispatched task.
pub fn completed(request: &ProcessRequest, plugin_id: &str, duration_ms: u64) -> CallbackPayload {
    CallbackPayload {
        task_id: request.task_id,
        plugin_id: plugin_id.to_string(),
        cid: request.cid.clone(),
        status: CallbackStatus::Completed,
        duration_ms: Some(duration_ms),
        error: None,
        reason: None,
    }
}

/// Spawn a responder that answers every `/process` the worker receives
/// with a completed callback.
pub fn auto_respond(server: Arc<MockServer>, plugin_id: &str, scheduler: Arc<Scheduler>) {
    let plugin_id = plugin_id.to_string();
    tokio::spawn(async move {
        let mut answered: HashSet<Uuid> = HashSet::new();
        loop {
            for request in process_requests(&server).await {
                if answered.insert(request.task_id) {
                    scheduler.handle_callback(completed(&request, &plugin_id, 25));
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });
}

/// Wait for an event matching the predicate, panicking after `max_wait`.
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<Event>,
    max_wait: Duration,
    mut predicate: impl FnMut(&Event) -> bool,
) -> Event {
    let deadline = tokio::time::Instant::now() + max_wait;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("event did not arrive in time");
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) if predicate(&event) => return event,
            Ok(Ok(_)) => continue,
            Ok(Err(error)) => panic!("event channel error: {error}"),
            Err(_) => panic!("event did not arrive in time"),
        }
    }
}
