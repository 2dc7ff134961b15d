//! # Worker Manager
//!
//! Owns the population of worker instances. For each configured plugin it
//! keeps `N` replicas alive, probes their health on a fixed interval, and
//! hands out healthy instances round-robin to the scheduler.
//!
//! ## Lifecycle
//!
//! `initialize` runs once at startup, per plugin:
//!
//! 1. ensure the worker network exists
//! 2. pull the image if absent
//! 3. reap stale instances left by a previous run (found via the
//!    `role=plugin` / `pluginId` labels)
//! 4. spawn the replicas and wait up to 30 s for one to report healthy
//! 5. fetch the plugin manifest from a healthy instance
//! 6. push persisted plugin configuration to every instance
//!
//! A plugin that fails any of these steps is excluded with a
//! `plugin:error` event; initialization continues with the remaining
//! plugins and is never fatal to the manager. After all plugins are up,
//! the dependency relation over the active manifests is validated: plugins
//! with unresolvable or cyclic dependencies are deactivated before any
//! task can be created for them.
//!
//! ## Health protocol
//!
//! Every 30 s each instance gets `GET /health` with a 5 s budget. An
//! instance is healthy iff the body decodes to `status == "healthy"` and
//! `ready == true`. Transitions emit `plugin:healthy` / `plugin:unhealthy`.
//! Unhealthy instances are excluded from selection but not stopped; an
//! unreachable worker is simply unhealthy.
//!
//! ## Selection
//!
//! `select_healthy` round-robins over the instances that are healthy *at
//! call time*; membership changes between calls, so the healthy set is
//! recomputed on every selection and the per-plugin counter is taken
//! modulo its current size.

use crate::config::{PluginSpec, WorkersConfig};
use crate::events::{Event, EventBus};
use crate::runtime::{instance_name, ContainerRuntime, SpawnSpec};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mediasort_worker_sdk::graph::{self, GraphError};
use mediasort_worker_sdk::protocol::PluginManifest;
use mediasort_worker_sdk::WorkerClient;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Lifecycle status of one worker replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    Healthy,
    Unhealthy,
    Stopped,
    Error,
}

/// One network-addressable replica of a plugin.
pub struct WorkerInstance {
    pub plugin_id: String,
    pub instance_name: String,
    pub base_url: String,
    pub index: u32,
    status: Mutex<InstanceStatus>,
    last_health_at: Mutex<Option<DateTime<Utc>>>,
    pub tasks_ok: AtomicU64,
    pub tasks_fail: AtomicU64,
    client: WorkerClient,
}

impl WorkerInstance {
    fn new(plugin_id: &str, index: u32, base_url: String, http: reqwest::Client) -> Arc<Self> {
        let client = WorkerClient::with_http(http, base_url.clone());
        Arc::new(Self {
            plugin_id: plugin_id.to_string(),
            instance_name: instance_name(plugin_id, index),
            base_url,
            index,
            status: Mutex::new(InstanceStatus::Starting),
            last_health_at: Mutex::new(None),
            tasks_ok: AtomicU64::new(0),
            tasks_fail: AtomicU64::new(0),
            client,
        })
    }

    pub fn status(&self) -> InstanceStatus {
        *self.status.lock().unwrap()
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == InstanceStatus::Healthy
    }

    pub fn client(&self) -> &WorkerClient {
        &self.client
    }

    fn set_status(&self, status: InstanceStatus) -> InstanceStatus {
        std::mem::replace(&mut *self.status.lock().unwrap(), status)
    }
}

/// Admin-facing snapshot of one instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub plugin_id: String,
    pub instance_name: String,
    pub base_url: String,
    pub status: InstanceStatus,
    pub last_health_at: Option<DateTime<Utc>>,
    pub tasks_ok: u64,
    pub tasks_fail: u64,
}

/// Admin-facing snapshot of one plugin.
#[derive(Debug, Clone, Serialize)]
pub struct PluginSnapshot {
    pub plugin_id: String,
    pub active: bool,
    pub error: Option<String>,
    pub manifest: Option<PluginManifest>,
    pub instances: Vec<InstanceSnapshot>,
}

struct PluginEntry {
    spec: PluginSpec,
    manifest: Option<PluginManifest>,
    instances: Vec<Arc<WorkerInstance>>,
    rr: AtomicUsize,
    /// Set when the plugin was excluded; an excluded plugin never receives
    /// tasks.
    error: Option<String>,
}

impl PluginEntry {
    fn is_active(&self) -> bool {
        self.manifest.is_some() && self.error.is_none()
    }
}

/// Maintains the worker population and routes selections to healthy
/// replicas.
pub struct WorkerManager {
    config: WorkersConfig,
    runtime: Arc<dyn ContainerRuntime>,
    events: EventBus,
    http: reqwest::Client,
    plugins: DashMap<String, PluginEntry>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerManager {
    pub fn new(
        config: WorkersConfig,
        runtime: Arc<dyn ContainerRuntime>,
        events: EventBus,
    ) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Arc::new(Self {
            config,
            runtime,
            events,
            http,
            plugins: DashMap::new(),
            health_task: Mutex::new(None),
        })
    }

    /// Bring up every configured plugin, validate the dependency graph,
    /// and start the health loop.
    ///
    /// Partial failure excludes the failing plugin and continues; the
    /// manager itself never fails to initialize.
    pub async fn initialize(self: &Arc<Self>) {
        for spec in self.config.plugins.clone() {
            let plugin_id = spec.id.clone();
            match self.init_plugin(spec.clone()).await {
                Ok(entry) => {
                    self.plugins.insert(plugin_id, entry);
                }
                Err(error) => {
                    tracing::error!(plugin = %plugin_id, %error, "plugin initialization failed");
                    self.events.emit(Event::PluginError {
                        plugin_id: plugin_id.clone(),
                        error: error.to_string(),
                    });
                    self.plugins.insert(
                        plugin_id,
                        PluginEntry {
                            spec,
                            manifest: None,
                            instances: Vec::new(),
                            rr: AtomicUsize::new(0),
                            error: Some(error.to_string()),
                        },
                    );
                }
            }
        }

        self.validate_dependency_graph();
        self.start_health_loop();
    }

    async fn init_plugin(&self, spec: PluginSpec) -> anyhow::Result<PluginEntry> {
        self.runtime.ensure_network(&self.config.network).await?;
        if let Some(image) = &spec.image {
            self.runtime.pull_image(image).await?;
        }

        // Reap leftovers from a previous run before taking their names
        for stale in self.runtime.stale_instances(&spec.id).await? {
            if let Err(error) = self.runtime.stop(&stale).await {
                tracing::warn!(instance = %stale, %error, "failed to reap stale instance");
            }
        }

        let initial = spec.instances.unwrap_or(1).max(1);
        let mut instances = Vec::new();
        for index in 0..initial {
            instances.push(self.spawn_instance(&spec, index).await?);
        }

        let healthy = self.wait_for_first_healthy(&instances).await?;
        let manifest = healthy.client().manifest().await?;
        tracing::info!(
            plugin = %spec.id,
            version = %manifest.version,
            "plugin activated"
        );

        // The manifest may ask for more replicas than we started with
        let desired = spec.instances.unwrap_or_else(|| manifest.instance_count());
        for index in initial..desired.max(1) {
            instances.push(self.spawn_instance(&spec, index).await?);
        }

        // Push persisted configuration; a refusal is logged, not fatal
        if let Some(config) = &spec.config {
            for instance in &instances {
                if let Err(error) = instance.client().configure(config.clone()).await {
                    tracing::warn!(
                        instance = %instance.instance_name,
                        %error,
                        "configuration push failed"
                    );
                }
            }
        }

        Ok(PluginEntry {
            spec,
            manifest: Some(manifest),
            instances,
            rr: AtomicUsize::new(0),
            error: None,
        })
    }

    async fn spawn_instance(
        &self,
        spec: &PluginSpec,
        index: u32,
    ) -> anyhow::Result<Arc<WorkerInstance>> {
        let spawn = SpawnSpec {
            plugin_id: spec.id.clone(),
            instance_name: instance_name(&spec.id, index),
            image: spec.image.clone(),
            network: self.config.network.clone(),
            index,
            env: spec.env.clone(),
        };
        let base_url = self.runtime.spawn(&spawn).await?;
        Ok(WorkerInstance::new(
            &spec.id,
            index,
            base_url,
            self.http.clone(),
        ))
    }

    /// Poll the fresh instances until one passes a health probe, bounded
    /// by the startup timeout.
    async fn wait_for_first_healthy(
        &self,
        instances: &[Arc<WorkerInstance>],
    ) -> anyhow::Result<Arc<WorkerInstance>> {
        let deadline = tokio::time::Instant::now() + self.config.startup_timeout;
        loop {
            for instance in instances {
                if self.probe_instance(instance).await {
                    return Ok(Arc::clone(instance));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow::anyhow!(
                    "no instance became healthy within {:?}",
                    self.config.startup_timeout
                ));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Probe one instance and record the transition. Returns whether the
    /// instance is healthy now.
    async fn probe_instance(&self, instance: &Arc<WorkerInstance>) -> bool {
        let healthy = match instance.client().health(self.config.health_timeout).await {
            Ok(body) => body.is_healthy(),
            Err(error) => {
                tracing::debug!(
                    instance = %instance.instance_name,
                    %error,
                    "health probe failed"
                );
                false
            }
        };

        *instance.last_health_at.lock().unwrap() = Some(Utc::now());
        let new_status = if healthy {
            InstanceStatus::Healthy
        } else {
            InstanceStatus::Unhealthy
        };
        let previous = instance.set_status(new_status);

        if previous != new_status {
            match new_status {
                InstanceStatus::Healthy => self.events.emit(Event::PluginHealthy {
                    plugin_id: instance.plugin_id.clone(),
                    instance_name: instance.instance_name.clone(),
                }),
                _ => {
                    // Starting → Unhealthy is not a transition worth announcing
                    if previous == InstanceStatus::Healthy {
                        self.events.emit(Event::PluginUnhealthy {
                            plugin_id: instance.plugin_id.clone(),
                            instance_name: instance.instance_name.clone(),
                        });
                    }
                }
            }
        }
        healthy
    }

    /// Deactivate plugins whose dependency declarations do not form a DAG
    /// over the active set.
    fn validate_dependency_graph(&self) {
        loop {
            let manifests: Vec<PluginManifest> = self
                .plugins
                .iter()
                .filter(|entry| entry.is_active())
                .filter_map(|entry| entry.manifest.clone())
                .collect();

            let offenders: Vec<(String, String)> = match graph::activation_order(&manifests) {
                Ok(order) => {
                    tracing::debug!(?order, "plugin activation order");
                    return;
                }
                Err(GraphError::UnknownDependency { plugin, dependency }) => vec![(
                    plugin.clone(),
                    format!("depends on unknown or inactive plugin '{dependency}'"),
                )],
                Err(GraphError::Cycle { members }) => members
                    .iter()
                    .map(|id| (id.clone(), "dependency cycle".to_string()))
                    .collect(),
            };

            for (plugin_id, error) in offenders {
                tracing::error!(plugin = %plugin_id, %error, "plugin deactivated");
                if let Some(mut entry) = self.plugins.get_mut(&plugin_id) {
                    entry.error = Some(error.clone());
                }
                self.events.emit(Event::PluginError { plugin_id, error });
            }
        }
    }

    fn start_health_loop(self: &Arc<Self>) {
        let mut slot = self.health_task.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let manager = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.health_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; instances were just probed
            // during startup, skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.probe_all().await;
            }
        }));
    }

    async fn probe_all(&self) {
        let instances: Vec<Arc<WorkerInstance>> = self
            .plugins
            .iter()
            .flat_map(|entry| entry.instances.clone())
            .filter(|instance| instance.status() != InstanceStatus::Stopped)
            .collect();
        let probes = instances
            .iter()
            .map(|instance| self.probe_instance(instance));
        futures::future::join_all(probes).await;
    }

    /// Stop the health loop and every owned worker. Idempotent; individual
    /// stop errors are ignored.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.health_task.lock().unwrap().take() {
            handle.abort();
        }
        for entry in self.plugins.iter() {
            for instance in &entry.instances {
                if instance.status() == InstanceStatus::Stopped {
                    continue;
                }
                if let Err(error) = self.runtime.stop(&instance.instance_name).await {
                    tracing::warn!(
                        instance = %instance.instance_name,
                        %error,
                        "stop failed during shutdown"
                    );
                }
                instance.set_status(InstanceStatus::Stopped);
            }
        }
        tracing::info!("worker manager shut down");
    }

    /// Stop and respawn every instance of one plugin.
    pub async fn restart(self: &Arc<Self>, plugin_id: &str) -> anyhow::Result<()> {
        let spec = self
            .plugins
            .get(plugin_id)
            .map(|entry| entry.spec.clone())
            .ok_or_else(|| anyhow::anyhow!("unknown plugin: {plugin_id}"))?;

        if let Some(entry) = self.plugins.get(plugin_id) {
            for instance in entry.instances.clone() {
                let _ = self.runtime.stop(&instance.instance_name).await;
                instance.set_status(InstanceStatus::Stopped);
            }
        }

        match self.init_plugin(spec).await {
            Ok(entry) => {
                self.plugins.insert(plugin_id.to_string(), entry);
                self.validate_dependency_graph();
                Ok(())
            }
            Err(error) => {
                self.events.emit(Event::PluginError {
                    plugin_id: plugin_id.to_string(),
                    error: error.to_string(),
                });
                if let Some(mut entry) = self.plugins.get_mut(plugin_id) {
                    entry.error = Some(error.to_string());
                }
                Err(error)
            }
        }
    }

    /// Round-robin over the instances that are healthy right now.
    ///
    /// The healthy set is recomputed at each call because membership
    /// changes asynchronously with health probes.
    pub fn select_healthy(&self, plugin_id: &str) -> Option<Arc<WorkerInstance>> {
        let entry = self.plugins.get(plugin_id)?;
        let healthy: Vec<&Arc<WorkerInstance>> = entry
            .instances
            .iter()
            .filter(|instance| instance.is_healthy())
            .collect();
        if healthy.is_empty() {
            return None;
        }
        let slot = entry.rr.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(Arc::clone(healthy[slot]))
    }

    /// Record a task outcome against an instance's counters.
    pub fn record_outcome(&self, plugin_id: &str, instance_name: &str, ok: bool) {
        if let Some(entry) = self.plugins.get(plugin_id) {
            if let Some(instance) = entry
                .instances
                .iter()
                .find(|i| i.instance_name == instance_name)
            {
                if ok {
                    instance.tasks_ok.fetch_add(1, Ordering::Relaxed);
                } else {
                    instance.tasks_fail.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Manifest of an active plugin.
    pub fn manifest(&self, plugin_id: &str) -> Option<PluginManifest> {
        self.plugins
            .get(plugin_id)
            .filter(|entry| entry.is_active())
            .and_then(|entry| entry.manifest.clone())
    }

    /// Manifests of active plugins that have at least one healthy
    /// instance right now. This is the set `dispatch_all` fans out over.
    pub fn dispatchable_manifests(&self) -> Vec<PluginManifest> {
        self.plugins
            .iter()
            .filter(|entry| entry.is_active())
            .filter(|entry| entry.instances.iter().any(|i| i.is_healthy()))
            .filter_map(|entry| entry.manifest.clone())
            .collect()
    }

    /// Ids of all active plugins.
    pub fn active_plugin_ids(&self) -> HashSet<String> {
        self.plugins
            .iter()
            .filter(|entry| entry.is_active())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Admin snapshot of every plugin and instance.
    pub fn snapshot(&self) -> Vec<PluginSnapshot> {
        let mut plugins: Vec<PluginSnapshot> = self
            .plugins
            .iter()
            .map(|entry| PluginSnapshot {
                plugin_id: entry.key().clone(),
                active: entry.is_active(),
                error: entry.error.clone(),
                manifest: entry.manifest.clone(),
                instances: entry
                    .instances
                    .iter()
                    .map(|instance| InstanceSnapshot {
                        plugin_id: instance.plugin_id.clone(),
                        instance_name: instance.instance_name.clone(),
                        base_url: instance.base_url.clone(),
                        status: instance.status(),
                        last_health_at: *instance.last_health_at.lock().unwrap(),
                        tasks_ok: instance.tasks_ok.load(Ordering::Relaxed),
                        tasks_fail: instance.tasks_fail.load(Ordering::Relaxed),
                    })
                    .collect(),
            })
            .collect();
        plugins.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        plugins
    }
}
