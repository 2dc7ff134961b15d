//! # Container Runtime Boundary
//!
//! The worker manager spawns and reaps worker containers through this
//! trait; the Docker implementation itself lives outside the core. What
//! the core owns is the naming and labelling contract:
//!
//! - instances are named `meta-plugin-{pluginId}-{index}`
//! - containers carry `role=plugin` and `pluginId` labels, which is how
//!   stale leftovers from a previous run are found and reclaimed on
//!   startup
//!
//! [`StaticRuntime`] maps plugins to preconfigured endpoints instead of
//! spawning anything; it backs tests and deployments where workers are
//! managed externally.

use async_trait::async_trait;
use std::collections::HashMap;

/// Label applied to every worker container.
pub const ROLE_LABEL: &str = "role";
/// Label value identifying mediasort workers.
pub const ROLE_PLUGIN: &str = "plugin";
/// Label carrying the owning plugin id.
pub const PLUGIN_ID_LABEL: &str = "pluginId";

/// Canonical instance name for a plugin replica.
pub fn instance_name(plugin_id: &str, index: u32) -> String {
    format!("meta-plugin-{plugin_id}-{index}")
}

/// Everything the runtime needs to start one worker replica.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub plugin_id: String,
    pub instance_name: String,
    pub image: Option<String>,
    pub network: String,
    pub index: u32,
    pub env: HashMap<String, String>,
}

/// Interface to whatever actually runs worker containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make sure the worker network exists.
    async fn ensure_network(&self, network: &str) -> anyhow::Result<()>;

    /// Pull the image if it is not present locally.
    async fn pull_image(&self, image: &str) -> anyhow::Result<()>;

    /// Names of leftover instances for a plugin from a previous run,
    /// identified by the `role=plugin` and `pluginId` labels.
    async fn stale_instances(&self, plugin_id: &str) -> anyhow::Result<Vec<String>>;

    /// Start one replica and return its base URL.
    async fn spawn(&self, spec: &SpawnSpec) -> anyhow::Result<String>;

    /// Stop and remove an instance. Must be idempotent.
    async fn stop(&self, instance_name: &str) -> anyhow::Result<()>;
}

/// Runtime for externally managed workers: each plugin maps to a fixed
/// list of endpoints and "spawning" replica `i` hands back endpoint `i`.
pub struct StaticRuntime {
    endpoints: HashMap<String, Vec<String>>,
}

impl StaticRuntime {
    pub fn new(endpoints: HashMap<String, Vec<String>>) -> Self {
        Self { endpoints }
    }

    /// Build from the configured plugin specs' `endpoints` lists.
    pub fn from_plugin_specs(specs: &[crate::config::PluginSpec]) -> Self {
        let endpoints = specs
            .iter()
            .map(|spec| (spec.id.clone(), spec.endpoints.clone()))
            .collect();
        Self::new(endpoints)
    }
}

#[async_trait]
impl ContainerRuntime for StaticRuntime {
    async fn ensure_network(&self, _network: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pull_image(&self, _image: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stale_instances(&self, _plugin_id: &str) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn spawn(&self, spec: &SpawnSpec) -> anyhow::Result<String> {
        let endpoints = self
            .endpoints
            .get(&spec.plugin_id)
            .ok_or_else(|| anyhow::anyhow!("no endpoints configured for {}", spec.plugin_id))?;
        endpoints
            .get(spec.index as usize)
            .cloned()
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "plugin {} has {} endpoints, replica {} requested",
                    spec.plugin_id,
                    endpoints.len(),
                    spec.index
                )
            })
    }

    async fn stop(&self, _instance_name: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
