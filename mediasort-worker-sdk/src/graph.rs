//! # Plugin Dependency Graph
//!
//! Validation of the dependency relation over the *active* plugin set.
//! Plugin manifests declare the ids of plugins whose output they consume;
//! activation is only valid when those references resolve within the active
//! set and the relation forms a DAG. A failed validation excludes the
//! offending plugins before any task is created for them.

use crate::protocol::PluginManifest;
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

/// Reasons a plugin set cannot be activated.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// A manifest references a plugin id outside the active set.
    #[error("plugin '{plugin}' depends on unknown plugin '{dependency}'")]
    UnknownDependency { plugin: String, dependency: String },

    /// The dependency relation contains a cycle; `members` lists every
    /// plugin left unsorted.
    #[error("dependency cycle among plugins: {}", members.join(", "))]
    Cycle { members: Vec<String> },
}

/// Compute a dependency-respecting activation order via Kahn's algorithm.
///
/// Returns plugin ids such that every plugin appears after all of its
/// dependencies. Ties break on `(priority, id)` so the order is
/// deterministic across runs.
///
/// # Errors
///
/// [`GraphError::UnknownDependency`] when a dependency does not resolve
/// within `manifests`; [`GraphError::Cycle`] when a topological sort is
/// impossible.
pub fn activation_order(manifests: &[PluginManifest]) -> Result<Vec<String>, GraphError> {
    let known: HashSet<&str> = manifests.iter().map(|m| m.id.as_str()).collect();

    // indegree per plugin and the reverse adjacency (dep → dependents)
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut order_key: HashMap<&str, (i32, &str)> = HashMap::new();

    for manifest in manifests {
        order_key.insert(manifest.id.as_str(), (manifest.priority, manifest.id.as_str()));
        indegree.entry(manifest.id.as_str()).or_insert(0);
        for dep in &manifest.dependencies {
            if !known.contains(dep.as_str()) {
                return Err(GraphError::UnknownDependency {
                    plugin: manifest.id.clone(),
                    dependency: dep.clone(),
                });
            }
            *indegree.entry(manifest.id.as_str()).or_insert(0) += 1;
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(manifest.id.as_str());
        }
    }

    let mut ready: Vec<&str> = indegree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();
    ready.sort_by_key(|id| order_key[id]);
    let mut queue: VecDeque<&str> = ready.into();

    let mut sorted = Vec::with_capacity(manifests.len());
    while let Some(id) = queue.pop_front() {
        sorted.push(id.to_string());
        let mut unlocked: Vec<&str> = Vec::new();
        for dependent in dependents.get(id).into_iter().flatten() {
            let deg = indegree.get_mut(dependent).unwrap();
            *deg -= 1;
            if *deg == 0 {
                unlocked.push(dependent);
            }
        }
        unlocked.sort_by_key(|id| order_key[id]);
        for id in unlocked {
            queue.push_back(id);
        }
    }

    if sorted.len() != manifests.len() {
        let mut members: Vec<String> = indegree
            .into_iter()
            .filter(|(_, deg)| *deg > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        members.sort();
        return Err(GraphError::Cycle { members });
    }

    Ok(sorted)
}

/// Dependencies of `manifest` restricted to the active set.
///
/// Tasks only fence on dependencies that are actually active; an inactive
/// dependency would otherwise wait out the full dependency timeout for a
/// plugin that can never settle.
pub fn active_dependencies(manifest: &PluginManifest, active: &HashSet<String>) -> Vec<String> {
    manifest
        .dependencies
        .iter()
        .filter(|dep| active.contains(*dep))
        .cloned()
        .collect()
}
