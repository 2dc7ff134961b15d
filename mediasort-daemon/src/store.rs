//! Metadata store boundary.
//!
//! The daemon does not persist metadata itself; it reads and merges records
//! in an external KV store keyed by content hash. The trait keeps that
//! boundary explicit and lets tests run against the in-memory
//! implementation.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

/// External metadata store keyed by content hash.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Fetch the current record for a hash, `Value::Null` when absent.
    async fn fetch(&self, hash: &str) -> Value;

    /// Shallow-merge `patch` into the record for `hash`.
    async fn merge(&self, hash: &str, patch: Value);

    /// Drop the record for `hash`.
    async fn remove(&self, hash: &str);
}

/// In-memory metadata store for tests and single-node development.
#[derive(Default)]
pub struct MemoryMetadataStore {
    records: DashMap<String, Value>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn fetch(&self, hash: &str) -> Value {
        self.records
            .get(hash)
            .map(|entry| entry.clone())
            .unwrap_or(Value::Null)
    }

    async fn merge(&self, hash: &str, patch: Value) {
        let mut entry = self
            .records
            .entry(hash.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        match (entry.value_mut(), patch) {
            (Value::Object(existing), Value::Object(incoming)) => {
                for (key, value) in incoming {
                    existing.insert(key, value);
                }
            }
            (slot, other) => *slot = other,
        }
    }

    async fn remove(&self, hash: &str) {
        self.records.remove(hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn merge_is_shallow() {
        let store = MemoryMetadataStore::new();
        store.merge("h1", json!({ "size": 10, "ext": "mkv" })).await;
        store.merge("h1", json!({ "size": 20 })).await;
        let record = store.fetch("h1").await;
        assert_eq!(record["size"], 20);
        assert_eq!(record["ext"], "mkv");
    }

    #[tokio::test]
    async fn fetch_missing_is_null() {
        let store = MemoryMetadataStore::new();
        assert_eq!(store.fetch("missing").await, Value::Null);
    }
}
