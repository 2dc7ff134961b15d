//! # Batched Change Notification
//!
//! The pipeline publishes virtual-filesystem changes (file added, removed,
//! everything reset) to an external pub/sub channel. Changes are buffered
//! and flushed on a fixed interval; within one flush window the buffer is
//! deduplicated by hash with last-write-wins, so a file that is added and
//! removed between flushes publishes only the removal.
//!
//! A failed publish re-buffers the batch without clobbering entries that
//! arrived while the publish was in flight.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Action carried by one change entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Add,
    Remove,
    /// Downstream caches must be invalidated wholesale.
    Reset,
}

/// One published change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub action: ChangeAction,
    pub hash: String,
}

/// A flushed batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub timestamp: DateTime<Utc>,
    pub changes: Vec<Change>,
}

/// External notification channel the batcher publishes to.
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    async fn publish(&self, batch: ChangeBatch) -> anyhow::Result<()>;
}

/// Hash-deduplicated change buffer with interval flushing.
pub struct ChangeBatcher {
    notifier: Arc<dyn ChangeNotifier>,
    buffer: Mutex<HashMap<String, ChangeAction>>,
    interval: Duration,
    flusher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ChangeBatcher {
    pub fn new(notifier: Arc<dyn ChangeNotifier>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            notifier,
            buffer: Mutex::new(HashMap::new()),
            interval,
            flusher: std::sync::Mutex::new(None),
        })
    }

    /// Start the interval flusher. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.flusher.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let batcher = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(batcher.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                batcher.flush().await;
            }
        }));
    }

    /// Stop the interval flusher without flushing.
    pub fn stop(&self) {
        if let Some(handle) = self.flusher.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Record a change. Later actions for the same hash replace earlier
    /// ones within the current flush window.
    pub async fn queue_change(&self, action: ChangeAction, hash: &str) {
        self.buffer.lock().await.insert(hash.to_string(), action);
    }

    /// Queue a reset, discarding every buffered per-file change; the reset
    /// supersedes them.
    pub async fn queue_reset(&self) {
        let mut buffer = self.buffer.lock().await;
        buffer.clear();
        buffer.insert(String::new(), ChangeAction::Reset);
    }

    /// Flush the buffer now. On publish failure the entries are restored,
    /// yielding to anything queued meanwhile.
    pub async fn flush(&self) {
        let drained: HashMap<String, ChangeAction> = {
            let mut buffer = self.buffer.lock().await;
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };

        let changes: Vec<Change> = drained
            .iter()
            .map(|(hash, action)| Change {
                action: *action,
                hash: hash.clone(),
            })
            .collect();
        let batch = ChangeBatch {
            timestamp: Utc::now(),
            changes,
        };

        if let Err(error) = self.notifier.publish(batch).await {
            tracing::warn!(%error, "change publish failed, re-buffering");
            let mut buffer = self.buffer.lock().await;
            for (hash, action) in drained {
                buffer.entry(hash).or_insert(action);
            }
        }
    }

    /// Number of buffered entries, for stats.
    pub async fn pending(&self) -> usize {
        self.buffer.lock().await.len()
    }
}

/// Notifier that logs batches; stands in when no pub/sub channel is wired.
pub struct LogNotifier;

#[async_trait]
impl ChangeNotifier for LogNotifier {
    async fn publish(&self, batch: ChangeBatch) -> anyhow::Result<()> {
        tracing::info!(changes = batch.changes.len(), "vfs change batch");
        Ok(())
    }
}
