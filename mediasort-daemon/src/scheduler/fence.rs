//! # Per-file Dependency Fence
//!
//! For every file hash the fence tracks which plugins have *settled*,
//! meaning reached any terminal outcome including failure, and parks waiters for
//! plugins that have not. A failed dependency therefore never hangs its
//! descendants: they wake and dispatch with whatever metadata the failed
//! plugin persisted.
//!
//! Settling a `(file_hash, plugin_id)` pair is at-most-once; waiters are
//! resolved exactly once on first settlement and then discarded. Clearing
//! a file's fence drops any remaining waiters, which their tasks observe
//! as cancellation.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::oneshot;

#[derive(Default)]
struct FileFence {
    settled: HashSet<String>,
    waiters: HashMap<String, Vec<oneshot::Sender<()>>>,
}

/// Outcome of waiting on one dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The dependency settled (or already had).
    Settled,
    /// The fence was cleared while waiting; the task is being reaped.
    Cleared,
}

/// Map of per-file completion fences.
pub struct CompletionFence {
    files: Mutex<HashMap<String, FileFence>>,
}

impl CompletionFence {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Mark a plugin settled for a file and wake its waiters.
    ///
    /// Only the first settlement per `(file_hash, plugin_id)` has any
    /// effect.
    pub fn settle(&self, file_hash: &str, plugin_id: &str) {
        let senders = {
            let mut files = self.files.lock().unwrap();
            let fence = files.entry(file_hash.to_string()).or_default();
            if !fence.settled.insert(plugin_id.to_string()) {
                return;
            }
            fence.waiters.remove(plugin_id).unwrap_or_default()
        };
        for sender in senders {
            let _ = sender.send(());
        }
    }

    /// Whether a plugin has settled for a file.
    pub fn is_settled(&self, file_hash: &str, plugin_id: &str) -> bool {
        let files = self.files.lock().unwrap();
        files
            .get(file_hash)
            .map(|fence| fence.settled.contains(plugin_id))
            .unwrap_or(false)
    }

    /// Wait until a plugin settles for a file.
    ///
    /// Resolves immediately when the pair is already settled. Resolves
    /// with [`WaitOutcome::Cleared`] when the file's fence is torn down
    /// first.
    pub fn wait(&self, file_hash: &str, plugin_id: &str) -> impl std::future::Future<Output = WaitOutcome> {
        let receiver = {
            let mut files = self.files.lock().unwrap();
            let fence = files.entry(file_hash.to_string()).or_default();
            if fence.settled.contains(plugin_id) {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                fence
                    .waiters
                    .entry(plugin_id.to_string())
                    .or_default()
                    .push(tx);
                Some(rx)
            }
        };
        async move {
            match receiver {
                None => WaitOutcome::Settled,
                Some(rx) => match rx.await {
                    Ok(()) => WaitOutcome::Settled,
                    Err(_) => WaitOutcome::Cleared,
                },
            }
        }
    }

    /// Tear down a file's fence, dropping any parked waiters.
    pub fn clear(&self, file_hash: &str) {
        self.files.lock().unwrap().remove(file_hash);
    }

    /// Tear down every fence. Used by `Scheduler::clear`.
    pub fn clear_all(&self) {
        self.files.lock().unwrap().clear();
    }

    /// Number of files with a live fence, for stats.
    pub fn len(&self) -> usize {
        self.files.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().unwrap().is_empty()
    }
}

impl Default for CompletionFence {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_after_settle_resolves_immediately() {
        let fence = CompletionFence::new();
        fence.settle("h1", "a");
        assert_eq!(fence.wait("h1", "a").await, WaitOutcome::Settled);
    }

    #[tokio::test]
    async fn settle_wakes_all_waiters() {
        let fence = std::sync::Arc::new(CompletionFence::new());
        let w1 = fence.wait("h1", "a");
        let w2 = fence.wait("h1", "a");

        let fence2 = fence.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            fence2.settle("h1", "a");
        });

        let (r1, r2) = tokio::join!(w1, w2);
        assert_eq!(r1, WaitOutcome::Settled);
        assert_eq!(r2, WaitOutcome::Settled);
    }

    #[tokio::test]
    async fn settle_is_at_most_once() {
        let fence = CompletionFence::new();
        fence.settle("h1", "a");
        // Second settlement must not panic or re-wake anything
        fence.settle("h1", "a");
        assert!(fence.is_settled("h1", "a"));
    }

    #[tokio::test]
    async fn clear_cancels_waiters() {
        let fence = std::sync::Arc::new(CompletionFence::new());
        let waiter = fence.wait("h1", "a");

        let fence2 = fence.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            fence2.clear("h1");
        });

        assert_eq!(waiter.await, WaitOutcome::Cleared);
        assert!(fence.is_empty());
    }

    #[tokio::test]
    async fn fences_are_per_file() {
        let fence = CompletionFence::new();
        fence.settle("h1", "a");
        assert!(!fence.is_settled("h2", "a"));
    }
}
