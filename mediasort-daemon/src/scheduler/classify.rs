//! # Queue Classification
//!
//! Decides which tier a task runs on. An explicit pin from the caller
//! always wins. Otherwise, once a plugin has enough completed samples, a
//! rolling mean of its task durations decides: under the threshold it is
//! fast work, over it background. Until the sample threshold is met the
//! manifest's `default_queue` is the hint of record.
//!
//! The rolling window is a fixed-size ring per plugin; exact statistics
//! are unnecessary here.

use dashmap::DashMap;
use mediasort_worker_sdk::protocol::QueueKind;
use std::time::Duration;

/// Samples kept per plugin.
const WINDOW_SIZE: usize = 128;

/// Fixed-size ring of duration samples.
struct DurationWindow {
    samples: Vec<u64>,
    next: usize,
    filled: bool,
}

impl DurationWindow {
    fn new() -> Self {
        Self {
            samples: Vec::with_capacity(WINDOW_SIZE),
            next: 0,
            filled: false,
        }
    }

    fn record(&mut self, duration_ms: u64) {
        if self.filled {
            self.samples[self.next] = duration_ms;
            self.next = (self.next + 1) % WINDOW_SIZE;
        } else {
            self.samples.push(duration_ms);
            if self.samples.len() == WINDOW_SIZE {
                self.filled = true;
                self.next = 0;
            }
        }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn mean_ms(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64)
    }
}

/// Per-plugin rolling duration statistics and queue classification.
pub struct Classifier {
    windows: DashMap<String, DurationWindow>,
    threshold: Duration,
    min_samples: usize,
}

impl Classifier {
    pub fn new(threshold: Duration, min_samples: usize) -> Self {
        Self {
            windows: DashMap::new(),
            threshold,
            min_samples,
        }
    }

    /// Record the duration of a completed task.
    pub fn record(&self, plugin_id: &str, duration_ms: u64) {
        self.windows
            .entry(plugin_id.to_string())
            .or_insert_with(DurationWindow::new)
            .record(duration_ms);
    }

    /// Rolling mean duration for a plugin, if any samples exist.
    pub fn mean_ms(&self, plugin_id: &str) -> Option<f64> {
        self.windows.get(plugin_id).and_then(|w| w.mean_ms())
    }

    /// Rolling mean durations for every plugin with samples.
    pub fn means(&self) -> std::collections::HashMap<String, f64> {
        self.windows
            .iter()
            .filter_map(|entry| entry.mean_ms().map(|mean| (entry.key().clone(), mean)))
            .collect()
    }

    /// Classify a task.
    ///
    /// `pinned` is the caller's explicit choice and is always honoured;
    /// `manifest_default` applies until `min_samples` completed durations
    /// have been observed for the plugin.
    pub fn classify(
        &self,
        plugin_id: &str,
        manifest_default: QueueKind,
        pinned: Option<QueueKind>,
    ) -> QueueKind {
        if let Some(queue) = pinned {
            return queue;
        }
        if let Some(window) = self.windows.get(plugin_id) {
            if window.len() >= self.min_samples {
                if let Some(mean) = window.mean_ms() {
                    return if mean < self.threshold.as_millis() as f64 {
                        QueueKind::Fast
                    } else {
                        QueueKind::Background
                    };
                }
            }
        }
        manifest_default
    }
}
