//! # File State Manager
//!
//! Per-file lifecycle tracking for the streaming pipeline:
//! `discovered → light → hash → done`, with `failed` as the terminal error
//! state. Transitions are monotone except `retry`, which resets a failed
//! file to the pending side of the phase it failed in.
//!
//! The map is mutated concurrently by every pipeline dispatcher, so all
//! state lives in a `DashMap` and the failure log behind a mutex.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Mutex;

/// Processing phase of a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilePhase {
    /// Seen in the discovery stream, not yet validated or hashed.
    Discovered,
    /// Identity hash and basic metadata in progress or finished.
    Light,
    /// Full content hash in progress.
    Hash,
    /// All phases finished.
    Done,
    /// Retries exhausted; details in the failure log.
    Failed,
}

impl FilePhase {
    fn rank(self) -> u8 {
        match self {
            FilePhase::Discovered => 0,
            FilePhase::Light => 1,
            FilePhase::Hash => 2,
            FilePhase::Done => 3,
            FilePhase::Failed => 4,
        }
    }
}

/// Tracked record for one file path.
#[derive(Debug, Clone, Serialize)]
pub struct FileState {
    pub file_path: String,
    /// Identity hash once the light phase has computed it.
    pub file_hash: Option<String>,
    pub phase: FilePhase,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// One entry in the permanent failure log.
#[derive(Debug, Clone, Serialize)]
pub struct FailureEntry {
    pub file_path: String,
    pub phase: FilePhase,
    pub error: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
}

/// Aggregate counts served by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub discovered: usize,
    pub light: usize,
    pub hash: usize,
    pub done: usize,
    pub failed: usize,
    pub total: usize,
}

/// Concurrent per-path lifecycle tracker.
pub struct StateManager {
    files: DashMap<String, FileState>,
    failures: Mutex<Vec<FailureEntry>>,
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            files: DashMap::new(),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Register a file from the discovery stream. Re-discovery of a path
    /// already past `Discovered` is a no-op.
    pub fn add_discovered(&self, path: &str) {
        self.files
            .entry(path.to_string())
            .or_insert_with(|| FileState {
                file_path: path.to_string(),
                file_hash: None,
                phase: FilePhase::Discovered,
                retry_count: 0,
                last_error: None,
                updated_at: Utc::now(),
            });
    }

    /// Advance a file to `phase`. Backward transitions are ignored so a
    /// late dispatcher cannot undo progress, and `Failed` only leaves via
    /// retry.
    pub fn advance(&self, path: &str, phase: FilePhase) {
        if let Some(mut entry) = self.files.get_mut(path) {
            if entry.phase == FilePhase::Failed {
                return;
            }
            if phase.rank() > entry.phase.rank() {
                entry.phase = phase;
                entry.updated_at = Utc::now();
            }
        }
    }

    /// Record the identity hash computed in the light phase.
    pub fn set_hash(&self, path: &str, hash: &str) {
        if let Some(mut entry) = self.files.get_mut(path) {
            entry.file_hash = Some(hash.to_string());
            entry.updated_at = Utc::now();
        }
    }

    /// Increment the retry counter and return the new value.
    pub fn bump_retry(&self, path: &str, error: &str) -> u32 {
        match self.files.get_mut(path) {
            Some(mut entry) => {
                entry.retry_count += 1;
                entry.last_error = Some(error.to_string());
                entry.updated_at = Utc::now();
                entry.retry_count
            }
            None => 0,
        }
    }

    /// Mark a file permanently failed and append it to the failure log.
    pub fn mark_failed(&self, path: &str, phase: FilePhase, error: &str) {
        let retry_count = if let Some(mut entry) = self.files.get_mut(path) {
            entry.phase = FilePhase::Failed;
            entry.last_error = Some(error.to_string());
            entry.updated_at = Utc::now();
            entry.retry_count
        } else {
            0
        };
        self.failures.lock().unwrap().push(FailureEntry {
            file_path: path.to_string(),
            phase,
            error: error.to_string(),
            retry_count,
            failed_at: Utc::now(),
        });
        tracing::warn!(path, ?phase, error, "file permanently failed");
    }

    /// Reset a failed file so the pipeline can pick it up again.
    ///
    /// Returns the phase to re-enter, or `None` when the path is unknown
    /// or not failed.
    pub fn retry_file(&self, path: &str) -> Option<FilePhase> {
        let mut entry = self.files.get_mut(path)?;
        if entry.phase != FilePhase::Failed {
            return None;
        }
        // Resume at the phase the failure was logged for; without a hash the
        // light phase never finished.
        let resume = if entry.file_hash.is_some() {
            FilePhase::Hash
        } else {
            FilePhase::Discovered
        };
        entry.phase = resume;
        entry.retry_count = 0;
        entry.last_error = None;
        entry.updated_at = Utc::now();
        Some(resume)
    }

    /// Reset every failed file; returns the affected paths and their resume
    /// phases.
    pub fn retry_all_failed(&self) -> Vec<(String, FilePhase)> {
        let failed: Vec<String> = self
            .files
            .iter()
            .filter(|entry| entry.phase == FilePhase::Failed)
            .map(|entry| entry.key().clone())
            .collect();
        failed
            .into_iter()
            .filter_map(|path| self.retry_file(&path).map(|phase| (path, phase)))
            .collect()
    }

    pub fn remove_file(&self, path: &str) {
        self.files.remove(path);
    }

    pub fn get(&self, path: &str) -> Option<FileState> {
        self.files.get(path).map(|entry| entry.clone())
    }

    pub fn retry_count(&self, path: &str) -> u32 {
        self.files.get(path).map(|e| e.retry_count).unwrap_or(0)
    }

    pub fn failed_files(&self) -> Vec<FailureEntry> {
        self.failures.lock().unwrap().clone()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let mut snapshot = StateSnapshot {
            discovered: 0,
            light: 0,
            hash: 0,
            done: 0,
            failed: 0,
            total: 0,
        };
        for entry in self.files.iter() {
            snapshot.total += 1;
            match entry.phase {
                FilePhase::Discovered => snapshot.discovered += 1,
                FilePhase::Light => snapshot.light += 1,
                FilePhase::Hash => snapshot.hash += 1,
                FilePhase::Done => snapshot.done += 1,
                FilePhase::Failed => snapshot.failed += 1,
            }
        }
        snapshot
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}
