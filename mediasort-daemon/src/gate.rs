//! Admission gate used for safe drain and unmount.
//!
//! A single flag the scheduler consults on every enqueue. Closing it makes
//! `enqueue_task` reject new tasks while in-flight ones run to completion;
//! combined with `Scheduler::wait_for_empty` this gives a clean drain.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Point-in-time view of the gate, served by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct GateStatus {
    pub open: bool,
    /// When the gate was last closed, if it currently is.
    pub closed_at: Option<DateTime<Utc>>,
}

/// Process-wide admission flag. Open by default.
pub struct GateController {
    open: AtomicBool,
    closed_at: Mutex<Option<DateTime<Utc>>>,
}

impl GateController {
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            closed_at: Mutex::new(None),
        }
    }

    /// Open or close the gate. Opening is side-effect-free besides
    /// resumption of acceptance.
    pub fn set_open(&self, open: bool) {
        let was_open = self.open.swap(open, Ordering::SeqCst);
        let mut closed_at = self.closed_at.lock().unwrap();
        if open {
            *closed_at = None;
            if !was_open {
                tracing::info!("admission gate opened");
            }
        } else {
            *closed_at = Some(Utc::now());
            if was_open {
                tracing::info!("admission gate closed, draining");
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> GateStatus {
        GateStatus {
            open: self.is_open(),
            closed_at: *self.closed_at.lock().unwrap(),
        }
    }
}

impl Default for GateController {
    fn default() -> Self {
        Self::new()
    }
}
