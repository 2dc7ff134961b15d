//! # Dispatch Queue
//!
//! A cooperative bounded-concurrency queue: at most `concurrency` jobs run
//! simultaneously, the rest wait in FIFO order. Queues can be paused
//! (running jobs finish, waiting jobs stay put) and expose an idle signal
//! consumed by the scheduler to express fast-over-background priority:
//! the background queue is resumed exactly when the fast queue reports
//! idle, and paused again the moment a fast task is enqueued.
//!
//! Jobs are opaque futures; the queue neither knows nor cares that they
//! suspend on dependency fences, HTTP dispatches or callback futures while
//! holding their slot.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

type Job = BoxFuture<'static, ()>;

/// Occupancy counters served by the stats endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub running: usize,
    pub pending: usize,
    pub paused: bool,
}

struct Inner {
    waiting: VecDeque<Job>,
    running: usize,
    paused: bool,
}

type Throttle = Box<dyn Fn() -> bool + Send + Sync>;

/// Bounded-concurrency cooperative queue with pause/resume and an idle
/// watch signal.
pub struct DispatchQueue {
    name: &'static str,
    concurrency: usize,
    inner: Mutex<Inner>,
    idle_tx: watch::Sender<bool>,
    /// Gate evaluated before each job start; `false` holds the queue even
    /// when unpaused. Closes the race between pause signals and starts.
    throttle: Mutex<Option<Throttle>>,
}

impl DispatchQueue {
    /// Create a queue. A paused queue accepts jobs but does not start them
    /// until [`resume`](Self::resume).
    pub fn new(name: &'static str, concurrency: usize, paused: bool) -> Arc<Self> {
        let (idle_tx, _) = watch::channel(true);
        Arc::new(Self {
            name,
            concurrency: concurrency.max(1),
            inner: Mutex::new(Inner {
                waiting: VecDeque::new(),
                running: 0,
                paused,
            }),
            idle_tx,
            throttle: Mutex::new(None),
        })
    }

    /// Install a start gate. Evaluated before every job start; while it
    /// returns `false` no new job starts, running jobs are unaffected.
    pub fn set_throttle(&self, throttle: Throttle) {
        *self.throttle.lock().unwrap() = Some(throttle);
    }

    /// Re-evaluate the throttle and start jobs if slots are free.
    pub fn kick(self: &Arc<Self>) {
        self.pump();
    }

    /// Enqueue a job and start it immediately if a slot is free.
    pub fn push(self: &Arc<Self>, job: Job) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.waiting.push_back(job);
        }
        self.idle_tx.send_replace(false);
        self.pump();
    }

    /// Stop starting new jobs. Running jobs keep their slots.
    ///
    /// Returns whether the call changed the queue's state.
    pub fn pause(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.paused {
            return false;
        }
        inner.paused = true;
        tracing::debug!(queue = self.name, "queue paused");
        true
    }

    /// Resume starting jobs.
    ///
    /// Returns whether the call changed the queue's state.
    pub fn resume(self: &Arc<Self>) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.paused {
                return false;
            }
            inner.paused = false;
        }
        tracing::debug!(queue = self.name, "queue resumed");
        self.pump();
        true
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().unwrap().paused
    }

    /// Drop every waiting job. Running jobs are unaffected.
    pub fn clear(&self) {
        let became_idle = {
            let mut inner = self.inner.lock().unwrap();
            inner.waiting.clear();
            inner.running == 0
        };
        if became_idle {
            self.idle_tx.send_replace(true);
        }
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().unwrap();
        QueueStats {
            waiting: inner.waiting.len(),
            running: inner.running,
            pending: inner.waiting.len() + inner.running,
            paused: inner.paused,
        }
    }

    /// Waiting + running. Zero means the queue is drained.
    pub fn pending(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.waiting.len() + inner.running
    }

    /// Watch channel that flips to `true` whenever the queue has zero
    /// waiting and zero running jobs.
    pub fn idle_watch(&self) -> watch::Receiver<bool> {
        self.idle_tx.subscribe()
    }

    /// Start jobs until the budget is exhausted, the queue is paused or
    /// throttled, or nothing is waiting.
    fn pump(self: &Arc<Self>) {
        loop {
            {
                let throttle = self.throttle.lock().unwrap();
                if let Some(throttle) = throttle.as_ref() {
                    if !throttle() {
                        return;
                    }
                }
            }
            let job = {
                let mut inner = self.inner.lock().unwrap();
                if inner.paused || inner.running >= self.concurrency {
                    return;
                }
                match inner.waiting.pop_front() {
                    Some(job) => {
                        inner.running += 1;
                        job
                    }
                    None => return,
                }
            };

            let queue = Arc::clone(self);
            tokio::spawn(async move {
                // A panicking job must not leak its slot
                let _ = std::panic::AssertUnwindSafe(job).catch_unwind().await;
                queue.finish();
            });
        }
    }

    fn finish(self: &Arc<Self>) {
        let became_idle = {
            let mut inner = self.inner.lock().unwrap();
            inner.running -= 1;
            inner.waiting.is_empty() && inner.running == 0
        };
        if became_idle {
            self.idle_tx.send_replace(true);
        }
        self.pump();
    }
}
