//! # Plugin Task Scheduler
//!
//! The core of the daemon: accepts `(file, plugin)` tasks, orders them on
//! two cooperative queues, dispatches them to workers, tracks asynchronous
//! callbacks, enforces per-file dependency ordering, and emits
//! `file:complete` when every task for a file has settled.
//!
//! ## Queues
//!
//! Two bounded-concurrency queues express priority without preemption:
//!
//! - the **fast** queue (budget 32) runs freely
//! - the **background** queue (budget 8) is paused by default, resumes
//!   when the fast queue goes idle, and is paused again the moment a fast
//!   task is enqueued
//!
//! A task holds its queue slot for the entire dispatch: dependency wait,
//! HTTP POST, and callback future included. The budgets are sized for
//! that.
//!
//! ## Dispatch algorithm
//!
//! Per task, under its queue's budget:
//!
//! 1. wait up to 30 s for unsettled dependencies; on timeout proceed with
//!    stale metadata (logged once, never fails the task)
//! 2. select a healthy instance round-robin; none → fail with
//!    `no_healthy_instance`
//! 3. mark dispatched, record the instance
//! 4. fetch the latest metadata so output of just-settled dependencies is
//!    visible
//! 5. POST `/process` with a 10 s dispatch deadline; anything but
//!    `accepted` fails the task
//! 6. await the worker callback under the manifest timeout (default 60 s);
//!    expiry marks the task `timeout`
//!
//! ## Settlement
//!
//! Every terminal outcome (completed, failed, timeout, cancelled) settles
//! the plugin in the file's completion fence, so a failed dependency never
//! hangs its descendants. When the last task of a file settles, the fence
//! is destroyed and `file:complete` fires exactly once.

pub mod classify;
pub mod fence;
pub mod queue;

use crate::config::SchedulerConfig;
use crate::events::{Event, EventBus};
use crate::gate::{GateController, GateStatus};
use crate::store::MetadataStore;
use crate::worker_manager::WorkerManager;
use chrono::{DateTime, Utc};
use classify::Classifier;
use dashmap::DashMap;
use fence::{CompletionFence, WaitOutcome};
use futures::FutureExt;
use mediasort_worker_sdk::graph;
use mediasort_worker_sdk::protocol::{
    CallbackPayload, CallbackStatus, ProcessRequest, QueueKind,
};
use queue::{DispatchQueue, QueueStats};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Reason string for tasks failed because no instance was selectable.
pub const NO_HEALTHY_INSTANCE: &str = "no_healthy_instance";

/// Status of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Waiting,
    Dispatched,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Cancelled
        )
    }
}

/// One plugin invocation for one file. Owned exclusively by the scheduler;
/// everything else refers to tasks by id.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: Uuid,
    pub file_hash: String,
    pub file_path: String,
    pub plugin_id: String,
    pub dependencies: Vec<String>,
    pub queue: QueueKind,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub instance_name: Option<String>,
    pub error: Option<String>,
    /// Metadata attached at creation; used when the store has no record yet.
    #[serde(skip)]
    pub existing_meta: Value,
}

/// Currently-dispatched task, as listed by the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchedTask {
    pub id: Uuid,
    pub plugin_id: String,
    pub file_hash: String,
    pub instance_name: Option<String>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

/// Aggregate scheduler statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub fast: QueueStats,
    pub background: QueueStats,
    pub pending_tasks: usize,
    pub pending_callbacks: usize,
    pub files_running: usize,
    pub files_waiting: usize,
    pub created: u64,
    pub completed: u64,
    pub failed: u64,
    /// Rolling mean completed duration per plugin, in milliseconds.
    pub plugin_mean_ms: std::collections::HashMap<String, f64>,
    pub dispatched: Vec<DispatchedTask>,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// The two-tier plugin task scheduler.
pub struct Scheduler {
    config: SchedulerConfig,
    workers: Arc<WorkerManager>,
    store: Arc<dyn MetadataStore>,
    events: EventBus,
    gate: Arc<GateController>,
    fast: Arc<DispatchQueue>,
    background: Arc<DispatchQueue>,
    tasks: DashMap<Uuid, Task>,
    file_tasks: DashMap<String, HashSet<Uuid>>,
    callbacks: DashMap<Uuid, oneshot::Sender<CallbackPayload>>,
    fence: CompletionFence,
    classifier: Classifier,
    counters: Counters,
    callback_url: String,
    meta_core_url: String,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        workers: Arc<WorkerManager>,
        store: Arc<dyn MetadataStore>,
        gate: Arc<GateController>,
        events: EventBus,
        callback_url: String,
        meta_core_url: String,
    ) -> Arc<Self> {
        let fast = DispatchQueue::new("fast", config.fast_concurrency, false);
        let background = DispatchQueue::new("background", config.background_concurrency, true);
        // Even when the background queue is momentarily unpaused, no
        // background job may start while the fast queue holds work.
        let fast_gate = Arc::clone(&fast);
        background.set_throttle(Box::new(move || fast_gate.pending() == 0));
        let classifier = Classifier::new(config.fast_threshold, config.min_samples);

        let scheduler = Arc::new(Self {
            config,
            workers,
            store,
            events,
            gate,
            fast,
            background,
            tasks: DashMap::new(),
            file_tasks: DashMap::new(),
            callbacks: DashMap::new(),
            fence: CompletionFence::new(),
            classifier,
            counters: Counters::default(),
            callback_url,
            meta_core_url,
            coordinator: Mutex::new(None),
        });
        scheduler.start_coordinator();
        scheduler
    }

    /// Keep the background queue paused exactly while the fast queue has
    /// work. `enqueue_task` also pauses synchronously on fast enqueue;
    /// this task converges the state after any interleaving.
    fn start_coordinator(self: &Arc<Self>) {
        let mut idle = self.fast.idle_watch();
        let background = Arc::clone(&self.background);
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            loop {
                let fast_idle = *idle.borrow_and_update();
                if fast_idle {
                    if background.resume() {
                        events.emit(Event::QueueResumed {
                            queue: QueueKind::Background,
                        });
                    }
                    background.kick();
                } else if background.pause() {
                    events.emit(Event::QueuePaused {
                        queue: QueueKind::Background,
                    });
                }
                if idle.changed().await.is_err() {
                    break;
                }
            }
        });
        *self.coordinator.lock().unwrap() = Some(handle);
    }

    /// Create and register a task. The task is tracked under its file hash
    /// immediately; it enters a queue only via [`enqueue_task`](Self::enqueue_task).
    pub fn create_task(
        &self,
        plugin_id: &str,
        file_hash: &str,
        file_path: &str,
        dependencies: Vec<String>,
        queue: QueueKind,
        existing_meta: Value,
    ) -> Task {
        let task = Task {
            id: Uuid::new_v4(),
            file_hash: file_hash.to_string(),
            file_path: file_path.to_string(),
            plugin_id: plugin_id.to_string(),
            dependencies,
            queue,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            dispatched_at: None,
            completed_at: None,
            duration_ms: None,
            instance_name: None,
            error: None,
            existing_meta,
        };
        self.tasks.insert(task.id, task.clone());
        self.file_tasks
            .entry(file_hash.to_string())
            .or_default()
            .insert(task.id);
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        self.events.emit(Event::TaskCreated {
            task_id: task.id,
            plugin_id: task.plugin_id.clone(),
            file_hash: task.file_hash.clone(),
        });
        task
    }

    /// Admit a task to its queue.
    ///
    /// Returns `false` when the gate is closed; the task is untracked and
    /// never dispatched. This is a signalling result, not an error.
    pub fn enqueue_task(self: &Arc<Self>, task: &Task) -> bool {
        if !self.gate.is_open() {
            self.untrack(task.id);
            tracing::debug!(task = %task.id, "gate closed, task rejected");
            return false;
        }

        let scheduler = Arc::clone(self);
        let task_id = task.id;
        let job = async move { scheduler.run_dispatch(task_id).await }.boxed();

        match task.queue {
            QueueKind::Fast => {
                // Fast work pre-empts the background tier by starving it.
                // Push first so the background throttle already sees the
                // fast queue as busy, then pause.
                self.fast.push(job);
                if self.background.pause() {
                    self.events.emit(Event::QueuePaused {
                        queue: QueueKind::Background,
                    });
                }
                if self.fast.pending() == 0 {
                    // The job finished between push and pause; do not
                    // leave the background tier stranded
                    self.background.resume();
                }
            }
            QueueKind::Background => self.background.push(job),
        }
        true
    }

    /// Fan one file out to every dispatchable plugin.
    ///
    /// A task is created per active plugin with a healthy instance whose
    /// filter accepts the file; dependencies are restricted to plugins
    /// that actually received a task for this file. Returns the number of
    /// tasks enqueued.
    pub fn dispatch_all(self: &Arc<Self>, file_hash: &str, file_path: &str, existing_meta: Value) -> usize {
        let manifests = self.workers.dispatchable_manifests();
        let ext = Path::new(file_path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        let size = existing_meta.get("size").and_then(Value::as_u64).unwrap_or(0);

        let selected: Vec<_> = manifests
            .iter()
            .filter(|manifest| {
                manifest
                    .filter
                    .as_ref()
                    .map(|filter| filter.accepts(&ext, size))
                    .unwrap_or(true)
            })
            .collect();
        let selected_ids: HashSet<String> =
            selected.iter().map(|m| m.id.clone()).collect();

        // Fast tasks are enqueued first so the background queue is paused
        // before any background task of this file can start.
        let mut classified: Vec<_> = selected
            .into_iter()
            .map(|manifest| {
                let queue = self
                    .classifier
                    .classify(&manifest.id, manifest.default_queue, None);
                (manifest, queue)
            })
            .collect();
        classified.sort_by_key(|(manifest, queue)| {
            (*queue != QueueKind::Fast, manifest.priority, manifest.id.clone())
        });

        // Register the whole task set before the first enqueue. A task
        // with no dependencies can settle on another worker thread while
        // this loop is still running; the completion check must only ever
        // see the file's full membership, or `file:complete` fires early
        // and a second time once the remaining tasks settle.
        let tasks: Vec<Task> = classified
            .into_iter()
            .map(|(manifest, queue)| {
                let dependencies = graph::active_dependencies(manifest, &selected_ids);
                self.create_task(
                    &manifest.id,
                    file_hash,
                    file_path,
                    dependencies,
                    queue,
                    existing_meta.clone(),
                )
            })
            .collect();

        let mut enqueued = 0;
        for task in &tasks {
            if self.enqueue_task(task) {
                enqueued += 1;
            }
        }
        enqueued
    }

    /// Route a worker callback to its outstanding task.
    ///
    /// Returns `false` for unknown or expired task ids, including a
    /// second reply for an already-settled task, which are dropped
    /// without side effect.
    pub fn handle_callback(&self, payload: CallbackPayload) -> bool {
        let Some((_, sender)) = self.callbacks.remove(&payload.task_id) else {
            tracing::warn!(task = %payload.task_id, plugin = %payload.plugin_id,
                "callback for unknown task dropped");
            return false;
        };
        if sender.send(payload).is_err() {
            // The dispatch future was reaped between lookup and send
            return false;
        }
        true
    }

    /// Cancel every non-terminal task of a file and remove its tracking.
    ///
    /// Outstanding callback futures are rejected synchronously; a late
    /// worker callback for a cancelled task is dropped like any unknown
    /// task. No `file:complete` is emitted for a cancelled file.
    pub fn cancel_file(&self, file_hash: &str) {
        let Some((_, task_ids)) = self.file_tasks.remove(file_hash) else {
            return;
        };
        for task_id in task_ids {
            self.callbacks.remove(&task_id);
            if let Some(mut task) = self.tasks.get_mut(&task_id) {
                if !task.status.is_terminal() {
                    task.status = TaskStatus::Cancelled;
                    task.error = Some("cancelled".to_string());
                    task.completed_at = Some(Utc::now());
                }
            }
        }
        self.fence.clear(file_hash);
        tracing::info!(file = %file_hash, "file cancelled");
    }

    /// Reject every pending callback and drop all queued work. In-flight
    /// dispatch steps observe their task as cancelled and bail.
    pub fn clear(&self) {
        self.fast.clear();
        self.background.clear();
        self.callbacks.clear();
        for mut task in self.tasks.iter_mut() {
            if !task.status.is_terminal() {
                task.status = TaskStatus::Cancelled;
                task.error = Some("cleared".to_string());
                task.completed_at = Some(Utc::now());
            }
        }
        self.file_tasks.clear();
        self.fence.clear_all();
    }

    pub fn set_gate(&self, open: bool) {
        self.gate.set_open(open);
    }

    pub fn is_gate_open(&self) -> bool {
        self.gate.is_open()
    }

    pub fn gate_status(&self) -> GateStatus {
        self.gate.status()
    }

    /// Poll both queues until they are drained or `max_wait` elapses.
    /// Returns `true` when both queues show zero running and zero waiting.
    pub async fn wait_for_empty(&self, max_wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if self.fast.pending() == 0 && self.background.pending() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.drain_poll).await;
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut files_running = HashSet::new();
        let mut files_waiting = HashSet::new();
        let mut pending_tasks = 0;
        let mut dispatched = Vec::new();
        for task in self.tasks.iter() {
            if !task.status.is_terminal() {
                pending_tasks += 1;
            }
            match task.status {
                TaskStatus::Dispatched => {
                    files_running.insert(task.file_hash.clone());
                    dispatched.push(DispatchedTask {
                        id: task.id,
                        plugin_id: task.plugin_id.clone(),
                        file_hash: task.file_hash.clone(),
                        instance_name: task.instance_name.clone(),
                        dispatched_at: task.dispatched_at,
                    });
                }
                TaskStatus::Waiting => {
                    files_waiting.insert(task.file_hash.clone());
                }
                _ => {}
            }
        }

        SchedulerStats {
            fast: self.fast.stats(),
            background: self.background.stats(),
            pending_tasks,
            pending_callbacks: self.callbacks.len(),
            files_running: files_running.len(),
            files_waiting: files_waiting.len(),
            created: self.counters.created.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            plugin_mean_ms: self.classifier.means(),
            dispatched,
        }
    }

    /// Look up a task by id.
    pub fn task(&self, task_id: Uuid) -> Option<Task> {
        self.tasks.get(&task_id).map(|task| task.clone())
    }

    /// Whether any task for the file is still tracked (i.e. not every
    /// task has settled).
    pub fn has_pending_tasks(&self, file_hash: &str) -> bool {
        self.file_tasks.contains_key(file_hash)
    }

    /// Event bus the scheduler publishes on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ---- dispatch internals -------------------------------------------------

    /// The per-task dispatch step, running under its queue's budget.
    async fn run_dispatch(self: Arc<Self>, task_id: Uuid) {
        let Some((file_hash, plugin_id, dependencies)) = self.tasks.get(&task_id).map(|task| {
            (
                task.file_hash.clone(),
                task.plugin_id.clone(),
                task.dependencies.clone(),
            )
        }) else {
            return;
        };
        if self.is_reaped(task_id) {
            return;
        }

        // Step 1: dependency fence
        let missing: Vec<String> = dependencies
            .iter()
            .filter(|dep| !self.fence.is_settled(&file_hash, dep))
            .cloned()
            .collect();
        if !missing.is_empty() {
            self.set_status(task_id, TaskStatus::Waiting);
            self.events.emit(Event::TaskWaiting {
                task_id,
                plugin_id: plugin_id.clone(),
                file_hash: file_hash.clone(),
                pending_deps: missing.clone(),
            });
            let waits = missing.iter().map(|dep| self.fence.wait(&file_hash, dep));
            match tokio::time::timeout(
                self.config.dependency_timeout,
                futures::future::join_all(waits),
            )
            .await
            {
                Ok(outcomes) => {
                    if outcomes.contains(&WaitOutcome::Cleared) && self.is_reaped(task_id) {
                        return;
                    }
                }
                Err(_) => {
                    tracing::warn!(
                        task = %task_id,
                        plugin = %plugin_id,
                        deps = ?missing,
                        "dependency wait timed out, dispatching with stale metadata"
                    );
                }
            }
            if self.is_reaped(task_id) {
                return;
            }
        }

        // Step 2: instance selection
        let Some(instance) = self.workers.select_healthy(&plugin_id) else {
            self.fail_task(task_id, NO_HEALTHY_INSTANCE.to_string(), TaskStatus::Failed);
            return;
        };

        // Step 3: mark dispatched
        {
            let Some(mut task) = self.tasks.get_mut(&task_id) else {
                return;
            };
            if task.status.is_terminal() {
                return;
            }
            task.status = TaskStatus::Dispatched;
            task.dispatched_at = Some(Utc::now());
            task.instance_name = Some(instance.instance_name.clone());
        }
        self.events.emit(Event::TaskDispatched {
            task_id,
            plugin_id: plugin_id.clone(),
            file_hash: file_hash.clone(),
            instance_name: instance.instance_name.clone(),
        });

        // Step 4: latest metadata, so output of just-settled deps is visible
        let mut existing_meta = self.store.fetch(&file_hash).await;
        if existing_meta.is_null() {
            existing_meta = self
                .tasks
                .get(&task_id)
                .map(|task| task.existing_meta.clone())
                .unwrap_or(Value::Null);
        }

        // Step 5: register the callback future, then hand over the task.
        // Registration comes first so a worker that answers and calls back
        // near-instantly cannot lose the race.
        let (sender, receiver) = oneshot::channel();
        self.callbacks.insert(task_id, sender);

        let request = ProcessRequest {
            task_id,
            cid: file_hash.clone(),
            file_path: self
                .tasks
                .get(&task_id)
                .map(|task| task.file_path.clone())
                .unwrap_or_default(),
            callback_url: self.callback_url.clone(),
            meta_core_url: self.meta_core_url.clone(),
            existing_meta,
        };
        if let Err(error) = instance
            .client()
            .process(&request, self.config.dispatch_timeout)
            .await
        {
            self.callbacks.remove(&task_id);
            self.workers
                .record_outcome(&plugin_id, &instance.instance_name, false);
            self.fail_task(task_id, error.to_string(), TaskStatus::Failed);
            return;
        }

        // Step 6: await the callback under the manifest deadline
        let callback_timeout = self
            .workers
            .manifest(&plugin_id)
            .and_then(|manifest| manifest.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(self.config.callback_timeout);

        match tokio::time::timeout(callback_timeout, receiver).await {
            Ok(Ok(payload)) => self.finalize_from_callback(task_id, &instance.instance_name, payload),
            Ok(Err(_)) => {
                // Sender dropped: the task was cancelled or cleared
            }
            Err(_) => {
                self.callbacks.remove(&task_id);
                self.events.emit(Event::TaskTimeout {
                    task_id,
                    plugin_id: plugin_id.clone(),
                    file_hash: file_hash.clone(),
                });
                self.workers
                    .record_outcome(&plugin_id, &instance.instance_name, false);
                self.fail_task(task_id, "callback timeout".to_string(), TaskStatus::Timeout);
            }
        }
    }

    fn finalize_from_callback(
        &self,
        task_id: Uuid,
        instance_name: &str,
        payload: CallbackPayload,
    ) {
        match payload.status {
            CallbackStatus::Completed | CallbackStatus::Skipped => {
                if payload.status == CallbackStatus::Skipped {
                    tracing::debug!(
                        task = %task_id,
                        reason = payload.reason.as_deref().unwrap_or("unspecified"),
                        "task skipped by worker"
                    );
                }
                self.complete_task(task_id, instance_name, payload.duration_ms);
            }
            CallbackStatus::Failed => {
                self.workers.record_outcome(
                    &payload.plugin_id,
                    instance_name,
                    false,
                );
                self.fail_task(
                    task_id,
                    payload.error.unwrap_or_else(|| "worker failure".to_string()),
                    TaskStatus::Failed,
                );
            }
        }
    }

    fn complete_task(&self, task_id: Uuid, instance_name: &str, duration_ms: Option<u64>) {
        let Some((file_hash, plugin_id, duration)) = ({
            let mut task = match self.tasks.get_mut(&task_id) {
                Some(task) => task,
                None => return,
            };
            if task.status.is_terminal() {
                None
            } else {
                let now = Utc::now();
                let duration = duration_ms.unwrap_or_else(|| {
                    task.dispatched_at
                        .map(|at| (now - at).num_milliseconds().max(0) as u64)
                        .unwrap_or(0)
                });
                task.status = TaskStatus::Completed;
                task.completed_at = Some(now);
                task.duration_ms = Some(duration);
                Some((task.file_hash.clone(), task.plugin_id.clone(), duration))
            }
        }) else {
            return;
        };

        self.classifier.record(&plugin_id, duration);
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        self.workers.record_outcome(&plugin_id, instance_name, true);
        self.events.emit(Event::TaskCompleted {
            task_id,
            plugin_id: plugin_id.clone(),
            file_hash: file_hash.clone(),
            duration_ms: duration,
        });
        self.settle_and_check(&file_hash, &plugin_id);
    }

    fn fail_task(&self, task_id: Uuid, error: String, status: TaskStatus) {
        debug_assert!(status.is_terminal());
        let Some((file_hash, plugin_id)) = ({
            let mut task = match self.tasks.get_mut(&task_id) {
                Some(task) => task,
                None => return,
            };
            if task.status.is_terminal() {
                None
            } else {
                task.status = status;
                task.completed_at = Some(Utc::now());
                task.error = Some(error.clone());
                Some((task.file_hash.clone(), task.plugin_id.clone()))
            }
        }) else {
            return;
        };

        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        if status != TaskStatus::Timeout {
            self.events.emit(Event::TaskFailed {
                task_id,
                plugin_id: plugin_id.clone(),
                file_hash: file_hash.clone(),
                error,
            });
        }
        self.settle_and_check(&file_hash, &plugin_id);
    }

    /// Settle the plugin in the file's fence and emit `file:complete` if
    /// this was the file's last outstanding task.
    fn settle_and_check(&self, file_hash: &str, plugin_id: &str) {
        self.fence.settle(file_hash, plugin_id);
        self.check_file_complete(file_hash);
    }

    fn check_file_complete(&self, file_hash: &str) {
        // Capture a path before removal; any task of the file carries it
        let file_path = self
            .file_tasks
            .get(file_hash)
            .and_then(|ids| ids.iter().next().copied())
            .and_then(|id| self.tasks.get(&id).map(|task| task.file_path.clone()));

        let removed = self.file_tasks.remove_if(file_hash, |_, task_ids| {
            task_ids.iter().all(|id| {
                self.tasks
                    .get(id)
                    .map(|task| task.status.is_terminal())
                    .unwrap_or(true)
            })
        });

        if removed.is_some() {
            self.fence.clear(file_hash);
            self.events.emit(Event::FileComplete {
                file_hash: file_hash.to_string(),
                file_path: file_path.unwrap_or_default(),
            });
        }
    }

    fn set_status(&self, task_id: Uuid, status: TaskStatus) {
        if let Some(mut task) = self.tasks.get_mut(&task_id) {
            if !task.status.is_terminal() {
                task.status = status;
            }
        }
    }

    /// Whether the task is gone or already terminal (cancelled underneath
    /// a dispatch step).
    fn is_reaped(&self, task_id: Uuid) -> bool {
        self.tasks
            .get(&task_id)
            .map(|task| task.status.is_terminal())
            .unwrap_or(true)
    }

    fn untrack(&self, task_id: Uuid) {
        if let Some((_, task)) = self.tasks.remove(&task_id) {
            let now_empty = match self.file_tasks.get_mut(&task.file_hash) {
                Some(mut ids) => {
                    ids.remove(&task_id);
                    ids.is_empty()
                }
                None => return,
            };
            if now_empty {
                self.file_tasks
                    .remove_if(&task.file_hash, |_, ids| ids.is_empty());
            } else {
                // The untracked task may have been the last non-terminal
                // one standing between its siblings and completion
                self.check_file_complete(&task.file_hash);
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.coordinator.lock().unwrap().take() {
            handle.abort();
        }
    }
}
