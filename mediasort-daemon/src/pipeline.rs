//! # Streaming Pipeline
//!
//! Consumes the discovery stream and walks every file through three
//! internal queues:
//!
//! 1. **validation**: extension check against the supported set;
//!    unsupported files are dropped silently. The only synchronous filter.
//! 2. **fast phase**: identity hash (cheap, cached by
//!    `{path,size,mtime}`), a small metadata record, collision detection,
//!    a batched `add` change, and the scheduler fan-out.
//! 3. **background phase**: full content hash, store update, and the
//!    `done` mark once the scheduler reports `file:complete` (or directly
//!    when no scheduler is attached).
//!
//! ## Identity-hash collisions
//!
//! Two paths can share an identity hash (same size and leading content).
//! The second arrival is *suppressed*: it is not exposed through the VFS
//! change feed, but it still gets processed; its plugin fan-out is
//! deferred to the background phase and grouped under the full content
//! hash, which is unique.
//!
//! ## Retries
//!
//! Each phase retries up to 10 times with a 1.5x escalating attempt
//! timeout, capped at 10 minutes for the fast phase and 4 hours for the
//! full hash. A file that exhausts its retries lands in the failure log
//! and leaves processing.

use crate::config::PipelineConfig;
use crate::events::{Event, EventBus};
use crate::hashing::{full_hash, IdentityHasher};
use crate::notifier::{ChangeAction, ChangeBatcher};
use crate::scheduler::queue::DispatchQueue;
use crate::scheduler::Scheduler;
use crate::state::{FilePhase, StateManager};
use crate::store::MetadataStore;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Aggregate pipeline counters.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub discovered: u64,
    pub validated: u64,
    pub suppressed: u64,
    pub done: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    discovered: AtomicU64,
    validated: AtomicU64,
    suppressed: AtomicU64,
    done: AtomicU64,
    failed: AtomicU64,
}

/// Everything a full-hash attempt carries between retries.
struct BackgroundJob {
    path: String,
    identity: String,
    meta: serde_json::Value,
    exposed: bool,
    /// Grouping key and event subscription from the fast-phase fan-out,
    /// when one happened.
    group: Option<(String, broadcast::Receiver<Event>)>,
}

/// Discovery-to-done processing pipeline.
pub struct StreamingPipeline {
    config: PipelineConfig,
    scheduler: Option<Arc<Scheduler>>,
    store: Arc<dyn MetadataStore>,
    state: Arc<StateManager>,
    batcher: Arc<ChangeBatcher>,
    hasher: IdentityHasher,
    validation: Arc<DispatchQueue>,
    fast: Arc<DispatchQueue>,
    background: Arc<DispatchQueue>,
    /// identity hash → first path registered under it
    identity_index: DashMap<String, String>,
    extensions: HashSet<String>,
    counters: Counters,
}

impl StreamingPipeline {
    pub fn new(
        config: PipelineConfig,
        scheduler: Option<Arc<Scheduler>>,
        store: Arc<dyn MetadataStore>,
        state: Arc<StateManager>,
        batcher: Arc<ChangeBatcher>,
    ) -> Arc<Self> {
        let extensions = config
            .extensions
            .iter()
            .map(|ext| ext.to_ascii_lowercase())
            .collect();
        Arc::new(Self {
            validation: DispatchQueue::new("validation", config.validation_concurrency, false),
            fast: DispatchQueue::new("pipeline-fast", config.fast_concurrency, false),
            background: DispatchQueue::new(
                "pipeline-background",
                config.background_concurrency,
                false,
            ),
            config,
            scheduler,
            store,
            state,
            batcher,
            hasher: IdentityHasher::new(),
            identity_index: DashMap::new(),
            extensions,
            counters: Counters::default(),
        })
    }

    /// Feed one discovered file into the pipeline.
    pub fn ingest(self: &Arc<Self>, path: impl Into<String>) {
        let path = path.into();
        self.counters.discovered.fetch_add(1, Ordering::Relaxed);
        self.state.add_discovered(&path);

        let pipeline = Arc::clone(self);
        self.validation.push(
            async move {
                pipeline.validate(path).await;
            }
            .boxed(),
        );
    }

    /// Re-enter the background phase for a file whose full hash failed,
    /// without redoing validation or the fast phase.
    ///
    /// The fast phase already ran for such a file: its metadata is in the
    /// store, its plugin fan-out (if any) settled long ago, and rerunning
    /// it would dispatch a second task set for a hash that completed once.
    /// This path only recomputes the full hash and finishes the file.
    pub fn resume_background(self: &Arc<Self>, path: impl Into<String>, identity: impl Into<String>) {
        let path = path.into();
        let identity = identity.into();
        let pipeline = Arc::clone(self);
        self.background.push(
            async move {
                let meta = pipeline.store.fetch(&identity).await;
                let exposed = {
                    let entry = pipeline
                        .identity_index
                        .entry(identity.clone())
                        .or_insert_with(|| path.clone());
                    entry.value() == &path
                };
                let job = BackgroundJob {
                    path,
                    identity,
                    meta,
                    exposed,
                    group: None,
                };
                let owner = Arc::clone(&pipeline);
                owner.run_background_phase(job, 0).await;
            }
            .boxed(),
        );
    }

    /// Drain a discovery stream into the pipeline.
    pub async fn ingest_stream<S>(self: &Arc<Self>, stream: S)
    where
        S: tokio_stream::Stream<Item = String> + Unpin,
    {
        use tokio_stream::StreamExt;
        let mut stream = stream;
        while let Some(path) = stream.next().await {
            self.ingest(path);
        }
    }

    /// Drained when every internal queue is empty.
    pub fn pending(&self) -> usize {
        self.validation.pending() + self.fast.pending() + self.background.pending()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            discovered: self.counters.discovered.load(Ordering::Relaxed),
            validated: self.counters.validated.load(Ordering::Relaxed),
            suppressed: self.counters.suppressed.load(Ordering::Relaxed),
            done: self.counters.done.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    async fn validate(self: Arc<Self>, path: String) {
        let ext = Path::new(&path)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if !self.extensions.contains(&ext) {
            // Unsupported files leave no trace
            tracing::debug!(%path, %ext, "unsupported extension dropped");
            self.state.remove_file(&path);
            return;
        }
        self.counters.validated.fetch_add(1, Ordering::Relaxed);

        let pipeline = Arc::clone(&self);
        self.fast.push(pipeline.run_fast_phase(path, 0));
    }

    /// Attempt timeout for the given phase and retry round: base * 1.5^attempt,
    /// capped per phase.
    fn attempt_timeout(&self, attempt: u32, cap: Duration) -> Duration {
        let base = self.config.base_timeout.as_millis() as f64;
        let scaled = base * 1.5f64.powi(attempt as i32);
        Duration::from_millis(scaled as u64).min(cap)
    }

    /// Jittered delay before a retry so a burst of failing files does not
    /// hammer the disk in lockstep.
    fn retry_delay(attempt: u32) -> Duration {
        use rand::Rng;
        let base = 250u64.saturating_mul(1u64 << attempt.min(6));
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis((base + jitter).min(30_000))
    }

    fn run_fast_phase(self: Arc<Self>, path: String, attempt: u32) -> BoxFuture<'static, ()> {
        async move {
            let budget = self.attempt_timeout(attempt, self.config.fast_retry_cap);
            let outcome = tokio::time::timeout(budget, self.fast_phase(&path)).await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(error)) => self.retry_fast(path, attempt, &error.to_string()),
                Err(_) => self.retry_fast(path, attempt, "fast phase timed out"),
            }
        }
        .boxed()
    }

    fn retry_fast(self: &Arc<Self>, path: String, attempt: u32, error: &str) {
        let retries = self.state.bump_retry(&path, error);
        if retries > self.config.max_retries {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            self.state.mark_failed(&path, FilePhase::Light, error);
            return;
        }
        tracing::warn!(%path, attempt, error, "fast phase retrying");
        let pipeline = Arc::clone(self);
        // Back off outside the queue so the retry does not hold a slot
        tokio::spawn(async move {
            tokio::time::sleep(Self::retry_delay(attempt)).await;
            let job_owner = Arc::clone(&pipeline);
            pipeline.fast.push(job_owner.run_fast_phase(path, attempt + 1));
        });
    }

    /// Identity hash, metadata record, collision check, change feed, and
    /// scheduler fan-out.
    async fn fast_phase(self: &Arc<Self>, path: &str) -> anyhow::Result<()> {
        self.state.advance(path, FilePhase::Light);

        let (identity, size) = self.hasher.identity_hash(Path::new(path)).await?;
        let ext = Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let name = Path::new(path)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        let meta = json!({
            "identityHash": identity,
            "path": path,
            "name": name,
            "ext": ext,
            "size": size,
        });

        self.store.merge(&identity, meta.clone()).await;
        self.state.set_hash(path, &identity);

        // Collision detection: the first path under an identity hash owns
        // the VFS entry; later arrivals are processed but never exposed.
        let exposed = {
            let entry = self
                .identity_index
                .entry(identity.clone())
                .or_insert_with(|| path.to_string());
            entry.value() == path
        };

        if exposed {
            self.batcher.queue_change(ChangeAction::Add, &identity).await;
        } else {
            self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                %path,
                identity = %identity,
                owner = %self.identity_index.get(&identity).map(|e| e.value().clone()).unwrap_or_default(),
                "identity hash collision, file suppressed from VFS"
            );
        }

        // Exposed files fan out under the identity hash now; suppressed
        // files defer to the background phase where the full hash becomes
        // their grouping key.
        let mut group = None;
        if exposed {
            if let Some(scheduler) = &self.scheduler {
                let events = scheduler.events().subscribe();
                let dispatched = scheduler.dispatch_all(&identity, path, meta.clone());
                if dispatched > 0 {
                    group = Some((identity.clone(), events));
                }
            }
        }

        let pipeline = Arc::clone(self);
        self.background.push(pipeline.run_background_phase(
            BackgroundJob {
                path: path.to_string(),
                identity,
                meta,
                exposed,
                group,
            },
            0,
        ));
        Ok(())
    }

    fn run_background_phase(self: Arc<Self>, mut job: BackgroundJob, attempt: u32) -> BoxFuture<'static, ()> {
        async move {
            let budget = self.attempt_timeout(attempt, self.config.background_retry_cap);
            let outcome = tokio::time::timeout(
                budget,
                self.background_phase(&job.path, &job.identity, &job.meta, job.exposed),
            )
            .await;
            match outcome {
                Ok(Ok(extra_group)) => {
                    // Wait for the scheduler outside the attempt budget;
                    // task termination is bounded by the scheduler's own
                    // timeouts.
                    for (hash, events) in job.group.take().into_iter().chain(extra_group) {
                        self.wait_file_complete(&hash, events).await;
                    }
                    self.counters.done.fetch_add(1, Ordering::Relaxed);
                    self.state.advance(&job.path, FilePhase::Done);
                }
                Ok(Err(error)) => self.retry_background(job, attempt, &error.to_string()),
                Err(_) => self.retry_background(job, attempt, "full hash timed out"),
            }
        }
        .boxed()
    }

    fn retry_background(self: &Arc<Self>, job: BackgroundJob, attempt: u32, error: &str) {
        let retries = self.state.bump_retry(&job.path, error);
        if retries > self.config.max_retries {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            self.state.mark_failed(&job.path, FilePhase::Hash, error);
            return;
        }
        tracing::warn!(path = %job.path, attempt, error, "full hash retrying");
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Self::retry_delay(attempt)).await;
            let job_owner = Arc::clone(&pipeline);
            pipeline
                .background
                .push(job_owner.run_background_phase(job, attempt + 1));
        });
    }

    /// Full content hash and store update. For suppressed files this is
    /// also where the plugin fan-out happens, grouped under the full hash.
    async fn background_phase(
        self: &Arc<Self>,
        path: &str,
        identity: &str,
        meta: &serde_json::Value,
        exposed: bool,
    ) -> anyhow::Result<Option<(String, broadcast::Receiver<Event>)>> {
        self.state.advance(path, FilePhase::Hash);

        let full = full_hash(Path::new(path)).await?;
        self.store
            .merge(identity, json!({ "fullHash": full }))
            .await;

        if !exposed {
            // The full hash is unique even when the identity hash collided
            self.store.merge(&full, meta.clone()).await;
            if let Some(scheduler) = &self.scheduler {
                let events = scheduler.events().subscribe();
                let dispatched = scheduler.dispatch_all(&full, path, meta.clone());
                if dispatched > 0 {
                    return Ok(Some((full, events)));
                }
            }
        }
        Ok(None)
    }

    /// Block until the scheduler has settled every task for the hash.
    async fn wait_file_complete(&self, hash: &str, mut events: broadcast::Receiver<Event>) {
        let Some(scheduler) = &self.scheduler else {
            return;
        };
        loop {
            if !scheduler.has_pending_tasks(hash) {
                return;
            }
            match events.recv().await {
                Ok(Event::FileComplete { file_hash, .. }) if file_hash == hash => return,
                Ok(_) => continue,
                // Lagged: re-check the pending set and keep listening
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}
