//! # Typed Event Fan-out
//!
//! Every state transition in the scheduler, worker manager and pipeline is
//! published as a closed set of typed events. Emission is fire-and-forget
//! over a `tokio::sync::broadcast` channel: subscribers that fall behind
//! lose old events rather than exerting back-pressure on dispatch.
//!
//! Subscribers include the streaming pipeline (which marks a file done on
//! `FileComplete`) and tests asserting event ordering.

use mediasort_worker_sdk::protocol::QueueKind;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Capacity of the broadcast ring. Laggards skip, they never block.
const EVENT_CAPACITY: usize = 1024;

/// The closed set of events the core emits.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A task was created and registered under its file hash.
    TaskCreated {
        task_id: Uuid,
        plugin_id: String,
        file_hash: String,
    },
    /// A task began waiting on unsettled dependencies.
    TaskWaiting {
        task_id: Uuid,
        plugin_id: String,
        file_hash: String,
        pending_deps: Vec<String>,
    },
    /// A task was handed to a worker instance.
    TaskDispatched {
        task_id: Uuid,
        plugin_id: String,
        file_hash: String,
        instance_name: String,
    },
    /// A worker callback settled the task successfully.
    TaskCompleted {
        task_id: Uuid,
        plugin_id: String,
        file_hash: String,
        duration_ms: u64,
    },
    /// The task reached a terminal failure.
    TaskFailed {
        task_id: Uuid,
        plugin_id: String,
        file_hash: String,
        error: String,
    },
    /// No callback arrived within the task's deadline.
    TaskTimeout {
        task_id: Uuid,
        plugin_id: String,
        file_hash: String,
    },
    /// Every task registered for the file reached a terminal state.
    FileComplete { file_hash: String, file_path: String },
    /// A worker instance transitioned to healthy.
    PluginHealthy {
        plugin_id: String,
        instance_name: String,
    },
    /// A worker instance transitioned to unhealthy.
    PluginUnhealthy {
        plugin_id: String,
        instance_name: String,
    },
    /// A plugin could not be activated or lost all instances.
    PluginError { plugin_id: String, error: String },
    /// A queue stopped accepting running work.
    QueuePaused { queue: QueueKind },
    /// A queue resumed.
    QueueResumed { queue: QueueKind },
}

impl Event {
    /// Stable name used in logs, mirroring the wire-style `task:created`
    /// family.
    pub fn name(&self) -> &'static str {
        match self {
            Event::TaskCreated { .. } => "task:created",
            Event::TaskWaiting { .. } => "task:waiting",
            Event::TaskDispatched { .. } => "task:dispatched",
            Event::TaskCompleted { .. } => "task:completed",
            Event::TaskFailed { .. } => "task:failed",
            Event::TaskTimeout { .. } => "task:timeout",
            Event::FileComplete { .. } => "file:complete",
            Event::PluginHealthy { .. } => "plugin:healthy",
            Event::PluginUnhealthy { .. } => "plugin:unhealthy",
            Event::PluginError { .. } => "plugin:error",
            Event::QueuePaused { .. } => "queue:paused",
            Event::QueueResumed { .. } => "queue:resumed",
        }
    }
}

/// Cloneable handle for publishing and subscribing to core events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Publish an event. Never blocks; an event with no subscribers is
    /// simply dropped.
    pub fn emit(&self, event: Event) {
        tracing::debug!(event = event.name(), "emit");
        let _ = self.sender.send(event);
    }

    /// Open a new subscription starting at the current tail.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(Event::FileComplete {
            file_hash: "h1".to_string(),
            file_path: "/a".to_string(),
        });
        match rx.recv().await.unwrap() {
            Event::FileComplete { file_hash, .. } => assert_eq!(file_hash, "h1"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        bus.emit(Event::QueuePaused {
            queue: QueueKind::Background,
        });
    }
}
