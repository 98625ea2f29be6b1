//! Node event streams and engine notifications.
//!
//! Each node kind emits a closed tagged union of events over a tokio
//! broadcast channel; the [`GraphStateManager`](crate::state::GraphStateManager)
//! folds them into per-node status and republishes [`Notification`]s on the
//! engine-wide hub. Within one node, notifications follow the local order of
//! events; across nodes no ordering is guaranteed.

use crate::llm::UsageSnapshot;
use crate::messages::Message;
use crate::status::{GraphStatus, NodeStatus, ThreadStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default capacity for node event channels
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by runtime nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// Runtime started and is ready for execs
    Start,
    /// Runtime stopped
    Stop,
    /// An exec began
    ExecStart {
        /// Unique exec id
        exec_id: String,
        /// Thread the exec belongs to, if any
        thread_id: Option<String>,
        /// Run the exec belongs to, if any
        run_id: Option<String>,
    },
    /// An exec finished
    ExecEnd {
        /// Exec id from the matching `ExecStart`
        exec_id: String,
        /// Failure text, if the exec failed
        error: Option<String>,
    },
}

/// Events emitted by agent nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A run began on a thread
    Invoke {
        /// External thread id
        thread_id: String,
        /// Run id
        run_id: String,
    },
    /// A new message was produced (delta by identity, emitted exactly once)
    Message {
        /// External thread id
        thread_id: String,
        /// Run id
        run_id: String,
        /// The new message
        message: Message,
    },
    /// Accumulated counters changed; carries the full snapshot
    StateUpdate {
        /// External thread id
        thread_id: String,
        /// Run id
        run_id: String,
        /// Complete token/cost snapshot
        usage: UsageSnapshot,
    },
    /// A run finished
    Run {
        /// External thread id
        thread_id: String,
        /// Run id
        run_id: String,
        /// Failure text; `None` on success
        error: Option<String>,
        /// Whether the run was cancelled rather than failed
        stopped: bool,
        /// Finish-tool flag: did the agent ask for more input?
        needs_more_info: bool,
    },
    /// The agent (or one of its threads) was stopped
    Stop {
        /// Thread scope; `None` stops every thread
        thread_id: Option<String>,
        /// Stop reason
        reason: String,
    },
}

/// Events emitted by trigger nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerEvent {
    /// Trigger started and accepts invocations
    Start,
    /// Trigger stopped
    Stop,
    /// The trigger forwarded an invocation to its agent
    Invoke {
        /// External thread id of the invocation
        thread_id: String,
    },
}

/// Engine-wide notification stream.
///
/// Identifiers are stable external ids; consumers must treat each
/// notification as the current truth for its subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Engine-level graph status transition
    Graph {
        /// Graph id
        graph_id: Uuid,
        /// New persisted status
        status: GraphStatus,
        /// Terminal error text, if any
        error: Option<String>,
    },
    /// Per-node base status transition (also emitted on invoke)
    GraphNodeUpdate {
        /// Graph id
        graph_id: Uuid,
        /// Node id
        node_id: String,
        /// New node status
        status: NodeStatus,
        /// Latest error text, if any
        error: Option<String>,
    },
    /// An agent began a run
    AgentInvoke {
        /// Graph id
        graph_id: Uuid,
        /// Agent node id
        node_id: String,
        /// External thread id
        thread_id: String,
        /// Run id
        run_id: String,
    },
    /// An agent produced a message
    AgentMessage {
        /// Graph id
        graph_id: Uuid,
        /// Agent node id
        node_id: String,
        /// External thread id
        thread_id: String,
        /// Run id
        run_id: String,
        /// The message
        message: Message,
    },
    /// An agent's counters changed
    AgentStateUpdate {
        /// Graph id
        graph_id: Uuid,
        /// Agent node id
        node_id: String,
        /// External thread id
        thread_id: String,
        /// Run id
        run_id: String,
        /// Complete token/cost snapshot
        usage: UsageSnapshot,
    },
    /// A thread reached a terminal status
    ThreadUpdate {
        /// Graph id
        graph_id: Uuid,
        /// Agent node id
        node_id: String,
        /// External thread id
        thread_id: String,
        /// New thread status
        status: ThreadStatus,
    },
}

/// Fan-out hub for [`Notification`]s.
///
/// Thin wrapper over a broadcast channel; emitting with no subscribers is a
/// no-op, not an error.
#[derive(Clone)]
pub struct NotificationHub {
    tx: broadcast::Sender<Notification>,
}

impl NotificationHub {
    /// Create a hub with the given buffer capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to the notification stream
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Publish a notification
    pub fn emit(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hub_delivers_to_subscribers() {
        let hub = NotificationHub::default();
        let mut rx = hub.subscribe();

        hub.emit(Notification::Graph {
            graph_id: Uuid::nil(),
            status: GraphStatus::Compiling,
            error: None,
        });

        match rx.recv().await.unwrap() {
            Notification::Graph { status, .. } => assert_eq!(status, GraphStatus::Compiling),
            other => panic!("unexpected notification: {:?}", other),
        }
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_noop() {
        let hub = NotificationHub::default();
        assert_eq!(hub.subscriber_count(), 0);
        hub.emit(Notification::Graph {
            graph_id: Uuid::nil(),
            status: GraphStatus::Running,
            error: None,
        });
    }

    #[test]
    fn events_tag_with_type_field() {
        let ev = RuntimeEvent::ExecStart {
            exec_id: "e1".into(),
            thread_id: None,
            run_id: None,
        };
        let value = serde_json::to_value(&ev).unwrap();
        assert_eq!(value["type"], "exec_start");
    }
}
