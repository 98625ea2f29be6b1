//! Per-graph status tracking and notification fan-out.
//!
//! [`GraphState`] folds node-level events into per-node base status plus
//! ephemeral per-thread, per-run and per-exec entries. [`GraphStateManager`]
//! owns one fold task per observed node, so notifications for a node follow
//! the local order of its events; across nodes no ordering is guaranteed.
//!
//! The fold functions are synchronous and never await while holding the
//! state lock.

use crate::events::{AgentEvent, Notification, NotificationHub, RuntimeEvent, TriggerEvent};
use crate::status::{NodeStatus, ThreadStatus};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// A runtime exec currently in flight
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveExec {
    /// Thread the exec belongs to, if any
    pub thread_id: Option<String>,
    /// Run the exec belongs to, if any
    pub run_id: Option<String>,
    /// When the exec started
    pub started_at: DateTime<Utc>,
}

/// Tracked status of one node
#[derive(Debug, Clone)]
struct NodeState {
    base: NodeStatus,
    thread_statuses: HashMap<String, ThreadStatus>,
    run_statuses: HashMap<String, NodeStatus>,
    active_execs: HashMap<String, ActiveExec>,
    error: Option<String>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            base: NodeStatus::Starting,
            thread_statuses: HashMap::new(),
            run_statuses: HashMap::new(),
            active_execs: HashMap::new(),
            error: None,
        }
    }
}

/// Serializable view of one node's status
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    /// Node id
    pub node_id: String,
    /// Base status
    pub status: NodeStatus,
    /// Per-thread statuses (scoped when a filter was applied)
    pub thread_statuses: HashMap<String, ThreadStatus>,
    /// Per-run statuses (scoped when a filter was applied)
    pub run_statuses: HashMap<String, NodeStatus>,
    /// Execs in flight
    pub active_execs: HashMap<String, ActiveExec>,
    /// Latest error, if any
    pub error: Option<String>,
}

/// Optional thread/run scope for snapshot queries
#[derive(Debug, Clone, Default)]
pub struct StateScope {
    /// Restrict to entries of this thread
    pub thread_id: Option<String>,
    /// Restrict to entries of this run
    pub run_id: Option<String>,
}

impl StateScope {
    fn is_empty(&self) -> bool {
        self.thread_id.is_none() && self.run_id.is_none()
    }
}

/// Per-node status tracker for one graph
pub struct GraphState {
    graph_id: Uuid,
    nodes: RwLock<HashMap<String, NodeState>>,
}

impl GraphState {
    /// Create a tracker with every node at `Starting`
    pub fn new(graph_id: Uuid, node_ids: Vec<String>) -> Self {
        let nodes = node_ids
            .into_iter()
            .map(|id| (id, NodeState::default()))
            .collect();
        Self { graph_id, nodes: RwLock::new(nodes) }
    }

    /// Graph this tracker belongs to
    pub fn graph_id(&self) -> Uuid {
        self.graph_id
    }

    /// Threads currently marked `Running`, with their node ids
    pub fn running_threads(&self) -> Vec<(String, String)> {
        let nodes = self.nodes.read();
        nodes
            .iter()
            .flat_map(|(node_id, state)| {
                state
                    .thread_statuses
                    .iter()
                    .filter(|(_, s)| **s == ThreadStatus::Running)
                    .map(|(t, _)| (node_id.clone(), t.clone()))
            })
            .collect()
    }

    /// Snapshot every node, optionally scoped to a thread and/or run
    pub fn snapshots(&self, scope: &StateScope) -> Vec<NodeSnapshot> {
        let nodes = self.nodes.read();
        let mut out: Vec<NodeSnapshot> = nodes
            .iter()
            .filter_map(|(node_id, state)| {
                let thread_statuses: HashMap<String, ThreadStatus> = state
                    .thread_statuses
                    .iter()
                    .filter(|(t, _)| scope.thread_id.as_deref().map_or(true, |want| want == t.as_str()))
                    .map(|(t, s)| (t.clone(), *s))
                    .collect();
                let run_statuses: HashMap<String, NodeStatus> = state
                    .run_statuses
                    .iter()
                    .filter(|(r, _)| scope.run_id.as_deref().map_or(true, |want| want == r.as_str()))
                    .map(|(r, s)| (r.clone(), *s))
                    .collect();
                let active_execs: HashMap<String, ActiveExec> = state
                    .active_execs
                    .iter()
                    .filter(|(_, e)| {
                        scope.thread_id.as_deref().map_or(true, |want| {
                            e.thread_id.as_deref() == Some(want)
                        }) && scope.run_id.as_deref().map_or(true, |want| {
                            e.run_id.as_deref() == Some(want)
                        })
                    })
                    .map(|(id, e)| (id.clone(), e.clone()))
                    .collect();

                if !scope.is_empty()
                    && thread_statuses.is_empty()
                    && run_statuses.is_empty()
                    && active_execs.is_empty()
                {
                    return None;
                }

                Some(NodeSnapshot {
                    node_id: node_id.clone(),
                    status: state.base,
                    thread_statuses,
                    run_statuses,
                    active_execs,
                    error: state.error.clone(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        out
    }

    /// Fold one runtime event; returns the notifications to publish
    pub fn apply_runtime_event(&self, node_id: &str, event: RuntimeEvent) -> Vec<Notification> {
        let mut nodes = self.nodes.write();
        let Some(state) = nodes.get_mut(node_id) else { return Vec::new() };
        let mut out = Vec::new();

        match event {
            RuntimeEvent::Start => {
                state.base = NodeStatus::Idle;
                state.error = None;
                out.push(self.node_update(node_id, state));
            }
            RuntimeEvent::Stop => {
                state.base = NodeStatus::Stopped;
                state.thread_statuses.clear();
                state.run_statuses.clear();
                state.active_execs.clear();
                out.push(self.node_update(node_id, state));
            }
            RuntimeEvent::ExecStart { exec_id, thread_id, run_id } => {
                if let Some(t) = &thread_id {
                    state.thread_statuses.insert(t.clone(), ThreadStatus::Running);
                }
                if let Some(r) = &run_id {
                    state.run_statuses.insert(r.clone(), NodeStatus::Running);
                }
                state.active_execs.insert(
                    exec_id,
                    ActiveExec { thread_id, run_id, started_at: Utc::now() },
                );
                if state.base != NodeStatus::Running {
                    state.base = NodeStatus::Running;
                    out.push(self.node_update(node_id, state));
                }
            }
            RuntimeEvent::ExecEnd { exec_id, error } => {
                if let Some(exec) = state.active_execs.remove(&exec_id) {
                    if let Some(t) = exec.thread_id {
                        state.thread_statuses.remove(&t);
                    }
                    if let Some(r) = exec.run_id {
                        state.run_statuses.remove(&r);
                    }
                }
                if let Some(err) = error {
                    state.base = NodeStatus::Error;
                    state.error = Some(err);
                    out.push(self.node_update(node_id, state));
                } else if state.active_execs.is_empty() && state.base == NodeStatus::Running {
                    state.base = NodeStatus::Idle;
                    out.push(self.node_update(node_id, state));
                }
            }
        }
        out
    }

    /// Fold one agent event; returns the notifications to publish
    pub fn apply_agent_event(&self, node_id: &str, event: AgentEvent) -> Vec<Notification> {
        let mut nodes = self.nodes.write();
        let Some(state) = nodes.get_mut(node_id) else { return Vec::new() };
        let mut out = Vec::new();

        match event {
            AgentEvent::Invoke { thread_id, run_id } => {
                state.base = NodeStatus::Running;
                state.thread_statuses.insert(thread_id.clone(), ThreadStatus::Running);
                state.run_statuses.insert(run_id.clone(), NodeStatus::Running);
                // Invoke always pings, not only on base transitions.
                out.push(self.node_update(node_id, state));
                out.push(Notification::AgentInvoke {
                    graph_id: self.graph_id,
                    node_id: node_id.to_string(),
                    thread_id,
                    run_id,
                });
            }
            AgentEvent::Message { thread_id, run_id, message } => {
                out.push(Notification::AgentMessage {
                    graph_id: self.graph_id,
                    node_id: node_id.to_string(),
                    thread_id,
                    run_id,
                    message,
                });
            }
            AgentEvent::StateUpdate { thread_id, run_id, usage } => {
                out.push(Notification::AgentStateUpdate {
                    graph_id: self.graph_id,
                    node_id: node_id.to_string(),
                    thread_id,
                    run_id,
                    usage,
                });
            }
            AgentEvent::Run { thread_id, run_id, error, stopped, needs_more_info } => {
                let had_thread = state.thread_statuses.remove(&thread_id).is_some();
                state.run_statuses.remove(&run_id);
                if let Some(err) = &error {
                    if !stopped {
                        state.error = Some(err.clone());
                    }
                }
                if had_thread {
                    let status = if stopped {
                        ThreadStatus::Stopped
                    } else if needs_more_info {
                        ThreadStatus::NeedMoreInfo
                    } else {
                        ThreadStatus::Done
                    };
                    out.push(Notification::ThreadUpdate {
                        graph_id: self.graph_id,
                        node_id: node_id.to_string(),
                        thread_id,
                        status,
                    });
                }
                if state.thread_statuses.is_empty()
                    && state.run_statuses.is_empty()
                    && state.base == NodeStatus::Running
                {
                    state.base = NodeStatus::Idle;
                    out.push(self.node_update(node_id, state));
                }
            }
            AgentEvent::Stop { thread_id, reason } => {
                debug!(graph_id = %self.graph_id, node_id, reason = %reason, "agent stop observed");
                let targets: Vec<String> = state
                    .thread_statuses
                    .keys()
                    .filter(|t| thread_id.as_deref().map_or(true, |want| want == t.as_str()))
                    .cloned()
                    .collect();
                for t in targets {
                    state.thread_statuses.remove(&t);
                    out.push(Notification::ThreadUpdate {
                        graph_id: self.graph_id,
                        node_id: node_id.to_string(),
                        thread_id: t,
                        status: ThreadStatus::Stopped,
                    });
                }
                if thread_id.is_none() {
                    state.run_statuses.clear();
                }
                if state.thread_statuses.is_empty()
                    && state.run_statuses.is_empty()
                    && state.base == NodeStatus::Running
                {
                    state.base = NodeStatus::Idle;
                    out.push(self.node_update(node_id, state));
                }
            }
        }
        out
    }

    /// Fold one trigger event; returns the notifications to publish
    pub fn apply_trigger_event(&self, node_id: &str, event: TriggerEvent) -> Vec<Notification> {
        let mut nodes = self.nodes.write();
        let Some(state) = nodes.get_mut(node_id) else { return Vec::new() };
        let mut out = Vec::new();

        match event {
            TriggerEvent::Start => {
                state.base = NodeStatus::Idle;
                state.error = None;
                out.push(self.node_update(node_id, state));
            }
            TriggerEvent::Stop => {
                state.base = NodeStatus::Stopped;
                state.thread_statuses.clear();
                state.run_statuses.clear();
                out.push(self.node_update(node_id, state));
            }
            TriggerEvent::Invoke { thread_id: _ } => {
                // Invocation is instantaneous for triggers; ping with the
                // current base so consumers see the node alive.
                out.push(self.node_update(node_id, state));
            }
        }
        out
    }

    fn node_update(&self, node_id: &str, state: &NodeState) -> Notification {
        Notification::GraphNodeUpdate {
            graph_id: self.graph_id,
            node_id: node_id.to_string(),
            status: state.base,
            error: state.error.clone(),
        }
    }
}

/// Spawns and owns the fold tasks for one graph's nodes.
pub struct GraphStateManager {
    state: Arc<GraphState>,
    hub: NotificationHub,
    token: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl GraphStateManager {
    /// Create a manager publishing into `hub`
    pub fn new(state: Arc<GraphState>, hub: NotificationHub) -> Self {
        Self {
            state,
            hub,
            token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Observe a runtime node's event stream
    pub fn observe_runtime(&self, node_id: String, rx: broadcast::Receiver<RuntimeEvent>) {
        let state = self.state.clone();
        self.spawn_fold(rx, move |ev| state.apply_runtime_event(&node_id, ev));
    }

    /// Observe an agent node's event stream
    pub fn observe_agent(&self, node_id: String, rx: broadcast::Receiver<AgentEvent>) {
        let state = self.state.clone();
        self.spawn_fold(rx, move |ev| state.apply_agent_event(&node_id, ev));
    }

    /// Observe a trigger node's event stream
    pub fn observe_trigger(&self, node_id: String, rx: broadcast::Receiver<TriggerEvent>) {
        let state = self.state.clone();
        self.spawn_fold(rx, move |ev| state.apply_trigger_event(&node_id, ev));
    }

    fn spawn_fold<E, F>(&self, mut rx: broadcast::Receiver<E>, fold: F)
    where
        E: Clone + Send + 'static,
        F: Fn(E) -> Vec<Notification> + Send + 'static,
    {
        let hub = self.hub.clone();
        let token = self.token.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Ok(ev) => {
                            for n in fold(ev) {
                                hub.emit(n);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "state observer lagged, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = token.cancelled() => {
                        // Drain whatever is already queued so teardown events
                        // (stop markers, ThreadUpdate) are published before
                        // destroy returns.
                        while let Ok(ev) = rx.try_recv() {
                            for n in fold(ev) {
                                hub.emit(n);
                            }
                        }
                        break;
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

    /// Stop every fold task after draining queued events
    pub async fn shutdown(self) {
        self.token.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }
}
