//! Shared engine internals.
//!
//! [`EngineCtx`] bundles the stores, compiler, registry and notification hub
//! so the service facade and the revision worker drive the same start/stop
//! machinery. It also owns the per-graph advisory locks and the thread
//! sinks that fold agent events into the thread store.

use crate::model::Graph;
use crate::store::{GraphStore, RevisionStore, ThreadStore};
use agentry_checkpoint::CheckpointStore;
use agentry_graph::{
    AgentEvent, CompiledGraph, EngineStatus, GraphCompiler, GraphMeta, GraphRegistry, GraphStatus,
    GraphStateManager, Message, NodeInstance, Notification, NotificationHub, Result,
    TemplateRegistry, ThreadStatus,
};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

struct SinkSet {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Everything the engine's moving parts share
pub struct EngineCtx {
    /// Template catalog used by the compiler and built-in templates
    pub templates: Arc<TemplateRegistry>,
    /// The schema compiler
    pub compiler: GraphCompiler,
    /// Live compiled graphs
    pub registry: Arc<GraphRegistry>,
    /// Graph persistence
    pub graphs: Arc<dyn GraphStore>,
    /// Thread persistence
    pub threads: Arc<dyn ThreadStore>,
    /// Revision persistence
    pub revisions: Arc<dyn RevisionStore>,
    /// Checkpoint persistence (shared with agent nodes)
    pub checkpoints: Arc<dyn CheckpointStore>,
    /// Engine-wide notification stream
    pub hub: NotificationHub,
    locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
    sinks: DashMap<Uuid, SinkSet>,
}

impl EngineCtx {
    /// Assemble a context
    pub fn new(
        templates: Arc<TemplateRegistry>,
        registry: Arc<GraphRegistry>,
        graphs: Arc<dyn GraphStore>,
        threads: Arc<dyn ThreadStore>,
        revisions: Arc<dyn RevisionStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        hub: NotificationHub,
    ) -> Self {
        Self {
            compiler: GraphCompiler::new(templates.clone()),
            templates,
            registry,
            graphs,
            threads,
            revisions,
            checkpoints,
            hub,
            locks: DashMap::new(),
            sinks: DashMap::new(),
        }
    }

    /// The advisory lock serializing status transitions and revision writes
    /// for one graph
    pub fn graph_lock(&self, graph_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(graph_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Publish an engine-level graph notification
    pub fn emit_graph(&self, graph_id: Uuid, status: GraphStatus, error: Option<String>) {
        self.hub.emit(Notification::Graph { graph_id, status, error });
    }

    /// Compile, register, observe and start a graph.
    ///
    /// On any failure the partial registry entry is destroyed and the sinks
    /// are stopped before the error propagates.
    pub async fn start_graph(&self, graph: &Graph) -> Result<Arc<CompiledGraph>> {
        let meta = GraphMeta { graph_id: graph.id, version: graph.version };
        let compiled = Arc::new(self.compiler.compile(&meta, &graph.schema).await?);
        if let Err(e) = self.registry.register(graph.id, compiled.clone()) {
            let _ = compiled.destroy().await;
            return Err(e);
        }

        let manager = GraphStateManager::new(compiled.state.clone(), self.hub.clone());
        for node in compiled.nodes() {
            match &node.instance {
                NodeInstance::Runtime(r) => manager.observe_runtime(node.id.clone(), r.subscribe()),
                NodeInstance::Agent(a) => manager.observe_agent(node.id.clone(), a.subscribe()),
                NodeInstance::Trigger(t) => manager.observe_trigger(node.id.clone(), t.subscribe()),
                _ => {}
            }
        }
        compiled.attach_manager(manager);
        self.spawn_thread_sinks(graph, &compiled);

        // Long-lived nodes start in construction order: runtimes come up
        // before the agents that exec into them, triggers last.
        let mut start_error = None;
        for node in compiled.nodes() {
            let result = match &node.instance {
                NodeInstance::Runtime(r) => r.start().await,
                NodeInstance::Trigger(t) => t.start().await,
                _ => Ok(()),
            };
            if let Err(e) = result {
                warn!(graph_id = %graph.id, node_id = %node.id, error = %e, "node start failed");
                start_error = Some(e);
                break;
            }
        }
        if let Some(e) = start_error {
            let _ = self.registry.destroy(graph.id).await;
            self.stop_sinks(graph.id).await;
            return Err(e);
        }

        self.registry.set_status(graph.id, EngineStatus::Running);
        debug!(graph_id = %graph.id, version = %graph.version, "graph started");
        Ok(compiled)
    }

    /// Destroy a graph's live instance and drain its sinks. Safe when the
    /// graph was never started.
    pub async fn stop_graph(&self, graph_id: Uuid) -> Result<bool> {
        let existed = self.registry.destroy(graph_id).await?;
        self.stop_sinks(graph_id).await;
        Ok(existed)
    }

    fn spawn_thread_sinks(&self, graph: &Graph, compiled: &Arc<CompiledGraph>) {
        let token = CancellationToken::new();
        let mut tasks = Vec::new();
        for (node_id, agent) in compiled.agents() {
            let rx = agent.subscribe();
            tasks.push(self.spawn_sink_task(graph, node_id, rx, token.clone()));
        }
        self.sinks.insert(graph.id, SinkSet { token, tasks });
    }

    fn spawn_sink_task(
        &self,
        graph: &Graph,
        node_id: String,
        mut rx: broadcast::Receiver<AgentEvent>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let threads = self.threads.clone();
        let graph_id = graph.id;
        let created_by = graph.created_by.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Ok(ev) => {
                            sink_event(&*threads, graph_id, &created_by, ev).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(node_id = %node_id, skipped, "thread sink lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = token.cancelled() => {
                        // Drain queued events so stop markers are persisted
                        // before destroy returns.
                        while let Ok(ev) = rx.try_recv() {
                            sink_event(&*threads, graph_id, &created_by, ev).await;
                        }
                        break;
                    }
                }
            }
        })
    }

    /// Cancel and await a graph's sinks, draining queued events
    pub async fn stop_sinks(&self, graph_id: Uuid) {
        if let Some((_, sink)) = self.sinks.remove(&graph_id) {
            sink.token.cancel();
            for task in sink.tasks {
                let _ = task.await;
            }
        }
    }
}

async fn ensure_thread(
    threads: &dyn ThreadStore,
    graph_id: Uuid,
    created_by: &str,
    external_id: &str,
) {
    match threads.get_by_external_id(external_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            let thread = crate::model::Thread::new(graph_id, external_id, created_by);
            if let Err(e) = threads.create(thread).await {
                warn!(thread = external_id, error = %e, "thread create failed");
            }
        }
        Err(e) => warn!(thread = external_id, error = %e, "thread lookup failed"),
    }
}

async fn persist_message(threads: &dyn ThreadStore, external_id: &str, message: Message) {
    if let Err(e) = threads.append_message(external_id, message).await {
        warn!(thread = external_id, error = %e, "message persist failed");
    }
}

/// Fold one agent event into the thread store
async fn sink_event(threads: &dyn ThreadStore, graph_id: Uuid, created_by: &str, ev: AgentEvent) {
    match ev {
        AgentEvent::Invoke { thread_id, .. } => {
            ensure_thread(threads, graph_id, created_by, &thread_id).await;
            let _ = threads.update_status(&thread_id, ThreadStatus::Running).await;
        }
        AgentEvent::Message { thread_id, message, .. } => {
            ensure_thread(threads, graph_id, created_by, &thread_id).await;
            persist_message(threads, &thread_id, message).await;
        }
        AgentEvent::Run { thread_id, stopped, needs_more_info, .. } => {
            let status = if stopped {
                ThreadStatus::Stopped
            } else if needs_more_info {
                ThreadStatus::NeedMoreInfo
            } else {
                ThreadStatus::Done
            };
            let _ = threads.update_status(&thread_id, status).await;
        }
        AgentEvent::Stop { thread_id, .. } => {
            if let Some(thread_id) = thread_id {
                let _ = threads.update_status(&thread_id, ThreadStatus::Stopped).await;
            } else if let Ok(all) = threads.get_all(graph_id, Some(ThreadStatus::Running)).await {
                for thread in all {
                    let _ = threads
                        .update_status(&thread.external_id, ThreadStatus::Stopped)
                        .await;
                }
            }
        }
        AgentEvent::StateUpdate { .. } => {}
    }
}
