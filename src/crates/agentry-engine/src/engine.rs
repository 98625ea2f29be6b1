//! Engine assembly and lifecycle.
//!
//! [`Engine`] wires the stores, template registry, compiler, graph registry,
//! revision worker and service facade together. `init` runs the restart
//! cleanup (temporary graphs, stale statuses); `shutdown` drains the
//! revision worker and destroys every live graph.

use crate::context::EngineCtx;
use crate::model::GraphPatch;
use crate::revision::RevisionEngine;
use crate::service::GraphService;
use crate::store::memory::{InMemoryGraphStore, InMemoryRevisionStore, InMemoryThreadStore};
use crate::store::{GraphStore, RevisionStore, ThreadStore};
use crate::templates::register_builtin_templates;
use agentry_checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use agentry_graph::{
    GraphRegistry, GraphStatus, InvocationBackend, Notification, NotificationHub, Result,
    TemplateRegistry, ThreadStatus,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

/// Pluggable backends for an engine; defaults are in-memory
pub struct EngineOptions {
    /// The LLM invocation backend
    pub backend: Arc<dyn InvocationBackend>,
    /// Graph persistence
    pub graphs: Arc<dyn GraphStore>,
    /// Thread persistence
    pub threads: Arc<dyn ThreadStore>,
    /// Revision persistence
    pub revisions: Arc<dyn RevisionStore>,
    /// Checkpoint persistence
    pub checkpoints: Arc<dyn CheckpointStore>,
}

impl EngineOptions {
    /// In-memory stores around a backend
    pub fn in_memory(backend: Arc<dyn InvocationBackend>) -> Self {
        Self {
            backend,
            graphs: Arc::new(InMemoryGraphStore::new()),
            threads: Arc::new(InMemoryThreadStore::new()),
            revisions: Arc::new(InMemoryRevisionStore::new()),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
        }
    }
}

/// A fully wired agentry engine
pub struct Engine {
    ctx: Arc<EngineCtx>,
    templates: Arc<TemplateRegistry>,
    service: GraphService,
    revisions: Arc<RevisionEngine>,
}

impl Engine {
    /// Assemble an engine. Must be called within a tokio runtime (the
    /// revision worker is spawned here).
    pub fn new(options: EngineOptions) -> Self {
        let templates = Arc::new(TemplateRegistry::new());
        let registry = Arc::new(GraphRegistry::new());
        let hub = NotificationHub::default();

        register_builtin_templates(
            &templates,
            registry.clone(),
            options.backend.clone(),
            options.checkpoints.clone(),
        );

        let ctx = Arc::new(EngineCtx::new(
            templates.clone(),
            registry,
            options.graphs,
            options.threads,
            options.revisions,
            options.checkpoints,
            hub,
        ));
        let revisions = RevisionEngine::start(ctx.clone());
        let service = GraphService::new(ctx.clone(), revisions.clone());

        Self { ctx, templates, service, revisions }
    }

    /// The service facade
    pub fn service(&self) -> &GraphService {
        &self.service
    }

    /// The template registry (register integration templates here at
    /// startup)
    pub fn templates(&self) -> &Arc<TemplateRegistry> {
        &self.templates
    }

    /// Subscribe to the engine-wide notification stream
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.ctx.hub.subscribe()
    }

    /// The notification stream as a `Stream`, for transports that forward it
    pub fn notification_stream(&self) -> BroadcastStream<Notification> {
        BroadcastStream::new(self.ctx.hub.subscribe())
    }

    /// Shared engine internals (registry, stores); mostly for tests and
    /// embedders
    pub fn ctx(&self) -> &Arc<EngineCtx> {
        &self.ctx
    }

    /// Restart cleanup: remove temporary graphs, downgrade statuses left
    /// over from a previous process.
    pub async fn init(&self) -> Result<()> {
        for graph in self.ctx.graphs.get_all(None).await? {
            if graph.temporary {
                info!(graph_id = %graph.id, "removing temporary graph on startup");
                self.ctx.threads.delete_for_graph(graph.id).await?;
                self.ctx.graphs.delete_by_id(graph.id).await?;
                continue;
            }
            if matches!(graph.status, GraphStatus::Running | GraphStatus::Compiling) {
                warn!(graph_id = %graph.id, status = %graph.status, "downgrading stale status on startup");
                self.ctx
                    .graphs
                    .update_by_id(graph.id, GraphPatch::status(GraphStatus::Stopped))
                    .await?;
                for thread in self
                    .ctx
                    .threads
                    .get_all(graph.id, Some(ThreadStatus::Running))
                    .await?
                {
                    self.ctx
                        .threads
                        .update_status(&thread.external_id, ThreadStatus::Stopped)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Graceful termination: drain the revision worker, then destroy every
    /// live graph.
    pub async fn shutdown(&self) {
        self.revisions.shutdown().await;
        for graph_id in self.ctx.registry.graph_ids() {
            if let Err(e) = self.ctx.stop_graph(graph_id).await {
                warn!(graph_id = %graph_id, error = %e, "graph teardown during shutdown failed");
            }
            let _ = self
                .ctx
                .graphs
                .update_by_id(graph_id, GraphPatch::status(GraphStatus::Stopped))
                .await;
        }
        info!("engine shut down");
    }
}
