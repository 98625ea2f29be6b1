//! The engine facade.
//!
//! [`GraphService`] coordinates the stores, compiler, registry, state
//! manager and revision engine behind the operations a transport exposes.
//! All input validation failures surface as 400-class [`EngineError`]s at
//! create/update time; engine-internal failures during `run` are captured
//! into the graph's `error` field and re-thrown.

use crate::context::EngineCtx;
use crate::model::{
    CreateGraphInput, Graph, GraphPatch, RequestCtx, Revision, Thread, UpdateGraphInput,
};
use crate::revision::RevisionEngine;
use agentry_graph::{
    AgentRunOutput, EngineError, GraphStatus, Message, NodeKind, NodeSnapshot, Result,
    RunnableConfig, StateScope, ThreadStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Input for [`GraphService::execute_trigger`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteTriggerInput {
    /// Messages handed to the downstream agent
    pub messages: Vec<Message>,
    /// Thread sub-id; a fresh UUID when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_sub_id: Option<String>,
    /// Detach the run instead of awaiting it
    #[serde(default, rename = "async")]
    pub async_run: bool,
}

/// Output of [`GraphService::execute_trigger`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteTriggerOutput {
    /// External thread id the invocation ran on
    pub external_thread_id: String,
    /// Checkpoint namespace of the downstream agent
    pub checkpoint_ns: String,
    /// Full run output for synchronous calls; `None` for detached calls and
    /// when the messages were appended to an active run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<AgentRunOutput>,
}

/// Result of [`GraphService::update`]
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    /// The graph after the update
    pub graph: Graph,
    /// The queued revision, when the update changed the schema
    pub revision: Option<Revision>,
}

/// The engine facade
pub struct GraphService {
    ctx: Arc<EngineCtx>,
    revisions: Arc<RevisionEngine>,
}

impl GraphService {
    /// Create the facade over shared engine internals
    pub fn new(ctx: Arc<EngineCtx>, revisions: Arc<RevisionEngine>) -> Self {
        Self { ctx, revisions }
    }

    /// Validate and persist a new graph at version 1.0.0, status Created
    pub async fn create(&self, ctx: &RequestCtx, input: CreateGraphInput) -> Result<Graph> {
        self.ctx.compiler.validate_schema(&input.schema)?;
        let graph = Graph::new(ctx, input);
        info!(graph_id = %graph.id, name = %graph.name, "graph created");
        self.ctx.graphs.create(graph).await
    }

    /// Fetch a graph visible to the caller
    pub async fn find_by_id(&self, ctx: &RequestCtx, id: Uuid) -> Result<Graph> {
        self.ctx
            .graphs
            .get_one(id, Some(&ctx.user_id))
            .await?
            .ok_or(EngineError::GraphNotFound(id))
    }

    /// All graphs visible to the caller
    pub async fn get_all(&self, ctx: &RequestCtx) -> Result<Vec<Graph>> {
        self.ctx.graphs.get_all(Some(&ctx.user_id)).await
    }

    /// Update a graph.
    ///
    /// Name/description-only changes apply synchronously without a version
    /// bump. A schema change queues a [`Revision`] applied by the background
    /// worker; its `to_version` becomes the graph's `target_version`.
    pub async fn update(
        &self,
        ctx: &RequestCtx,
        id: Uuid,
        input: UpdateGraphInput,
    ) -> Result<UpdateOutcome> {
        let graph = self.find_by_id(ctx, id).await?;

        let changed_schema = input.schema.clone().filter(|s| *s != graph.schema);
        if let Some(schema) = changed_schema {
            let new_config = agentry_graph::GraphConfig {
                name: input.name.unwrap_or_else(|| graph.name.clone()),
                description: input.description.clone().or_else(|| graph.description.clone()),
                schema,
            };
            let revision = self
                .revisions
                .queue_revision(&ctx.user_id, &graph, input.current_version, new_config, true)
                .await?;
            let graph = self.find_by_id(ctx, id).await?;
            return Ok(UpdateOutcome { graph, revision: Some(revision) });
        }

        if input.current_version != graph.version {
            return Err(EngineError::VersionConflict {
                expected: input.current_version.to_string(),
                actual: graph.version.to_string(),
            });
        }
        let patch = GraphPatch {
            name: input.name,
            description: input.description.map(Some),
            ..Default::default()
        };
        let graph = self.ctx.graphs.update_by_id(id, patch).await?;
        Ok(UpdateOutcome { graph, revision: None })
    }

    /// Delete a graph: destroy the live instance if any, cascade soft-delete
    /// threads, messages and checkpoints, then soft-delete the graph.
    pub async fn delete(&self, ctx: &RequestCtx, id: Uuid) -> Result<()> {
        let graph = self.find_by_id(ctx, id).await?;

        if !self.ctx.registry.is_stop(id) {
            self.destroy(ctx, id).await?;
        }

        for thread in self.ctx.threads.get_all(id, None).await? {
            if let Err(e) = self.ctx.checkpoints.delete_thread(&thread.external_id).await {
                warn!(thread = %thread.external_id, error = %e, "checkpoint cleanup failed");
            }
        }
        self.ctx.threads.delete_for_graph(id).await?;
        self.ctx.graphs.delete_by_id(id).await?;
        info!(graph_id = %id, name = %graph.name, "graph deleted");
        Ok(())
    }

    /// Compile, register and start a graph.
    ///
    /// Transitions Created/Stopped/Error → Compiling → Running with a
    /// notification per transition. On failure every partial artifact is
    /// destroyed, running threads are stopped, and the graph lands in Error
    /// with the cause recorded.
    pub async fn run(&self, ctx: &RequestCtx, id: Uuid) -> Result<Graph> {
        self.find_by_id(ctx, id).await?;

        let lock = self.ctx.graph_lock(id);
        let _guard = lock.lock().await;

        if !self.ctx.registry.is_stop(id) {
            return Err(EngineError::GraphAlreadyRunning(id));
        }

        let graph = self
            .ctx
            .graphs
            .update_by_id(id, GraphPatch::status(GraphStatus::Compiling))
            .await?;
        self.ctx.emit_graph(id, GraphStatus::Compiling, None);

        match self.ctx.start_graph(&graph).await {
            Ok(_) => {
                let updated = self
                    .ctx
                    .graphs
                    .update_by_id(
                        id,
                        GraphPatch::status_with_error(GraphStatus::Running, None),
                    )
                    .await?;
                self.ctx.emit_graph(id, GraphStatus::Running, None);
                info!(graph_id = %id, version = %updated.version, "graph running");
                Ok(updated)
            }
            Err(e) => {
                // start_graph already unwound the partial registry entry.
                for thread in self
                    .ctx
                    .threads
                    .get_all(id, Some(ThreadStatus::Running))
                    .await
                    .unwrap_or_default()
                {
                    let _ = self
                        .ctx
                        .threads
                        .update_status(&thread.external_id, ThreadStatus::Stopped)
                        .await;
                }
                let _ = self
                    .ctx
                    .graphs
                    .update_by_id(
                        id,
                        GraphPatch::status_with_error(GraphStatus::Error, Some(e.to_string())),
                    )
                    .await;
                self.ctx.emit_graph(id, GraphStatus::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Tear a graph down: cancel every dependent task, stop threads, and
    /// transition → Stopped with the error cleared. Safe when no live
    /// instance exists.
    pub async fn destroy(&self, ctx: &RequestCtx, id: Uuid) -> Result<Graph> {
        self.find_by_id(ctx, id).await?;

        let lock = self.ctx.graph_lock(id);
        let _guard = lock.lock().await;

        self.ctx.stop_graph(id).await?;

        // Sinks have drained; any thread still marked running was never
        // picked up by an agent stop event.
        for thread in self
            .ctx
            .threads
            .get_all(id, Some(ThreadStatus::Running))
            .await?
        {
            self.ctx
                .threads
                .update_status(&thread.external_id, ThreadStatus::Stopped)
                .await?;
        }

        let updated = self
            .ctx
            .graphs
            .update_by_id(id, GraphPatch::status_with_error(GraphStatus::Stopped, None))
            .await?;
        self.ctx.emit_graph(id, GraphStatus::Stopped, None);
        info!(graph_id = %id, "graph destroyed");
        Ok(updated)
    }

    /// Invoke a trigger node on a running graph.
    pub async fn execute_trigger(
        &self,
        ctx: &RequestCtx,
        graph_id: Uuid,
        trigger_node_id: &str,
        input: ExecuteTriggerInput,
    ) -> Result<ExecuteTriggerOutput> {
        let graph = self.find_by_id(ctx, graph_id).await?;
        if graph.status != GraphStatus::Running {
            return Err(EngineError::GraphNotRunning(graph_id));
        }
        let compiled = self.ctx.registry.require(graph_id)?;

        let node = compiled
            .node(trigger_node_id)
            .ok_or_else(|| EngineError::NodeNotFound {
                graph_id,
                node_id: trigger_node_id.to_string(),
            })?;
        let trigger = node
            .instance
            .as_trigger()
            .ok_or_else(|| EngineError::NodeNotTrigger(trigger_node_id.to_string()))?;
        if !trigger.is_started() {
            return Err(EngineError::TriggerNotStarted(trigger_node_id.to_string()));
        }

        let sub_id = input
            .thread_sub_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let external_thread_id = format!("{}:{}", graph_id, sub_id);

        // The namespace is derived from the trigger's downstream agent.
        let agent_node_id = compiled
            .edges
            .iter()
            .find(|e| {
                e.from == trigger_node_id
                    && compiled
                        .node(&e.to)
                        .map(|n| n.kind == NodeKind::SimpleAgent)
                        .unwrap_or(false)
            })
            .map(|e| e.to.clone())
            .ok_or_else(|| EngineError::AgentNotFound(trigger_node_id.to_string()))?;
        let checkpoint_ns = format!("{}:{}", external_thread_id, agent_node_id);

        if self
            .ctx
            .threads
            .get_by_external_id(&external_thread_id)
            .await?
            .is_none()
        {
            self.ctx
                .threads
                .create(Thread::new(graph_id, &external_thread_id, &graph.created_by))
                .await?;
        }

        let rc = RunnableConfig::for_run(
            graph_id,
            trigger_node_id.to_string(),
            external_thread_id.clone(),
            checkpoint_ns.clone(),
        )
        .with_async(input.async_run);

        let output = trigger.invoke_agent(input.messages, rc).await?;
        Ok(ExecuteTriggerOutput { external_thread_id, checkpoint_ns, output })
    }

    /// Node snapshots of a running graph, optionally scoped to a thread or
    /// run
    pub async fn get_compiled_nodes(
        &self,
        ctx: &RequestCtx,
        id: Uuid,
        scope: StateScope,
    ) -> Result<Vec<NodeSnapshot>> {
        self.find_by_id(ctx, id).await?;
        let compiled = self.ctx.registry.require(id)?;
        Ok(compiled.state.snapshots(&scope))
    }

    /// Messages of a thread, paged, scoped to the caller's graphs
    pub async fn get_thread_messages(
        &self,
        ctx: &RequestCtx,
        external_thread_id: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Message>> {
        let thread = self
            .ctx
            .threads
            .get_by_external_id(external_thread_id)
            .await?
            .ok_or_else(|| EngineError::ThreadNotFound(external_thread_id.to_string()))?;
        // Visibility follows the owning graph.
        self.find_by_id(ctx, thread.graph_id).await?;
        self.ctx
            .threads
            .get_messages(external_thread_id, limit, offset)
            .await
    }
}
