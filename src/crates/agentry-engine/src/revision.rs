//! The revision engine: serialized concurrent edits on a graph.
//!
//! Schema edits on a live graph are queued as [`Revision`]s and applied by a
//! background worker. Enqueueing detects merge conflicts (the edit's base
//! version must equal the graph's `target_version`), bumps `target_version`
//! to the generated `to_version`, and wakes the worker. The worker claims
//! the single pending revision per graph under the per-graph advisory lock;
//! for a running graph it orchestrates destroy → swap schema → compile →
//! run, and `to_version` becomes `version` only after that succeeds. On
//! failure the revision is marked Failed, `target_version` rewinds to
//! `version`, and the previous live state is restored best-effort — a failed
//! revision never transitions the graph to Error by itself.

use crate::context::EngineCtx;
use crate::model::{config_diff, Graph, GraphPatch, Revision, RevisionStatus};
use agentry_graph::{EngineError, GraphConfig, GraphStatus, GraphVersion, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Queues revisions and runs the background apply worker
pub struct RevisionEngine {
    ctx: Arc<EngineCtx>,
    jobs: mpsc::UnboundedSender<Uuid>,
    token: CancellationToken,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RevisionEngine {
    /// Create the engine and start its worker task
    pub fn start(ctx: Arc<EngineCtx>) -> Arc<Self> {
        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let engine = Arc::new(Self {
            ctx,
            jobs,
            token: token.clone(),
            worker: parking_lot::Mutex::new(None),
        });
        let handle = tokio::spawn(worker_loop(engine.clone(), jobs_rx, token));
        *engine.worker.lock() = Some(handle);
        engine
    }

    /// Queue a schema edit against `graph`.
    ///
    /// Fails `MERGE_CONFLICT` when `base_version` is not the graph's head
    /// (`target_version`) or another revision is still open. The new schema
    /// is validated before anything is persisted, so template errors surface
    /// here and never at apply time.
    pub async fn queue_revision(
        &self,
        created_by: &str,
        graph: &Graph,
        base_version: GraphVersion,
        new_config: GraphConfig,
        enqueue_immediately: bool,
    ) -> Result<Revision> {
        let lock = self.ctx.graph_lock(graph.id);
        let _guard = lock.lock().await;

        // Re-read under the lock: a concurrent queue may have bumped the
        // head since the caller loaded the graph.
        let current = self
            .ctx
            .graphs
            .get_one(graph.id, None)
            .await?
            .ok_or(EngineError::GraphNotFound(graph.id))?;

        if base_version != current.target_version {
            return Err(EngineError::MergeConflict {
                base: base_version.to_string(),
                target: current.target_version.to_string(),
            });
        }
        if self.ctx.revisions.has_open_revision(graph.id).await? {
            return Err(EngineError::MergeConflict {
                base: base_version.to_string(),
                target: current.target_version.to_string(),
            });
        }

        self.ctx.compiler.validate_schema(&new_config.schema)?;

        let to_version = current.target_version.next_patch();
        let now = Utc::now();
        let revision = Revision {
            id: Uuid::new_v4(),
            graph_id: graph.id,
            base_version,
            to_version,
            status: RevisionStatus::Pending,
            config_diff: config_diff(&current.config(), &new_config),
            new_config,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
        };
        let revision = self.ctx.revisions.insert(revision).await?;
        self.ctx
            .graphs
            .update_by_id(
                graph.id,
                GraphPatch { target_version: Some(to_version), ..Default::default() },
            )
            .await?;

        info!(graph_id = %graph.id, to_version = %to_version, "revision queued");
        if enqueue_immediately {
            let _ = self.jobs.send(graph.id);
        }
        Ok(revision)
    }

    /// Stop the worker, letting an in-flight apply finish
    pub async fn shutdown(&self) {
        self.token.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Apply the graph's pending revision, if any (worker entry point)
    async fn apply_pending(&self, graph_id: Uuid) {
        let lock = self.ctx.graph_lock(graph_id);
        let _guard = lock.lock().await;

        let revision = match self.ctx.revisions.claim_pending(graph_id).await {
            Ok(Some(revision)) => revision,
            Ok(None) => return,
            Err(e) => {
                error!(graph_id = %graph_id, error = %e, "revision claim failed");
                return;
            }
        };

        info!(graph_id = %graph_id, revision = %revision.id, to_version = %revision.to_version, "applying revision");
        match self.apply(&revision).await {
            Ok(()) => {
                let _ = self
                    .ctx
                    .revisions
                    .update_status(revision.id, RevisionStatus::Applied)
                    .await;
            }
            Err(e) => {
                warn!(graph_id = %graph_id, revision = %revision.id, error = %e, "revision apply failed");
                let _ = self
                    .ctx
                    .revisions
                    .update_status(revision.id, RevisionStatus::Failed)
                    .await;
                // Rewind the head; the applied version is unchanged.
                if let Ok(Some(graph)) = self.ctx.graphs.get_one(graph_id, None).await {
                    let _ = self
                        .ctx
                        .graphs
                        .update_by_id(
                            graph_id,
                            GraphPatch {
                                target_version: Some(graph.version),
                                ..Default::default()
                            },
                        )
                        .await;
                }
            }
        }
    }

    async fn apply(&self, revision: &Revision) -> Result<()> {
        let ctx = &self.ctx;
        let graph = ctx
            .graphs
            .get_one(revision.graph_id, None)
            .await?
            .ok_or(EngineError::GraphNotFound(revision.graph_id))?;

        let was_running = graph.status == GraphStatus::Running && !ctx.registry.is_stop(graph.id);

        if !was_running {
            // Cold apply: swap the config and bump the version directly.
            ctx.graphs
                .update_by_id(
                    graph.id,
                    GraphPatch {
                        name: Some(revision.new_config.name.clone()),
                        description: Some(revision.new_config.description.clone()),
                        schema: Some(revision.new_config.schema.clone()),
                        version: Some(revision.to_version),
                        target_version: Some(revision.to_version),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        }

        // Live apply: restart under the new schema.
        ctx.stop_graph(graph.id).await?;
        ctx.emit_graph(graph.id, GraphStatus::Compiling, None);
        ctx.graphs
            .update_by_id(graph.id, GraphPatch::status(GraphStatus::Compiling))
            .await?;

        let mut candidate = graph.clone();
        candidate.name = revision.new_config.name.clone();
        candidate.description = revision.new_config.description.clone();
        candidate.schema = revision.new_config.schema.clone();
        candidate.version = revision.to_version;

        match ctx.start_graph(&candidate).await {
            Ok(_) => {
                // The new version is applied only now that compile-and-run
                // succeeded.
                ctx.graphs
                    .update_by_id(
                        graph.id,
                        GraphPatch {
                            name: Some(candidate.name),
                            description: Some(candidate.description),
                            schema: Some(candidate.schema),
                            version: Some(revision.to_version),
                            target_version: Some(revision.to_version),
                            status: Some(GraphStatus::Running),
                            error: Some(None),
                        },
                    )
                    .await?;
                ctx.emit_graph(graph.id, GraphStatus::Running, None);
                Ok(())
            }
            Err(apply_error) => {
                // Restore the previous live state best-effort; the graph is
                // not marked Error because of a failed revision alone.
                debug!(graph_id = %graph.id, "restoring previous schema after failed revision");
                match ctx.start_graph(&graph).await {
                    Ok(_) => {
                        ctx.graphs
                            .update_by_id(graph.id, GraphPatch::status(GraphStatus::Running))
                            .await?;
                        ctx.emit_graph(graph.id, GraphStatus::Running, None);
                    }
                    Err(restore_error) => {
                        error!(graph_id = %graph.id, error = %restore_error, "previous schema restore failed");
                        ctx.graphs
                            .update_by_id(
                                graph.id,
                                GraphPatch::status_with_error(
                                    GraphStatus::Error,
                                    Some(restore_error.to_string()),
                                ),
                            )
                            .await?;
                        ctx.emit_graph(
                            graph.id,
                            GraphStatus::Error,
                            Some(restore_error.to_string()),
                        );
                    }
                }
                Err(apply_error)
            }
        }
    }
}

async fn worker_loop(
    engine: Arc<RevisionEngine>,
    mut jobs: mpsc::UnboundedReceiver<Uuid>,
    token: CancellationToken,
) {
    let mut tick = tokio::time::interval(WORKER_POLL_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            job = jobs.recv() => match job {
                Some(graph_id) => engine.apply_pending(graph_id).await,
                None => break,
            },
            _ = tick.tick() => {
                // Poll for revisions queued without an immediate wake-up
                // (or left over from a previous process).
                match engine.ctx.revisions.pending_graphs().await {
                    Ok(graph_ids) => {
                        for graph_id in graph_ids {
                            engine.apply_pending(graph_id).await;
                        }
                    }
                    Err(e) => error!(error = %e, "pending revision poll failed"),
                }
            }
        }
    }
    debug!("revision worker stopped");
}
