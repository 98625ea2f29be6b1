//! Storage contracts for persisted engine records.
//!
//! The engine is storage-agnostic: these traits are the full persistence
//! surface, and the workspace ships in-memory reference implementations in
//! [`memory`]. Relational backends live outside the engine.

pub mod memory;

use crate::model::{Graph, GraphPatch, Revision, RevisionStatus, Thread};
use agentry_graph::{Message, Result, ThreadStatus};
use async_trait::async_trait;
use uuid::Uuid;

/// Persistence contract for graph records
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Persist a new graph
    async fn create(&self, graph: Graph) -> Result<Graph>;

    /// Fetch a graph by id, optionally scoped to a principal. Soft-deleted
    /// graphs are invisible.
    async fn get_one(&self, id: Uuid, created_by: Option<&str>) -> Result<Option<Graph>>;

    /// All visible graphs, optionally scoped to a principal
    async fn get_all(&self, created_by: Option<&str>) -> Result<Vec<Graph>>;

    /// Apply a partial update; fails `GRAPH_NOT_FOUND` when missing
    async fn update_by_id(&self, id: Uuid, patch: GraphPatch) -> Result<Graph>;

    /// Soft-delete a graph; idempotent
    async fn delete_by_id(&self, id: Uuid) -> Result<()>;
}

/// Persistence contract for threads and their messages
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Persist a new thread
    async fn create(&self, thread: Thread) -> Result<Thread>;

    /// Fetch a thread by external id
    async fn get_by_external_id(&self, external_id: &str) -> Result<Option<Thread>>;

    /// Threads of a graph, optionally filtered by status
    async fn get_all(&self, graph_id: Uuid, status: Option<ThreadStatus>) -> Result<Vec<Thread>>;

    /// Update a thread's status; no-op when the thread is missing
    async fn update_status(&self, external_id: &str, status: ThreadStatus) -> Result<()>;

    /// Append a message to a thread, deduplicated by message id
    async fn append_message(&self, external_id: &str, message: Message) -> Result<()>;

    /// Messages of a thread in append order, with paging
    async fn get_messages(
        &self,
        external_id: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Message>>;

    /// Soft-delete every thread (and its messages) of a graph
    async fn delete_for_graph(&self, graph_id: Uuid) -> Result<()>;
}

/// Persistence contract for queued revisions
#[async_trait]
pub trait RevisionStore: Send + Sync {
    /// Persist a new revision
    async fn insert(&self, revision: Revision) -> Result<Revision>;

    /// Fetch a revision by id
    async fn get(&self, id: Uuid) -> Result<Option<Revision>>;

    /// Whether the graph has a revision in Pending or Applying
    async fn has_open_revision(&self, graph_id: Uuid) -> Result<bool>;

    /// Atomically claim the graph's single pending revision, transitioning
    /// it to Applying
    async fn claim_pending(&self, graph_id: Uuid) -> Result<Option<Revision>>;

    /// Update a revision's status
    async fn update_status(&self, id: Uuid, status: RevisionStatus) -> Result<()>;

    /// Graphs that currently have a pending revision (worker polling)
    async fn pending_graphs(&self) -> Result<Vec<Uuid>>;
}
