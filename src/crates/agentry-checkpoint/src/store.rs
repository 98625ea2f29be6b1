//! The [`CheckpointStore`] trait — the storage contract for agent snapshots.
//!
//! Implementations persist snapshots in any backend (the workspace ships an
//! in-memory reference store; relational backends live outside the engine).
//! All implementations must be `Send + Sync` and safe under concurrent access:
//! distinct `(thread_id, checkpoint_ns)` keys are independent, and writes to
//! the same key are serialized by the caller (at most one active run per
//! thread).

use crate::checkpoint::{Checkpoint, CheckpointKey, CheckpointTuple};
use crate::error::Result;
use async_trait::async_trait;

/// Storage backend contract for checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Fetch the latest snapshot stored under `key`, or `None` if the
    /// namespace has never been written.
    async fn get_tuple(&self, key: &CheckpointKey) -> Result<Option<CheckpointTuple>>;

    /// Append a snapshot under `key`. The stored tuple's `parent_id` is the
    /// id of the previous latest snapshot for the same key.
    async fn put(&self, key: &CheckpointKey, checkpoint: Checkpoint) -> Result<CheckpointTuple>;

    /// List every snapshot for a thread across namespaces, newest first.
    async fn list(&self, thread_id: &str) -> Result<Vec<CheckpointTuple>>;

    /// Delete all snapshots belonging to a thread. Missing threads are a
    /// no-op.
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;
}
