//! Checkpoint data model.
//!
//! A checkpoint is an opaque snapshot of an agent's per-thread state, written
//! after every completed turn so a run can resume across process restarts.
//! Snapshots are addressed by a [`CheckpointKey`]: the thread they belong to
//! plus a namespace of the form `"{graph_id}:{sub_id}:{agent_node_id}"` that
//! isolates agents sharing a thread.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Addressing tuple for checkpoint lookups.
///
/// `get_tuple` resolves the *latest* snapshot stored under a key; individual
/// snapshots are further distinguished by their `checkpoint_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    /// External thread identifier (`"{graph_id}:{sub_id}"`)
    pub thread_id: String,
    /// Namespace isolating one agent's state within the thread
    pub checkpoint_ns: String,
}

impl CheckpointKey {
    /// Create a new key
    pub fn new(thread_id: impl Into<String>, checkpoint_ns: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_ns: checkpoint_ns.into(),
        }
    }
}

/// One serialized state snapshot.
///
/// The `state` blob is opaque to the store; the agent layer serializes its
/// message history, rolling summary and accumulated token counters into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique snapshot identifier
    pub id: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Opaque serialized agent state
    pub state: Value,
}

impl Checkpoint {
    /// Create a snapshot with a fresh id and the current timestamp
    pub fn new(state: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            state,
        }
    }
}

/// A stored checkpoint together with its key and lineage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointTuple {
    /// Key the snapshot is stored under
    pub key: CheckpointKey,
    /// The snapshot itself
    pub checkpoint: Checkpoint,
    /// Id of the preceding snapshot in this namespace, if any
    pub parent_id: Option<String>,
}
