//! # agentry-checkpoint
//!
//! Checkpoint persistence contracts for agentry agents.
//!
//! Agents snapshot their per-thread state (message history, rolling summary,
//! accumulated token counters) after every completed turn. Snapshots are
//! keyed by `(thread_id, checkpoint_ns)` where the namespace is
//! `"{graph_id}:{sub_id}:{agent_node_id}"`, so multiple agents can share a
//! thread without clobbering each other, and a run can resume after a process
//! restart from the latest snapshot.
//!
//! The [`CheckpointStore`] trait abstracts the backend; the crate ships
//! [`InMemoryCheckpointStore`] as the reference implementation.

pub mod checkpoint;
pub mod error;
pub mod memory;
pub mod store;

pub use checkpoint::{Checkpoint, CheckpointKey, CheckpointTuple};
pub use error::{CheckpointError, Result};
pub use memory::InMemoryCheckpointStore;
pub use store::CheckpointStore;
