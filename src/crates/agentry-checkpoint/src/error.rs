//! Error types for checkpoint storage backends.

use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors produced by checkpoint storage backends
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Snapshot could not be serialized or deserialized
    #[error("Checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backing store failed
    #[error("Checkpoint storage error: {0}")]
    Storage(String),

    /// No checkpoint exists for the requested key
    #[error("Checkpoint not found for thread '{thread_id}' ns '{checkpoint_ns}'")]
    NotFound {
        /// Thread the lookup was scoped to
        thread_id: String,
        /// Namespace the lookup was scoped to
        checkpoint_ns: String,
    },
}

impl CheckpointError {
    /// Create a storage error with context
    pub fn storage(msg: impl Into<String>) -> Self {
        CheckpointError::Storage(msg.into())
    }

    /// Check whether this is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, CheckpointError::NotFound { .. })
    }
}
