//! Engine-wide error taxonomy.
//!
//! Every failure that crosses a component boundary is an [`EngineError`].
//! Each variant carries a stable string id ([`EngineError::kind`]) and an
//! HTTP-style status ([`EngineError::status`]) so transports can map errors
//! without matching on variants. Template validation errors are surfaced at
//! create/update time, never at run time.

use agentry_checkpoint::CheckpointError;
use thiserror::Error;
use uuid::Uuid;

/// Convenience result type using [`EngineError`]
pub type Result<T> = std::result::Result<T, EngineError>;

/// All errors produced by the agentry engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// No graph with this id is visible to the caller
    #[error("Graph '{0}' not found")]
    GraphNotFound(Uuid),

    /// The graph exists but has no node with this id
    #[error("Node '{node_id}' not found in graph '{graph_id}'")]
    NodeNotFound {
        /// Graph the lookup was scoped to
        graph_id: Uuid,
        /// Missing node id
        node_id: String,
    },

    /// An agent instance was expected under this node id
    #[error("Agent '{0}' not found")]
    AgentNotFound(String),

    /// A trigger instance was expected under this node id
    #[error("Trigger '{0}' not found")]
    TriggerNotFound(String),

    /// No thread with this external id
    #[error("Thread '{0}' not found")]
    ThreadNotFound(String),

    /// A live compiled instance is already registered for this graph
    #[error("Graph '{0}' is already running")]
    GraphAlreadyRunning(Uuid),

    /// The operation requires a running graph
    #[error("Graph '{0}' is not running")]
    GraphNotRunning(Uuid),

    /// Two nodes in the schema share an id
    #[error("Duplicate node id '{0}' in graph schema")]
    DuplicateNode(String),

    /// An edge references a node id that does not exist in the schema
    #[error("Edge '{from}' -> '{to}' references a missing node")]
    EdgeNotFound {
        /// Edge source node id
        from: String,
        /// Edge target node id
        to: String,
    },

    /// The schema names a template that was never registered
    #[error("Template '{0}' is not registered")]
    TemplateNotRegistered(String),

    /// A node config failed its template's schema validation
    #[error("Invalid config for node '{node_id}': {reason}")]
    InvalidTemplateConfig {
        /// Node whose config failed validation
        node_id: String,
        /// Aggregated validation messages
        reason: String,
    },

    /// An edge connects templates with incompatible kinds
    #[error("Kind mismatch on edge '{from}' -> '{to}': {reason}")]
    KindMismatch {
        /// Edge source node id
        from: String,
        /// Edge target node id
        to: String,
        /// What constraint was violated
        reason: String,
    },

    /// The request was computed against a stale graph version
    #[error("Version conflict: expected '{expected}', current is '{actual}'")]
    VersionConflict {
        /// Version the caller supplied
        expected: String,
        /// Version currently persisted
        actual: String,
    },

    /// A queued revision would fork the version history
    #[error("Merge conflict: base version '{base}' does not match head '{target}'")]
    MergeConflict {
        /// Base version the edit was computed against
        base: String,
        /// Current head (target) version of the graph
        target: String,
    },

    /// A version string did not parse as MAJOR.MINOR.PATCH
    #[error("Invalid version '{0}'")]
    InvalidVersion(String),

    /// The addressed node exists but is not a trigger
    #[error("Node '{0}' is not a trigger")]
    NodeNotTrigger(String),

    /// The trigger exists but has not been started
    #[error("Trigger '{0}' is not started")]
    TriggerNotStarted(String),

    /// The thread already has an active run
    #[error("Thread '{0}' is busy")]
    ThreadBusy(String),

    /// An agent run exceeded its iteration bound
    #[error("Agent run exceeded the maximum of {limit} iterations")]
    MaxIterations {
        /// Configured iteration bound
        limit: u32,
    },

    /// A run was cancelled cooperatively
    #[error("Run stopped: {reason}")]
    Stopped {
        /// Human-readable stop reason
        reason: String,
    },

    /// The invocation backend failed
    #[error("Invocation backend error: {0}")]
    Backend(String),

    /// Checkpoint persistence failed
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// JSON (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invariant violation inside the engine
    #[error("Internal engine error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable string id for this error, carried across process boundaries
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::GraphNotFound(_) => "GRAPH_NOT_FOUND",
            EngineError::NodeNotFound { .. } => "NODE_NOT_FOUND",
            EngineError::AgentNotFound(_) => "AGENT_NOT_FOUND",
            EngineError::TriggerNotFound(_) => "TRIGGER_NOT_FOUND",
            EngineError::ThreadNotFound(_) => "THREAD_NOT_FOUND",
            EngineError::GraphAlreadyRunning(_) => "GRAPH_ALREADY_RUNNING",
            EngineError::GraphNotRunning(_) => "GRAPH_NOT_RUNNING",
            EngineError::DuplicateNode(_) => "GRAPH_DUPLICATE_NODE",
            EngineError::EdgeNotFound { .. } => "GRAPH_EDGE_NOT_FOUND",
            EngineError::TemplateNotRegistered(_) => "TEMPLATE_NOT_REGISTERED",
            EngineError::InvalidTemplateConfig { .. } => "INVALID_TEMPLATE_CONFIG",
            EngineError::KindMismatch { .. } => "GRAPH_KIND_MISMATCH",
            EngineError::VersionConflict { .. } => "VERSION_CONFLICT",
            EngineError::MergeConflict { .. } => "MERGE_CONFLICT",
            EngineError::InvalidVersion(_) => "INVALID_VERSION",
            EngineError::NodeNotTrigger(_) => "NODE_NOT_TRIGGER",
            EngineError::TriggerNotStarted(_) => "TRIGGER_NOT_STARTED",
            EngineError::ThreadBusy(_) => "THREAD_BUSY",
            EngineError::MaxIterations { .. } => "MAX_ITERATIONS",
            EngineError::Stopped { .. } => "RUN_STOPPED",
            EngineError::Backend(_) => "BACKEND_ERROR",
            EngineError::Checkpoint(_) => "CHECKPOINT_ERROR",
            EngineError::Serialization(_) => "SERIALIZATION_ERROR",
            EngineError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP-style status code for transports
    pub fn status(&self) -> u16 {
        match self {
            EngineError::GraphNotFound(_)
            | EngineError::NodeNotFound { .. }
            | EngineError::AgentNotFound(_)
            | EngineError::TriggerNotFound(_)
            | EngineError::ThreadNotFound(_) => 404,
            EngineError::GraphAlreadyRunning(_)
            | EngineError::GraphNotRunning(_)
            | EngineError::DuplicateNode(_)
            | EngineError::EdgeNotFound { .. }
            | EngineError::TemplateNotRegistered(_)
            | EngineError::InvalidTemplateConfig { .. }
            | EngineError::KindMismatch { .. }
            | EngineError::VersionConflict { .. }
            | EngineError::MergeConflict { .. }
            | EngineError::InvalidVersion(_)
            | EngineError::NodeNotTrigger(_)
            | EngineError::TriggerNotStarted(_)
            | EngineError::ThreadBusy(_) => 400,
            _ => 500,
        }
    }

    /// Create a backend error with context
    pub fn backend(msg: impl Into<String>) -> Self {
        EngineError::Backend(msg.into())
    }

    /// Create an internal error with context
    pub fn internal(msg: impl Into<String>) -> Self {
        EngineError::Internal(msg.into())
    }

    /// True when this error represents cooperative cancellation, which is
    /// not an error for consumers
    pub fn is_stopped(&self) -> bool {
        matches!(self, EngineError::Stopped { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        let err = EngineError::DuplicateNode("dup".into());
        assert_eq!(err.kind(), "GRAPH_DUPLICATE_NODE");
        assert_eq!(err.status(), 400);

        let err = EngineError::GraphNotFound(Uuid::nil());
        assert_eq!(err.kind(), "GRAPH_NOT_FOUND");
        assert_eq!(err.status(), 404);
    }

    #[test]
    fn stopped_is_not_a_consumer_error() {
        let err = EngineError::Stopped { reason: "shutdown".into() };
        assert!(err.is_stopped());
        assert_eq!(err.status(), 500);
    }

    #[test]
    fn checkpoint_errors_convert() {
        let err: EngineError = CheckpointError::storage("boom").into();
        assert_eq!(err.kind(), "CHECKPOINT_ERROR");
    }
}
