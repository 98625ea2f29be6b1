//! Status vocabularies shared across the engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Persisted lifecycle status of a graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphStatus {
    /// Stored but never started
    Created,
    /// A start is in progress; external invocations are rejected
    Compiling,
    /// A live compiled instance is registered
    Running,
    /// Explicitly stopped or never restarted
    Stopped,
    /// The last start attempt failed; `error` holds the cause
    Error,
}

/// Base status of one compiled node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Provided but not yet started
    Starting,
    /// Started and waiting for work
    Idle,
    /// At least one exec or run is active
    Running,
    /// Stopped as part of teardown
    Stopped,
    /// The last operation on this node failed
    Error,
}

/// Status of one conversation thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    /// A run is in flight
    Running,
    /// The last run finished with the finish tool and no follow-up needed
    Done,
    /// The last run ended asking the caller for more input
    NeedMoreInfo,
    /// The last run was cancelled
    Stopped,
}

impl fmt::Display for GraphStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GraphStatus::Created => "created",
            GraphStatus::Compiling => "compiling",
            GraphStatus::Running => "running",
            GraphStatus::Stopped => "stopped",
            GraphStatus::Error => "error",
        };
        f.write_str(s)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Starting => "starting",
            NodeStatus::Idle => "idle",
            NodeStatus::Running => "running",
            NodeStatus::Stopped => "stopped",
            NodeStatus::Error => "error",
        };
        f.write_str(s)
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThreadStatus::Running => "running",
            ThreadStatus::Done => "done",
            ThreadStatus::NeedMoreInfo => "need_more_info",
            ThreadStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
