//! Process-wide registry of live compiled graphs.
//!
//! At most one live [`CompiledGraph`] may exist per graph id. The registry
//! map is guarded by a mutex held only around insert/remove/lookup; teardown
//! awaits outside the lock, and a failed teardown restores a `Stopped` entry
//! rather than leaving the map inconsistent.

use crate::compiled::CompiledGraph;
use crate::error::{EngineError, Result};
use crate::node::{AgentNode, NodeInstance, TriggerNode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Engine-level status of a registered graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    /// Being compiled; not yet accepting invocations
    Compiling,
    /// Live and accepting invocations
    Running,
    /// Teardown in progress
    Stopping,
    /// Torn down (kept only transiently after a failed destroy)
    Stopped,
}

struct RegistryEntry {
    compiled: Arc<CompiledGraph>,
    status: EngineStatus,
}

/// Map of graph id to live compiled instance and engine status
#[derive(Default)]
pub struct GraphRegistry {
    entries: Mutex<HashMap<Uuid, RegistryEntry>>,
}

impl GraphRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a compiled graph under `Compiling` status.
    ///
    /// Fails with `GRAPH_ALREADY_RUNNING` if a live entry exists.
    pub fn register(&self, graph_id: Uuid, compiled: Arc<CompiledGraph>) -> Result<()> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&graph_id) {
            if existing.status != EngineStatus::Stopped {
                return Err(EngineError::GraphAlreadyRunning(graph_id));
            }
        }
        entries.insert(
            graph_id,
            RegistryEntry { compiled, status: EngineStatus::Compiling },
        );
        debug!(graph_id = %graph_id, "registered compiled graph");
        Ok(())
    }

    /// Update a registered graph's engine status; returns false if absent
    pub fn set_status(&self, graph_id: Uuid, status: EngineStatus) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&graph_id) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    /// Engine status of a graph, if registered
    pub fn status(&self, graph_id: Uuid) -> Option<EngineStatus> {
        self.entries.lock().get(&graph_id).map(|e| e.status)
    }

    /// True when the graph is absent or stopped
    pub fn is_stop(&self, graph_id: Uuid) -> bool {
        matches!(self.status(graph_id), None | Some(EngineStatus::Stopped))
    }

    /// The live compiled graph, if registered
    pub fn get(&self, graph_id: Uuid) -> Option<Arc<CompiledGraph>> {
        self.entries.lock().get(&graph_id).map(|e| e.compiled.clone())
    }

    /// The live compiled graph, failing with `GRAPH_NOT_RUNNING`
    pub fn require(&self, graph_id: Uuid) -> Result<Arc<CompiledGraph>> {
        self.get(graph_id)
            .ok_or(EngineError::GraphNotRunning(graph_id))
    }

    /// Instance of a node within a registered graph
    pub fn instance(&self, graph_id: Uuid, node_id: &str) -> Result<NodeInstance> {
        self.require(graph_id)?.instance(node_id)
    }

    /// Agent instance within a registered graph
    pub fn agent(&self, graph_id: Uuid, node_id: &str) -> Result<Arc<dyn AgentNode>> {
        self.require(graph_id)?.agent(node_id)
    }

    /// Trigger instance within a registered graph
    pub fn trigger(&self, graph_id: Uuid, node_id: &str) -> Result<Arc<dyn TriggerNode>> {
        self.require(graph_id)?.trigger(node_id)
    }

    /// Ids of every registered graph
    pub fn graph_ids(&self) -> Vec<Uuid> {
        self.entries.lock().keys().copied().collect()
    }

    /// Tear down and remove a graph.
    ///
    /// Returns `Ok(false)` when no entry existed. On teardown failure the
    /// entry is kept under `Stopped` status and the error propagates.
    pub async fn destroy(&self, graph_id: Uuid) -> Result<bool> {
        let compiled = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&graph_id) {
                Some(entry) => {
                    entry.status = EngineStatus::Stopping;
                    entry.compiled.clone()
                }
                None => return Ok(false),
            }
        };

        match compiled.destroy().await {
            Ok(()) => {
                self.entries.lock().remove(&graph_id);
                debug!(graph_id = %graph_id, "graph removed from registry");
                Ok(true)
            }
            Err(e) => {
                warn!(graph_id = %graph_id, error = %e, "graph teardown failed");
                self.set_status(graph_id, EngineStatus::Stopped);
                Err(e)
            }
        }
    }
}
