//! The live, in-memory form of a graph.
//!
//! A [`CompiledGraph`] owns its node instances exclusively: an instance's
//! lifetime ends when its handle's `destroy` completes. Teardown runs in
//! reverse construction order, is idempotent, and finishes by draining the
//! state-manager observers so a destroyed graph never re-emits events for
//! past runs.

use crate::error::{EngineError, Result};
use crate::node::{AgentNode, NodeInstance, TriggerNode};
use crate::schema::EdgeSchema;
use crate::state::{GraphState, GraphStateManager};
use crate::template::{NodeHandle, NodeKind};
use crate::version::GraphVersion;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// One instantiated node inside a compiled graph
#[derive(Clone)]
pub struct CompiledNode {
    /// Node id from the schema
    pub id: String,
    /// Kind of the node
    pub kind: NodeKind,
    /// Template that produced it
    pub template: String,
    /// Validated config it was built with
    pub config: Value,
    /// Handle used to construct and destroy the instance
    pub handle: Arc<dyn NodeHandle>,
    /// The live instance
    pub instance: NodeInstance,
}

/// A compiled, runnable graph
pub struct CompiledGraph {
    /// Owning graph id
    pub graph_id: Uuid,
    /// Schema version this instance was compiled from
    pub version: GraphVersion,
    nodes: HashMap<String, CompiledNode>,
    order: Vec<String>,
    /// Ordered edges from the schema
    pub edges: Vec<EdgeSchema>,
    /// Per-node status tracker
    pub state: Arc<GraphState>,
    manager: Mutex<Option<GraphStateManager>>,
    destroyed: AtomicBool,
}

impl CompiledGraph {
    /// Assemble a compiled graph (called by the compiler)
    pub fn new(
        graph_id: Uuid,
        version: GraphVersion,
        nodes: Vec<CompiledNode>,
        edges: Vec<EdgeSchema>,
    ) -> Self {
        let order: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        let state = Arc::new(GraphState::new(graph_id, order.clone()));
        let nodes = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        Self {
            graph_id,
            version,
            nodes,
            order,
            edges,
            state,
            manager: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Attach the state manager whose observers must drain on destroy
    pub fn attach_manager(&self, manager: GraphStateManager) {
        *self.manager.lock() = Some(manager);
    }

    /// Node by id
    pub fn node(&self, node_id: &str) -> Option<&CompiledNode> {
        self.nodes.get(node_id)
    }

    /// All nodes in construction order
    pub fn nodes(&self) -> impl Iterator<Item = &CompiledNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Instance by node id
    pub fn instance(&self, node_id: &str) -> Result<NodeInstance> {
        self.nodes
            .get(node_id)
            .map(|n| n.instance.clone())
            .ok_or_else(|| EngineError::NodeNotFound {
                graph_id: self.graph_id,
                node_id: node_id.to_string(),
            })
    }

    /// Agent instance by node id
    pub fn agent(&self, node_id: &str) -> Result<Arc<dyn AgentNode>> {
        self.instance(node_id)?
            .as_agent()
            .ok_or_else(|| EngineError::AgentNotFound(node_id.to_string()))
    }

    /// Trigger instance by node id; distinguishes missing from wrong-kind
    pub fn trigger(&self, node_id: &str) -> Result<Arc<dyn TriggerNode>> {
        self.instance(node_id)?
            .as_trigger()
            .ok_or_else(|| EngineError::NodeNotTrigger(node_id.to_string()))
    }

    /// Every agent instance, with its node id
    pub fn agents(&self) -> Vec<(String, Arc<dyn AgentNode>)> {
        self.nodes()
            .filter_map(|n| n.instance.as_agent().map(|a| (n.id.clone(), a)))
            .collect()
    }

    /// Whether destroy has completed (or is in progress)
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Tear the graph down.
    ///
    /// Destroys every instance in reverse construction order (continuing on
    /// individual failures), then drains and stops the state-manager
    /// observers. Safe to call more than once; only the first call does
    /// work.
    pub async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            debug!(graph_id = %self.graph_id, "destroy called on already-destroyed graph");
            return Ok(());
        }

        debug!(graph_id = %self.graph_id, nodes = self.order.len(), "destroying compiled graph");

        let mut first_error: Option<EngineError> = None;
        for node_id in self.order.iter().rev() {
            let Some(node) = self.nodes.get(node_id) else { continue };
            if let Err(e) = node.handle.destroy(&node.instance).await {
                warn!(graph_id = %self.graph_id, node_id = %node_id, error = %e, "node destroy failed");
                first_error.get_or_insert(e);
            }
        }

        // Observers fold the stop events emitted above before exiting, so
        // every ThreadUpdate(Stopped) is published before destroy returns.
        let manager = self.manager.lock().take();
        if let Some(manager) = manager {
            manager.shutdown().await;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("graph_id", &self.graph_id)
            .field("version", &self.version.to_string())
            .field("nodes", &self.order)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
