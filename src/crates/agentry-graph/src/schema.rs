//! Declarative graph schema types.
//!
//! A [`GraphSchema`] is the user-authored definition of a graph: a list of
//! nodes (template name + opaque config) and directed edges between them.
//! Edges carry no runtime values; they declare connectivity and drive the
//! input/output sets handed to node handles at configure time.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One node in a graph schema
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSchema {
    /// Node id, unique within the graph
    pub id: String,
    /// Registered template name
    pub template: String,
    /// Opaque config validated against the template's schema
    #[serde(default)]
    pub config: Value,
}

/// One directed edge in a graph schema
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EdgeSchema {
    /// Source node id
    pub from: String,
    /// Target node id
    pub to: String,
}

impl EdgeSchema {
    /// Create an edge
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self { from: from.into(), to: to.into() }
    }
}

/// A complete declarative graph definition
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphSchema {
    /// All nodes, in authoring order (used as the compile tie-breaker)
    #[serde(default)]
    pub nodes: Vec<NodeSchema>,
    /// All edges
    #[serde(default)]
    pub edges: Vec<EdgeSchema>,
}

impl GraphSchema {
    /// Look up a node by id
    pub fn node(&self, id: &str) -> Option<&NodeSchema> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Node ids feeding into `id` (edge sources)
    pub fn input_node_ids(&self, id: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|e| e.to == id)
            .map(|e| e.from.clone())
            .collect()
    }

    /// Node ids fed by `id` (edge targets)
    pub fn output_node_ids(&self, id: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|e| e.from == id)
            .map(|e| e.to.clone())
            .collect()
    }
}

/// The editable surface of a graph: what a revision replaces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphConfig {
    /// Display name
    pub name: String,
    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The node/edge definition
    pub schema: GraphSchema,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> GraphSchema {
        serde_json::from_value(json!({
            "nodes": [
                {"id": "trigger-1", "template": "manual-trigger", "config": {}},
                {"id": "agent-1", "template": "simple-agent", "config": {"instructions": "x"}}
            ],
            "edges": [{"from": "trigger-1", "to": "agent-1"}]
        }))
        .unwrap()
    }

    #[test]
    fn deserializes_from_json() {
        let s = schema();
        assert_eq!(s.nodes.len(), 2);
        assert_eq!(s.edges.len(), 1);
        assert_eq!(s.nodes[0].template, "manual-trigger");
    }

    #[test]
    fn neighbour_lookups_follow_edges() {
        let s = schema();
        assert_eq!(s.input_node_ids("agent-1"), vec!["trigger-1"]);
        assert_eq!(s.output_node_ids("trigger-1"), vec!["agent-1"]);
        assert!(s.output_node_ids("agent-1").is_empty());
    }

    #[test]
    fn missing_config_defaults_to_null() {
        let s: GraphSchema = serde_json::from_value(json!({
            "nodes": [{"id": "n", "template": "t"}],
            "edges": []
        }))
        .unwrap();
        assert!(s.node("n").unwrap().config.is_null());
    }
}
