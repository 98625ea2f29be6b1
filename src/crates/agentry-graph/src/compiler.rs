//! Graph compiler: schema validation and two-phase instantiation.
//!
//! Compilation is all-or-nothing. Nodes are ordered kind-layered (runtimes,
//! then knowledge/MCP, then tools, then agents, then triggers; edges order
//! nodes within a layer, schema position breaks ties), `provide`d in that
//! order into a compilation frame, then `configure`d in the same order so
//! later nodes can read earlier instances. Any failure unwinds every
//! already-provided node in reverse order before propagating — the registry
//! never observes a half-built graph.

use crate::compiled::{CompiledGraph, CompiledNode};
use crate::error::{EngineError, Result};
use crate::node::NodeInstance;
use crate::schema::{GraphSchema, NodeSchema};
use crate::template::{
    validate_template_config, CompilationFrame, NodeHandle, NodeInit, NodeMetadata,
    TemplateRegistry,
};
use crate::version::GraphVersion;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Identity of the graph being compiled
#[derive(Debug, Clone)]
pub struct GraphMeta {
    /// Graph id
    pub graph_id: Uuid,
    /// Schema version being compiled
    pub version: GraphVersion,
}

/// A node that has passed the provide phase
struct Provided {
    node: NodeSchema,
    handle: Arc<dyn NodeHandle>,
    init: NodeInit,
    instance: NodeInstance,
}

/// Validates schemas and produces [`CompiledGraph`]s
pub struct GraphCompiler {
    templates: Arc<TemplateRegistry>,
}

impl GraphCompiler {
    /// Create a compiler over a template registry
    pub fn new(templates: Arc<TemplateRegistry>) -> Self {
        Self { templates }
    }

    /// Pure schema validation.
    ///
    /// Checks, in order: unique node ids, registered templates, edge
    /// endpoints, per-template config schemas, and kind compatibility of
    /// every edge against the endpoint templates' port declarations.
    pub fn validate_schema(&self, schema: &GraphSchema) -> Result<()> {
        let mut seen = HashSet::new();
        for node in &schema.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(EngineError::DuplicateNode(node.id.clone()));
            }
        }

        for node in &schema.nodes {
            self.templates.require(&node.template)?;
        }

        for edge in &schema.edges {
            if schema.node(&edge.from).is_none() || schema.node(&edge.to).is_none() {
                return Err(EngineError::EdgeNotFound {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                });
            }
        }

        for node in &schema.nodes {
            let template = self.templates.require(&node.template)?;
            validate_template_config(template.as_ref(), &node.id, &node.config)?;
        }

        self.validate_edge_kinds(schema)?;
        Ok(())
    }

    fn validate_edge_kinds(&self, schema: &GraphSchema) -> Result<()> {
        for edge in &schema.edges {
            // Endpoint existence was checked by validate_schema.
            let Some(from) = schema.node(&edge.from) else { continue };
            let Some(to) = schema.node(&edge.to) else { continue };
            let src = self.templates.require(&from.template)?;
            let dst = self.templates.require(&to.template)?;

            let src_kind = src.kind();
            let dst_kind = dst.kind();

            let Some(out_port) = src.outputs().into_iter().find(|p| p.kind == dst_kind) else {
                return Err(EngineError::KindMismatch {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    reason: format!(
                        "template '{}' declares no output accepting kind {:?}",
                        src.id(),
                        dst_kind
                    ),
                });
            };

            let Some(in_port) = dst.inputs().into_iter().find(|p| p.kind == src_kind) else {
                return Err(EngineError::KindMismatch {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    reason: format!(
                        "template '{}' declares no input accepting kind {:?}",
                        dst.id(),
                        src_kind
                    ),
                });
            };

            if !out_port.multiple {
                let fanout = self.count_edges_of_kind(schema, |e| e.from == edge.from, true, dst_kind);
                if fanout > 1 {
                    return Err(EngineError::KindMismatch {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        reason: format!(
                            "template '{}' accepts a single {:?} output but has {}",
                            src.id(),
                            dst_kind,
                            fanout
                        ),
                    });
                }
            }

            if !in_port.multiple {
                let fanin = self.count_edges_of_kind(schema, |e| e.to == edge.to, false, src_kind);
                if fanin > 1 {
                    return Err(EngineError::KindMismatch {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        reason: format!(
                            "template '{}' accepts a single {:?} input but has {}",
                            dst.id(),
                            src_kind,
                            fanin
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    fn count_edges_of_kind(
        &self,
        schema: &GraphSchema,
        side: impl Fn(&crate::schema::EdgeSchema) -> bool,
        far_end_is_target: bool,
        kind: crate::template::NodeKind,
    ) -> usize {
        schema
            .edges
            .iter()
            .filter(|e| side(e))
            .filter(|e| {
                let far = if far_end_is_target { &e.to } else { &e.from };
                schema
                    .node(far)
                    .and_then(|n| self.templates.get(&n.template))
                    .map(|t| t.kind() == kind)
                    .unwrap_or(false)
            })
            .count()
    }

    /// Deterministic construction order: primary key is the kind layer,
    /// edges order nodes within a layer, schema position breaks ties.
    fn ordering(&self, schema: &GraphSchema) -> Result<Vec<usize>> {
        let n = schema.nodes.len();
        let index_of: HashMap<&str, usize> = schema
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.id.as_str(), i))
            .collect();

        let mut layer = vec![0u8; n];
        for (i, node) in schema.nodes.iter().enumerate() {
            layer[i] = self.templates.require(&node.template)?.kind().layer();
        }

        // Only same-layer edges constrain the order; cross-layer edges are
        // already satisfied by the layering itself.
        let mut indegree = vec![0usize; n];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
        for edge in &schema.edges {
            let (Some(&f), Some(&t)) =
                (index_of.get(edge.from.as_str()), index_of.get(edge.to.as_str()))
            else {
                continue;
            };
            if f != t && layer[f] == layer[t] {
                successors[f].push(t);
                indegree[t] += 1;
            }
        }

        let mut emitted = vec![false; n];
        let mut order = Vec::with_capacity(n);
        while order.len() < n {
            let next = (0..n)
                .filter(|&i| !emitted[i] && indegree[i] == 0)
                .min_by_key(|&i| (layer[i], i))
                // A same-layer cycle leaves no zero-indegree node; break it
                // deterministically instead of diverging.
                .or_else(|| (0..n).filter(|&i| !emitted[i]).min_by_key(|&i| (layer[i], i)));

            let Some(i) = next else { break };
            emitted[i] = true;
            order.push(i);
            for &succ in &successors[i] {
                indegree[succ] = indegree[succ].saturating_sub(1);
            }
        }
        Ok(order)
    }

    /// Compile a schema into a live graph.
    pub async fn compile(&self, meta: &GraphMeta, schema: &GraphSchema) -> Result<CompiledGraph> {
        self.validate_schema(schema)?;
        let order = self.ordering(schema)?;

        debug!(graph_id = %meta.graph_id, version = %meta.version, nodes = order.len(), "compiling graph");

        let mut frame = CompilationFrame::new();
        let mut provided: Vec<Provided> = Vec::with_capacity(order.len());

        // Phase 1: provide, leaves first.
        for idx in order {
            let node = &schema.nodes[idx];
            let template = self.templates.require(&node.template)?;
            let handle = template.create();
            let init = NodeInit {
                config: node.config.clone(),
                input_node_ids: schema.input_node_ids(&node.id),
                output_node_ids: schema.output_node_ids(&node.id),
                metadata: NodeMetadata {
                    graph_id: meta.graph_id,
                    node_id: node.id.clone(),
                    version: meta.version,
                },
            };

            match handle.provide(&init).await {
                Ok(instance) => {
                    frame.insert(node.id.clone(), instance.clone());
                    provided.push(Provided { node: node.clone(), handle, init, instance });
                }
                Err(e) => {
                    warn!(graph_id = %meta.graph_id, node_id = %node.id, error = %e, "provide failed, unwinding");
                    unwind(&provided).await;
                    return Err(e);
                }
            }
        }

        // Phase 2: configure in the same order; neighbours are readable via
        // the frame.
        for p in &provided {
            if let Err(e) = p.handle.configure(&p.init, &p.instance, &frame).await {
                warn!(graph_id = %meta.graph_id, node_id = %p.node.id, error = %e, "configure failed, unwinding");
                unwind(&provided).await;
                return Err(e);
            }
        }

        let nodes = provided
            .into_iter()
            .map(|p| CompiledNode {
                id: p.node.id,
                kind: p.instance.kind(),
                template: p.node.template,
                config: p.node.config,
                handle: p.handle,
                instance: p.instance,
            })
            .collect();

        Ok(CompiledGraph::new(
            meta.graph_id,
            meta.version,
            nodes,
            schema.edges.clone(),
        ))
    }
}

/// Destroy already-provided nodes in reverse order, logging failures.
async fn unwind(provided: &[Provided]) {
    for p in provided.iter().rev() {
        if let Err(e) = p.handle.destroy(&p.instance).await {
            warn!(node_id = %p.node.id, error = %e, "destroy during compile unwind failed");
        }
    }
}
