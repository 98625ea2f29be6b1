//! Node templates and the template registry.
//!
//! A template is the factory for one node type: it declares a kind, a JSON
//! Schema for its config, input/output kind constraints, and produces a
//! [`NodeHandle`] whose three operations drive the two-phase compile:
//!
//! 1. `provide` — allocate the instance without side effects. May use the
//!    template's own injected dependencies, never its neighbours.
//! 2. `configure` — side-effectful wiring. May read neighbouring instances
//!    already provided in the [`CompilationFrame`].
//! 3. `destroy` — idempotent release, called in reverse order on teardown
//!    and on partial-compile unwind.
//!
//! Registration is process-global and happens at startup; compiling a schema
//! that names an unregistered template fails with `TEMPLATE_NOT_REGISTERED`.

use crate::error::{EngineError, Result};
use crate::node::NodeInstance;
use crate::version::GraphVersion;
use async_trait::async_trait;
use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Closed set of node kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    /// External entry point
    Trigger,
    /// LLM reasoning loop
    SimpleAgent,
    /// Callable capability
    Tool,
    /// Sandboxed execution environment
    Runtime,
    /// Retrieval source
    Knowledge,
    /// Discovered tool collection
    Mcp,
}

impl NodeKind {
    /// Compile layer: lower layers are instantiated first so later layers
    /// can read them at configure time.
    pub fn layer(&self) -> u8 {
        match self {
            NodeKind::Runtime => 0,
            NodeKind::Knowledge | NodeKind::Mcp => 1,
            NodeKind::Tool => 2,
            NodeKind::SimpleAgent => 3,
            NodeKind::Trigger => 4,
        }
    }
}

/// One input or output constraint declared by a template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    /// Kind of neighbour accepted on this port
    pub kind: NodeKind,
    /// Whether more than one edge of this kind is allowed
    pub multiple: bool,
}

impl PortSpec {
    /// A port accepting a single neighbour of `kind`
    pub fn single(kind: NodeKind) -> Self {
        Self { kind, multiple: false }
    }

    /// A port accepting any number of neighbours of `kind`
    pub fn many(kind: NodeKind) -> Self {
        Self { kind, multiple: true }
    }
}

/// Identity of the node being constructed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Owning graph
    pub graph_id: Uuid,
    /// Node id within the graph
    pub node_id: String,
    /// Schema version being compiled
    pub version: GraphVersion,
}

/// Everything a handle needs to provide and configure an instance
#[derive(Debug, Clone)]
pub struct NodeInit {
    /// Validated node config
    pub config: Value,
    /// Ids of nodes with edges into this one
    pub input_node_ids: Vec<String>,
    /// Ids of nodes this one has edges to
    pub output_node_ids: Vec<String>,
    /// Identity of the node under construction
    pub metadata: NodeMetadata,
}

/// Instances already provided during the current compile, readable at
/// configure time.
#[derive(Default)]
pub struct CompilationFrame {
    instances: HashMap<String, NodeInstance>,
}

impl CompilationFrame {
    /// Create an empty frame
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a provided instance
    pub fn insert(&mut self, node_id: impl Into<String>, instance: NodeInstance) {
        self.instances.insert(node_id.into(), instance);
    }

    /// Instance of a neighbour, if already provided
    pub fn instance(&self, node_id: &str) -> Option<&NodeInstance> {
        self.instances.get(node_id)
    }

    /// Typed neighbour accessors
    pub fn agent(&self, node_id: &str) -> Option<Arc<dyn crate::node::AgentNode>> {
        self.instance(node_id).and_then(|i| i.as_agent())
    }

    /// Tool neighbour, if provided
    pub fn tool(&self, node_id: &str) -> Option<Arc<dyn crate::node::ToolNode>> {
        self.instance(node_id).and_then(|i| i.as_tool())
    }

    /// Runtime neighbour, if provided
    pub fn runtime(&self, node_id: &str) -> Option<Arc<dyn crate::node::RuntimeNode>> {
        self.instance(node_id).and_then(|i| i.as_runtime())
    }

    /// Knowledge neighbour, if provided
    pub fn knowledge(&self, node_id: &str) -> Option<Arc<dyn crate::node::KnowledgeNode>> {
        self.instance(node_id).and_then(|i| i.as_knowledge())
    }

    /// MCP neighbour, if provided
    pub fn mcp(&self, node_id: &str) -> Option<Arc<dyn crate::node::McpNode>> {
        self.instance(node_id).and_then(|i| i.as_mcp())
    }
}

/// The three-operation construction contract produced by a template
#[async_trait]
pub trait NodeHandle: Send + Sync {
    /// Allocate the instance. No side effects, no neighbour access.
    async fn provide(&self, init: &NodeInit) -> Result<NodeInstance>;

    /// Wire the instance. May read neighbours already provided in `frame`
    /// and perform side effects (start listeners, open connections).
    async fn configure(
        &self,
        init: &NodeInit,
        instance: &NodeInstance,
        frame: &CompilationFrame,
    ) -> Result<()>;

    /// Release the instance. Must be idempotent.
    async fn destroy(&self, instance: &NodeInstance) -> Result<()>;
}

/// A registered node template
pub trait NodeTemplate: Send + Sync {
    /// Globally unique template id (the `template` field in schemas)
    fn id(&self) -> &str;
    /// Kind of node this template produces
    fn kind(&self) -> NodeKind;
    /// JSON Schema its config must satisfy
    fn config_schema(&self) -> Value;
    /// Input kind constraints
    fn inputs(&self) -> Vec<PortSpec> {
        Vec::new()
    }
    /// Output kind constraints
    fn outputs(&self) -> Vec<PortSpec> {
        Vec::new()
    }
    /// Produce a fresh handle for one node
    fn create(&self) -> Arc<dyn NodeHandle>;
}

impl std::fmt::Debug for dyn NodeTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeTemplate").field("id", &self.id()).finish()
    }
}

/// Validate a node config against its template's JSON Schema
pub fn validate_template_config(
    template: &dyn NodeTemplate,
    node_id: &str,
    config: &Value,
) -> Result<()> {
    let schema = template.config_schema();
    let compiled = JSONSchema::compile(&schema).map_err(|e| {
        EngineError::internal(format!("template '{}' has a bad config schema: {}", template.id(), e))
    })?;

    // Treat a missing config as an empty object so templates with all-optional
    // fields accept it.
    let empty = Value::Object(Default::default());
    let instance = if config.is_null() { &empty } else { config };

    if let Err(errors) = compiled.validate(instance) {
        let reason = errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
        return Err(EngineError::InvalidTemplateConfig {
            node_id: node_id.to_string(),
            reason,
        });
    }
    Ok(())
}

/// Catalog of node templates.
///
/// Process-wide by default ([`TemplateRegistry::global`]); tests build
/// isolated instances.
#[derive(Default)]
pub struct TemplateRegistry {
    templates: RwLock<HashMap<String, Arc<dyn NodeTemplate>>>,
}

static GLOBAL_REGISTRY: Lazy<TemplateRegistry> = Lazy::new(TemplateRegistry::new);

impl TemplateRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-global registry
    pub fn global() -> &'static TemplateRegistry {
        &GLOBAL_REGISTRY
    }

    /// Register a template. Re-registering an id replaces the previous
    /// entry.
    pub fn register(&self, template: Arc<dyn NodeTemplate>) {
        let id = template.id().to_string();
        let previous = self.templates.write().insert(id.clone(), template);
        if previous.is_some() {
            warn!(template = %id, "template re-registered, replacing previous entry");
        }
    }

    /// Look up a template
    pub fn get(&self, id: &str) -> Option<Arc<dyn NodeTemplate>> {
        self.templates.read().get(id).cloned()
    }

    /// Look up a template, failing with `TEMPLATE_NOT_REGISTERED`
    pub fn require(&self, id: &str) -> Result<Arc<dyn NodeTemplate>> {
        self.get(id)
            .ok_or_else(|| EngineError::TemplateNotRegistered(id.to_string()))
    }

    /// Registered template ids
    pub fn ids(&self) -> Vec<String> {
        self.templates.read().keys().cloned().collect()
    }

    /// Remove every registration (shutdown / test isolation)
    pub fn clear(&self) {
        self.templates.write().clear();
    }
}
