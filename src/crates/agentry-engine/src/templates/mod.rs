//! Built-in node templates.
//!
//! The engine ships the two templates every graph needs to be invocable:
//! `manual-trigger` and `simple-agent`. Tool, runtime, knowledge and MCP
//! templates are integration-specific and register alongside these at
//! startup.

pub mod manual_trigger;
pub mod simple_agent;

pub use manual_trigger::{ManualTrigger, ManualTriggerTemplate, MANUAL_TRIGGER_TEMPLATE};
pub use simple_agent::{
    KnowledgeSearchTool, RuntimeShellTool, SimpleAgentTemplate, SIMPLE_AGENT_TEMPLATE,
};

use agentry_checkpoint::CheckpointStore;
use agentry_graph::{GraphRegistry, InvocationBackend, TemplateRegistry};
use std::sync::Arc;

/// Register the built-in templates into a template registry
pub fn register_builtin_templates(
    templates: &TemplateRegistry,
    registry: Arc<GraphRegistry>,
    backend: Arc<dyn InvocationBackend>,
    checkpoints: Arc<dyn CheckpointStore>,
) {
    templates.register(Arc::new(ManualTriggerTemplate::new(registry)));
    templates.register(Arc::new(SimpleAgentTemplate::new(backend, checkpoints)));
}
