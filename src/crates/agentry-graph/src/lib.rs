//! # agentry-graph
//!
//! Core engine for agentry agent graphs: the vocabulary (schemas, versions,
//! messages, statuses, events), the node template system with its two-phase
//! compiler, the registry of live compiled graphs, per-graph state tracking
//! with notification fan-out, and the provider-agnostic LLM invocation
//! contract.
//!
//! A graph is authored as a [`schema::GraphSchema`] naming registered
//! [`template::NodeTemplate`]s, compiled by the [`compiler::GraphCompiler`]
//! into a [`compiled::CompiledGraph`] of typed [`node::NodeInstance`]s, and
//! registered in the process-wide [`registry::GraphRegistry`]. Node event
//! streams are folded by the [`state::GraphStateManager`] into statuses and
//! re-published as [`events::Notification`]s.

pub mod compiled;
pub mod compiler;
pub mod error;
pub mod events;
pub mod llm;
pub mod messages;
pub mod node;
pub mod registry;
pub mod schema;
pub mod state;
pub mod status;
pub mod template;
pub mod version;

pub use compiled::{CompiledGraph, CompiledNode};
pub use compiler::{GraphCompiler, GraphMeta};
pub use error::{EngineError, Result};
pub use events::{
    AgentEvent, Notification, NotificationHub, RuntimeEvent, TriggerEvent,
    EVENT_CHANNEL_CAPACITY,
};
pub use llm::{
    AiDelta, InvocationBackend, InvocationChunk, InvocationRequest, InvocationStream,
    ReasoningDelta, ReasoningEffort, TokenUsage, ToolChoice, ToolDefinition, UsageSnapshot,
};
pub use messages::{added_messages, Message, MessageRole, ToolCall};
pub use node::{
    AgentNode, AgentRunOutput, ExecOutcome, KnowledgeNode, McpNode, NodeInstance, RunnableConfig,
    RuntimeNode, ToolNode, TriggerNode,
};
pub use registry::{EngineStatus, GraphRegistry};
pub use schema::{EdgeSchema, GraphConfig, GraphSchema, NodeSchema};
pub use state::{ActiveExec, GraphState, GraphStateManager, NodeSnapshot, StateScope};
pub use status::{GraphStatus, NodeStatus, ThreadStatus};
pub use template::{
    validate_template_config, CompilationFrame, NodeHandle, NodeInit, NodeKind, NodeMetadata,
    NodeTemplate, PortSpec, TemplateRegistry,
};
pub use version::GraphVersion;
