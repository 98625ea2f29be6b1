//! Node instance contracts, one per node kind.
//!
//! Instances are the live objects a compiled graph owns. Each kind exposes a
//! small contract (`start`/`stop`/`subscribe` plus its operation methods) and
//! [`NodeInstance`] is the closed tagged union the registry hands out, so
//! kind dispatch is a match instead of ad-hoc downcasts.
//!
//! Neighbour access is by `(graph_id, node_id)` resolved through the
//! [`GraphRegistry`](crate::registry::GraphRegistry) at call time; instances
//! never hold long-lived references to each other.

use crate::error::Result;
use crate::events::{AgentEvent, RuntimeEvent, TriggerEvent};
use crate::llm::UsageSnapshot;
use crate::messages::Message;
use crate::template::NodeKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Per-run context threaded through every node operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnableConfig {
    /// External thread id (`"{graph_id}:{sub_id}"`)
    pub thread_id: String,
    /// Thread that spawned this one, for nested agent calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_thread_id: Option<String>,
    /// Owning graph
    pub graph_id: Uuid,
    /// Node the operation is addressed to
    pub node_id: String,
    /// Checkpoint namespace (`"{graph_id}:{sub_id}:{agent_node_id}"`)
    pub checkpoint_ns: String,
    /// Unique run id
    pub run_id: String,
    /// Whether the caller detaches instead of awaiting the run
    #[serde(default)]
    pub async_run: bool,
}

impl RunnableConfig {
    /// Build a config for a new run against an agent node
    pub fn for_run(
        graph_id: Uuid,
        node_id: impl Into<String>,
        thread_id: impl Into<String>,
        checkpoint_ns: impl Into<String>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            parent_thread_id: None,
            graph_id,
            node_id: node_id.into(),
            checkpoint_ns: checkpoint_ns.into(),
            run_id: Uuid::new_v4().to_string(),
            async_run: false,
        }
    }

    /// Mark the run as detached
    pub fn with_async(mut self, async_run: bool) -> Self {
        self.async_run = async_run;
        self
    }

    /// Attach a parent thread
    pub fn with_parent_thread(mut self, parent: impl Into<String>) -> Self {
        self.parent_thread_id = Some(parent.into());
        self
    }
}

/// Result of one runtime exec
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutcome {
    /// Process exit code
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// True when the exec failed
    pub fail: bool,
}

impl ExecOutcome {
    /// The deterministic outcome synthesized for an exec aborted by a stop
    pub fn aborted() -> Self {
        Self {
            exit_code: 124,
            stdout: String::new(),
            stderr: "Aborted".to_string(),
            fail: true,
        }
    }
}

/// What an agent run returns to its caller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRunOutput {
    /// Messages produced by the run (new messages only)
    pub messages: Vec<Message>,
    /// External thread id the run executed on
    pub thread_id: String,
    /// Checkpoint namespace the run persisted under
    pub checkpoint_ns: String,
    /// Whether the finish tool asked for more input
    pub needs_more_info: bool,
}

/// Runtime nodes: sandboxed execution environments shared by a graph's agents
#[async_trait]
pub trait RuntimeNode: Send + Sync {
    /// Bring the runtime up
    async fn start(&self) -> Result<()>;
    /// Tear the runtime down
    async fn stop(&self) -> Result<()>;
    /// Subscribe to this runtime's event stream
    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent>;
    /// Execute a command; emits `ExecStart`/`ExecEnd` around the work
    async fn exec(&self, command: &str, rc: &RunnableConfig) -> Result<ExecOutcome>;
}

/// Tool nodes: callable capabilities surfaced to agents
#[async_trait]
pub trait ToolNode: Send + Sync {
    /// Tool name as exposed to the model
    fn name(&self) -> &str;
    /// Description for the model
    fn description(&self) -> &str;
    /// JSON Schema of the arguments
    fn parameters(&self) -> Value;
    /// Shell tools get a synthesized aborted result when a stop lands
    /// mid-call
    fn is_shell(&self) -> bool {
        false
    }
    /// Invoke the tool
    async fn call(&self, args: Value, rc: &RunnableConfig) -> Result<Value>;
}

/// Knowledge nodes: retrieval sources agents can query
#[async_trait]
pub trait KnowledgeNode: Send + Sync {
    /// Source name
    fn name(&self) -> &str;
    /// Retrieve passages relevant to a query
    async fn retrieve(&self, query: &str) -> Result<Vec<String>>;
}

/// MCP nodes: discovered tool collections
#[async_trait]
pub trait McpNode: Send + Sync {
    /// Service name
    fn name(&self) -> &str;
    /// Tools currently exposed by the service
    async fn tools(&self) -> Result<Vec<Arc<dyn ToolNode>>>;
}

/// Trigger nodes: the external entry points of a graph
#[async_trait]
pub trait TriggerNode: Send + Sync {
    /// Accept invocations
    async fn start(&self) -> Result<()>;
    /// Stop accepting invocations
    async fn stop(&self) -> Result<()>;
    /// Whether `start` has completed
    fn is_started(&self) -> bool;
    /// Subscribe to this trigger's event stream
    fn subscribe(&self) -> broadcast::Receiver<TriggerEvent>;
    /// Forward messages to the downstream agent. Returns `None` when the
    /// run is detached (`rc.async_run`).
    async fn invoke_agent(
        &self,
        messages: Vec<Message>,
        rc: RunnableConfig,
    ) -> Result<Option<AgentRunOutput>>;
}

/// Agent nodes: the reasoning loops at the heart of a graph
#[async_trait]
pub trait AgentNode: Send + Sync {
    /// Display name (used in stop markers)
    fn name(&self) -> String;
    /// Subscribe to this agent's event stream
    fn subscribe(&self) -> broadcast::Receiver<AgentEvent>;
    /// Run a turn on a thread; fails `THREAD_BUSY` if one is active
    async fn run(&self, messages: Vec<Message>, rc: RunnableConfig) -> Result<AgentRunOutput>;
    /// Run, or append to the active run's pending queue. Returns `None`
    /// when the messages were appended instead of starting a run.
    async fn run_or_append(
        &self,
        messages: Vec<Message>,
        rc: RunnableConfig,
    ) -> Result<Option<AgentRunOutput>>;
    /// Stop every active run on this agent
    async fn stop(&self) -> Result<()>;
    /// Stop runs whose thread (or parent thread) matches
    async fn stop_thread(&self, thread_id: &str, reason: Option<String>) -> Result<()>;
    /// Accumulated counters for a thread, or `None` if it was never used
    async fn thread_token_usage(&self, thread_id: &str) -> Result<Option<UsageSnapshot>>;
}

/// The closed union of live node instances.
///
/// This is the `InstanceOf<Kind>` lookup: per-kind accessors return the
/// typed handle or `None`, so callers never downcast.
#[derive(Clone)]
pub enum NodeInstance {
    /// A trigger instance
    Trigger(Arc<dyn TriggerNode>),
    /// An agent instance
    Agent(Arc<dyn AgentNode>),
    /// A tool instance
    Tool(Arc<dyn ToolNode>),
    /// A runtime instance
    Runtime(Arc<dyn RuntimeNode>),
    /// A knowledge source instance
    Knowledge(Arc<dyn KnowledgeNode>),
    /// An MCP service instance
    Mcp(Arc<dyn McpNode>),
}

impl NodeInstance {
    /// The kind of this instance
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeInstance::Trigger(_) => NodeKind::Trigger,
            NodeInstance::Agent(_) => NodeKind::SimpleAgent,
            NodeInstance::Tool(_) => NodeKind::Tool,
            NodeInstance::Runtime(_) => NodeKind::Runtime,
            NodeInstance::Knowledge(_) => NodeKind::Knowledge,
            NodeInstance::Mcp(_) => NodeKind::Mcp,
        }
    }

    /// Typed accessor for triggers
    pub fn as_trigger(&self) -> Option<Arc<dyn TriggerNode>> {
        match self {
            NodeInstance::Trigger(t) => Some(t.clone()),
            _ => None,
        }
    }

    /// Typed accessor for agents
    pub fn as_agent(&self) -> Option<Arc<dyn AgentNode>> {
        match self {
            NodeInstance::Agent(a) => Some(a.clone()),
            _ => None,
        }
    }

    /// Typed accessor for tools
    pub fn as_tool(&self) -> Option<Arc<dyn ToolNode>> {
        match self {
            NodeInstance::Tool(t) => Some(t.clone()),
            _ => None,
        }
    }

    /// Typed accessor for runtimes
    pub fn as_runtime(&self) -> Option<Arc<dyn RuntimeNode>> {
        match self {
            NodeInstance::Runtime(r) => Some(r.clone()),
            _ => None,
        }
    }

    /// Typed accessor for knowledge sources
    pub fn as_knowledge(&self) -> Option<Arc<dyn KnowledgeNode>> {
        match self {
            NodeInstance::Knowledge(k) => Some(k.clone()),
            _ => None,
        }
    }

    /// Typed accessor for MCP services
    pub fn as_mcp(&self) -> Option<Arc<dyn McpNode>> {
        match self {
            NodeInstance::Mcp(m) => Some(m.clone()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for NodeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeInstance::{:?}", self.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl ToolNode for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn call(&self, args: Value, _rc: &RunnableConfig) -> Result<Value> {
            Ok(args)
        }
    }

    #[test]
    fn instance_accessors_are_kind_checked() {
        let instance = NodeInstance::Tool(Arc::new(EchoTool));
        assert_eq!(instance.kind(), NodeKind::Tool);
        assert!(instance.as_tool().is_some());
        assert!(instance.as_agent().is_none());
        assert!(instance.as_trigger().is_none());
    }

    #[test]
    fn aborted_exec_outcome_is_deterministic() {
        let outcome = ExecOutcome::aborted();
        assert_eq!(outcome.exit_code, 124);
        assert_eq!(outcome.stderr, "Aborted");
        assert!(outcome.fail);
        assert!(outcome.stdout.is_empty());
    }

    #[test]
    fn runnable_config_builds_fresh_run_ids() {
        let g = Uuid::new_v4();
        let a = RunnableConfig::for_run(g, "agent-1", "t", "ns");
        let b = RunnableConfig::for_run(g, "agent-1", "t", "ns");
        assert_ne!(a.run_id, b.run_id);
        assert!(!a.async_run);
        assert!(a.with_async(true).async_run);
    }
}
