//! The `simple-agent` template: an [`AgentCore`] wired to its neighbours.
//!
//! At configure time the agent collects its outgoing edges: tool nodes are
//! surfaced directly, runtimes are wrapped in a shell tool, knowledge
//! sources in a search tool, and MCP services contribute their discovered
//! tools at each turn.

use agentry_agent::{AgentConfig, AgentCore};
use agentry_checkpoint::CheckpointStore;
use agentry_graph::{
    CompilationFrame, EngineError, ExecOutcome, InvocationBackend, KnowledgeNode, NodeHandle,
    NodeInit, NodeInstance, NodeKind, NodeTemplate, PortSpec, Result, RunnableConfig, RuntimeNode,
    ToolNode,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

/// Template id of the simple agent
pub const SIMPLE_AGENT_TEMPLATE: &str = "simple-agent";

/// Factory for simple agents
pub struct SimpleAgentTemplate {
    backend: Arc<dyn InvocationBackend>,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl SimpleAgentTemplate {
    /// Create the template with its injected dependencies
    pub fn new(backend: Arc<dyn InvocationBackend>, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self { backend, checkpoints }
    }
}

impl NodeTemplate for SimpleAgentTemplate {
    fn id(&self) -> &str {
        SIMPLE_AGENT_TEMPLATE
    }

    fn kind(&self) -> NodeKind {
        NodeKind::SimpleAgent
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "instructions": {"type": "string"},
                "invokeModelName": {"type": "string"},
                "summarizeModelName": {"type": "string"},
                "summarizeMaxTokens": {"type": "integer", "minimum": 1},
                "summarizeKeepTokens": {"type": "integer", "minimum": 0},
                "maxIterations": {"type": "integer", "minimum": 1},
                "guardMaxRetries": {"type": "integer", "minimum": 0},
                "injectMode": {"type": "string", "enum": ["on-finish", "after-tool-call"]},
                "modelPrices": {"type": "object"}
            },
            "required": ["instructions", "invokeModelName"],
            "additionalProperties": false
        })
    }

    fn inputs(&self) -> Vec<PortSpec> {
        vec![PortSpec::many(NodeKind::Trigger)]
    }

    fn outputs(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::many(NodeKind::Tool),
            PortSpec::many(NodeKind::Runtime),
            PortSpec::many(NodeKind::Knowledge),
            PortSpec::many(NodeKind::Mcp),
        ]
    }

    fn create(&self) -> Arc<dyn NodeHandle> {
        Arc::new(SimpleAgentHandle {
            backend: self.backend.clone(),
            checkpoints: self.checkpoints.clone(),
            core: Mutex::new(None),
        })
    }
}

struct SimpleAgentHandle {
    backend: Arc<dyn InvocationBackend>,
    checkpoints: Arc<dyn CheckpointStore>,
    core: Mutex<Option<Arc<AgentCore>>>,
}

#[async_trait]
impl NodeHandle for SimpleAgentHandle {
    async fn provide(&self, init: &NodeInit) -> Result<NodeInstance> {
        let config: AgentConfig =
            serde_json::from_value(init.config.clone()).map_err(|e| {
                EngineError::InvalidTemplateConfig {
                    node_id: init.metadata.node_id.clone(),
                    reason: e.to_string(),
                }
            })?;
        let core = Arc::new(AgentCore::new(
            init.metadata.graph_id,
            init.metadata.node_id.clone(),
            config,
            self.backend.clone(),
            self.checkpoints.clone(),
        ));
        *self.core.lock() = Some(core.clone());
        Ok(NodeInstance::Agent(core))
    }

    async fn configure(
        &self,
        init: &NodeInit,
        _instance: &NodeInstance,
        frame: &CompilationFrame,
    ) -> Result<()> {
        let core = self
            .core
            .lock()
            .clone()
            .ok_or_else(|| EngineError::internal("simple agent configured before provide"))?;

        let mut tools: Vec<Arc<dyn ToolNode>> = Vec::new();
        let mut mcp_services = Vec::new();
        for out_id in &init.output_node_ids {
            if let Some(tool) = frame.tool(out_id) {
                tools.push(tool);
            } else if let Some(runtime) = frame.runtime(out_id) {
                tools.push(Arc::new(RuntimeShellTool::new(runtime)));
            } else if let Some(knowledge) = frame.knowledge(out_id) {
                tools.push(Arc::new(KnowledgeSearchTool::new(knowledge)));
            } else if let Some(mcp) = frame.mcp(out_id) {
                mcp_services.push(mcp);
            }
        }
        core.set_tools(tools);
        core.set_mcp_services(mcp_services);
        Ok(())
    }

    async fn destroy(&self, instance: &NodeInstance) -> Result<()> {
        if let Some(agent) = instance.as_agent() {
            agent.stop().await?;
        }
        Ok(())
    }
}

/// Shell tool backed by a runtime neighbour
pub struct RuntimeShellTool {
    runtime: Arc<dyn RuntimeNode>,
}

impl RuntimeShellTool {
    /// Wrap a runtime as a shell tool
    pub fn new(runtime: Arc<dyn RuntimeNode>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl ToolNode for RuntimeShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command inside the graph's runtime"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Command line to execute"}
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn is_shell(&self) -> bool {
        true
    }

    async fn call(&self, args: Value, rc: &RunnableConfig) -> Result<Value> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::internal("shell tool requires a 'command' argument"))?;
        let outcome: ExecOutcome = self.runtime.exec(command, rc).await?;
        Ok(serde_json::to_value(outcome)?)
    }
}

/// Search tool backed by a knowledge neighbour
pub struct KnowledgeSearchTool {
    knowledge: Arc<dyn KnowledgeNode>,
}

impl KnowledgeSearchTool {
    /// Wrap a knowledge source as a search tool
    pub fn new(knowledge: Arc<dyn KnowledgeNode>) -> Self {
        Self { knowledge }
    }
}

#[async_trait]
impl ToolNode for KnowledgeSearchTool {
    fn name(&self) -> &str {
        self.knowledge.name()
    }

    fn description(&self) -> &str {
        "Search this knowledge source for passages relevant to a query"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"}
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    async fn call(&self, args: Value, _rc: &RunnableConfig) -> Result<Value> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::internal("search tool requires a 'query' argument"))?;
        let passages = self.knowledge.retrieve(query).await?;
        Ok(Value::String(passages.join("\n---\n")))
    }
}
