//! The `manual-trigger` template: the plain external entry point.
//!
//! A manual trigger forwards caller-supplied messages to its single
//! downstream agent. It never holds a reference to the agent instance;
//! the `(graph_id, node_id)` pair is resolved through the graph registry at
//! invocation time, so a revision swap can never leave it pointing at a
//! torn-down instance.

use agentry_graph::{
    AgentRunOutput, CompilationFrame, EngineError, GraphRegistry, Message, NodeHandle, NodeInit,
    NodeInstance, NodeKind, NodeTemplate, PortSpec, Result, RunnableConfig, TriggerEvent,
    TriggerNode, EVENT_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Template id of the manual trigger
pub const MANUAL_TRIGGER_TEMPLATE: &str = "manual-trigger";

/// Factory for manual triggers
pub struct ManualTriggerTemplate {
    registry: Arc<GraphRegistry>,
}

impl ManualTriggerTemplate {
    /// Create the template over the live-graph registry
    pub fn new(registry: Arc<GraphRegistry>) -> Self {
        Self { registry }
    }
}

impl NodeTemplate for ManualTriggerTemplate {
    fn id(&self) -> &str {
        MANUAL_TRIGGER_TEMPLATE
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Trigger
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "additionalProperties": false
        })
    }

    fn outputs(&self) -> Vec<PortSpec> {
        vec![PortSpec::single(NodeKind::SimpleAgent)]
    }

    fn create(&self) -> Arc<dyn NodeHandle> {
        Arc::new(ManualTriggerHandle {
            registry: self.registry.clone(),
            trigger: Mutex::new(None),
        })
    }
}

struct ManualTriggerHandle {
    registry: Arc<GraphRegistry>,
    trigger: Mutex<Option<Arc<ManualTrigger>>>,
}

#[async_trait]
impl NodeHandle for ManualTriggerHandle {
    async fn provide(&self, init: &NodeInit) -> Result<NodeInstance> {
        let trigger = Arc::new(ManualTrigger::new(
            init.metadata.graph_id,
            init.metadata.node_id.clone(),
            self.registry.clone(),
        ));
        *self.trigger.lock() = Some(trigger.clone());
        Ok(NodeInstance::Trigger(trigger))
    }

    async fn configure(
        &self,
        init: &NodeInit,
        _instance: &NodeInstance,
        frame: &CompilationFrame,
    ) -> Result<()> {
        let trigger = self
            .trigger
            .lock()
            .clone()
            .ok_or_else(|| EngineError::internal("manual trigger configured before provide"))?;

        let agent_node_id = init
            .output_node_ids
            .iter()
            .find(|id| frame.agent(id).is_some())
            .cloned()
            .ok_or_else(|| EngineError::AgentNotFound(init.metadata.node_id.clone()))?;
        trigger.set_agent_node(agent_node_id);
        Ok(())
    }

    async fn destroy(&self, instance: &NodeInstance) -> Result<()> {
        if let Some(trigger) = instance.as_trigger() {
            trigger.stop().await?;
        }
        Ok(())
    }
}

/// Live manual trigger instance
pub struct ManualTrigger {
    graph_id: Uuid,
    node_id: String,
    registry: Arc<GraphRegistry>,
    agent_node_id: RwLock<Option<String>>,
    started: AtomicBool,
    events: broadcast::Sender<TriggerEvent>,
}

impl ManualTrigger {
    fn new(graph_id: Uuid, node_id: String, registry: Arc<GraphRegistry>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            graph_id,
            node_id,
            registry,
            agent_node_id: RwLock::new(None),
            started: AtomicBool::new(false),
            events,
        }
    }

    fn set_agent_node(&self, agent_node_id: String) {
        *self.agent_node_id.write() = Some(agent_node_id);
    }

    /// Node id of the downstream agent, once configured
    pub fn agent_node(&self) -> Option<String> {
        self.agent_node_id.read().clone()
    }

    fn emit(&self, event: TriggerEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl TriggerNode for ManualTrigger {
    async fn start(&self) -> Result<()> {
        if !self.started.swap(true, Ordering::SeqCst) {
            debug!(graph_id = %self.graph_id, node_id = %self.node_id, "manual trigger started");
            self.emit(TriggerEvent::Start);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.started.swap(false, Ordering::SeqCst) {
            debug!(graph_id = %self.graph_id, node_id = %self.node_id, "manual trigger stopped");
            self.emit(TriggerEvent::Stop);
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<TriggerEvent> {
        self.events.subscribe()
    }

    async fn invoke_agent(
        &self,
        messages: Vec<Message>,
        mut rc: RunnableConfig,
    ) -> Result<Option<AgentRunOutput>> {
        if !self.is_started() {
            return Err(EngineError::TriggerNotStarted(self.node_id.clone()));
        }
        self.emit(TriggerEvent::Invoke { thread_id: rc.thread_id.clone() });

        let agent_node = self
            .agent_node_id
            .read()
            .clone()
            .ok_or_else(|| EngineError::AgentNotFound(self.node_id.clone()))?;
        rc.node_id = agent_node.clone();

        // Resolved at call time so restarts and revision swaps are safe.
        let agent = self.registry.agent(self.graph_id, &agent_node)?;

        if rc.async_run {
            let thread_id = rc.thread_id.clone();
            tokio::spawn(async move {
                if let Err(e) = agent.run_or_append(messages, rc).await {
                    if !e.is_stopped() {
                        warn!(thread = %thread_id, error = %e, "detached trigger run failed");
                    }
                }
            });
            Ok(None)
        } else {
            agent.run_or_append(messages, rc).await
        }
    }
}
