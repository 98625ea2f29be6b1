//! End-to-end engine scenarios against a scripted invocation backend.

use agentry_engine::{
    CreateGraphInput, Engine, EngineOptions, ExecuteTriggerInput, GraphStore, RequestCtx,
    RevisionStatus, RevisionStore, ThreadStore, UpdateGraphInput,
};
use agentry_graph::{
    CompilationFrame, GraphSchema, GraphStatus, GraphVersion, InvocationBackend, InvocationChunk,
    InvocationRequest, InvocationStream, Message, MessageRole, NodeHandle, NodeInit, NodeInstance,
    NodeKind, NodeTemplate, Notification, PortSpec, Result, RunnableConfig, RuntimeEvent,
    RuntimeNode, StateScope, ThreadStatus, TokenUsage, ToolCall, EVENT_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Poll an async condition until it holds or the 5s deadline passes.
macro_rules! wait_until {
    ($what:expr, $cond:expr) => {{
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if $cond {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for: {}",
                $what
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }};
}

// ============================================================================
// Fixtures
// ============================================================================

/// Deterministic backend:
/// - a human message of the form "Run this command: <cmd>" produces a shell
///   tool call for `<cmd>`;
/// - a tool result produces a finish call;
/// - anything else answers "ok" and finishes.
struct MockBackend;

impl MockBackend {
    fn chunks_for(messages: &[Message]) -> Vec<InvocationChunk> {
        let usage = InvocationChunk::usage(TokenUsage {
            input_tokens: 20,
            output_tokens: 5,
            total_tokens: 25,
            ..Default::default()
        });

        let last = messages
            .iter()
            .rev()
            .find(|m| !matches!(m.role, MessageRole::Reasoning));
        match last {
            Some(m) if m.role == MessageRole::Human => {
                if let Some(command) = m.content.strip_prefix("Run this command: ") {
                    vec![
                        InvocationChunk::tool_calls(vec![ToolCall::new(
                            format!("call-{}", Uuid::new_v4()),
                            "shell",
                            json!({"command": command}),
                        )]),
                        usage,
                    ]
                } else {
                    vec![InvocationChunk::content("ok"), finish_call(), usage]
                }
            }
            Some(m) if matches!(m.role, MessageRole::Tool | MessageRole::ToolShell) => {
                vec![InvocationChunk::content("command finished"), finish_call(), usage]
            }
            _ => vec![finish_call(), usage],
        }
    }
}

fn finish_call() -> InvocationChunk {
    InvocationChunk::tool_calls(vec![ToolCall::new(
        format!("finish-{}", Uuid::new_v4()),
        "finish",
        json!({}),
    )])
}

#[async_trait]
impl InvocationBackend for MockBackend {
    async fn invoke(
        &self,
        request: InvocationRequest,
        _abort: CancellationToken,
    ) -> Result<InvocationStream> {
        let chunks = Self::chunks_for(&request.messages);
        let items: Vec<Result<InvocationChunk>> = chunks.into_iter().map(Ok).collect();
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

/// Runtime whose execs sleep when asked to, so stops can land mid-exec.
struct MockRuntime {
    events: broadcast::Sender<RuntimeEvent>,
}

#[async_trait]
impl RuntimeNode for MockRuntime {
    async fn start(&self) -> Result<()> {
        let _ = self.events.send(RuntimeEvent::Start);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let _ = self.events.send(RuntimeEvent::Stop);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    async fn exec(&self, command: &str, rc: &RunnableConfig) -> Result<agentry_graph::ExecOutcome> {
        let exec_id = Uuid::new_v4().to_string();
        let _ = self.events.send(RuntimeEvent::ExecStart {
            exec_id: exec_id.clone(),
            thread_id: Some(rc.thread_id.clone()),
            run_id: Some(rc.run_id.clone()),
        });
        if command.contains("sleep") {
            tokio::time::sleep(Duration::from_secs(600)).await;
        }
        let _ = self.events.send(RuntimeEvent::ExecEnd { exec_id, error: None });
        Ok(agentry_graph::ExecOutcome {
            exit_code: 0,
            stdout: format!("ran: {}", command),
            stderr: String::new(),
            fail: false,
        })
    }
}

struct MockRuntimeTemplate;

struct MockRuntimeHandle;

#[async_trait]
impl NodeHandle for MockRuntimeHandle {
    async fn provide(&self, _init: &NodeInit) -> Result<NodeInstance> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(NodeInstance::Runtime(Arc::new(MockRuntime { events })))
    }

    async fn configure(
        &self,
        _init: &NodeInit,
        _instance: &NodeInstance,
        _frame: &CompilationFrame,
    ) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self, instance: &NodeInstance) -> Result<()> {
        if let Some(runtime) = instance.as_runtime() {
            runtime.stop().await?;
        }
        Ok(())
    }
}

impl NodeTemplate for MockRuntimeTemplate {
    fn id(&self) -> &str {
        "mock-runtime"
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Runtime
    }

    fn config_schema(&self) -> Value {
        json!({"type": "object", "additionalProperties": false})
    }

    fn inputs(&self) -> Vec<PortSpec> {
        vec![PortSpec::many(NodeKind::SimpleAgent)]
    }

    fn create(&self) -> Arc<dyn NodeHandle> {
        Arc::new(MockRuntimeHandle)
    }
}

fn engine() -> Engine {
    let engine = Engine::new(EngineOptions::in_memory(Arc::new(MockBackend)));
    engine.templates().register(Arc::new(MockRuntimeTemplate));
    engine
}

fn ctx() -> RequestCtx {
    RequestCtx::new("user-1")
}

fn minimal_schema() -> GraphSchema {
    serde_json::from_value(json!({
        "nodes": [
            {"id": "trigger-1", "template": "manual-trigger", "config": {}},
            {"id": "agent-1", "template": "simple-agent", "config": {
                "name": "Test Agent",
                "instructions": "Follow the user's request.",
                "invokeModelName": "mock-model",
                "summarizeMaxTokens": 1000,
                "summarizeKeepTokens": 100
            }}
        ],
        "edges": [{"from": "trigger-1", "to": "agent-1"}]
    }))
    .unwrap()
}

fn runtime_schema() -> GraphSchema {
    serde_json::from_value(json!({
        "nodes": [
            {"id": "trigger-1", "template": "manual-trigger", "config": {}},
            {"id": "agent-1", "template": "simple-agent", "config": {
                "name": "Test Agent",
                "instructions": "Follow the user's request.",
                "invokeModelName": "mock-model",
                "summarizeMaxTokens": 1000,
                "summarizeKeepTokens": 100
            }},
            {"id": "runtime-1", "template": "mock-runtime", "config": {}}
        ],
        "edges": [
            {"from": "trigger-1", "to": "agent-1"},
            {"from": "agent-1", "to": "runtime-1"}
        ]
    }))
    .unwrap()
}

fn create_input(schema: GraphSchema) -> CreateGraphInput {
    CreateGraphInput {
        name: "test graph".into(),
        description: None,
        schema,
        temporary: false,
    }
}

// ============================================================================
// S1 — create and run a minimal graph
// ============================================================================

#[tokio::test]
async fn create_and_run_minimal_graph() {
    let engine = engine();
    let ctx = ctx();

    let graph = engine
        .service()
        .create(&ctx, create_input(minimal_schema()))
        .await
        .unwrap();
    assert_eq!(graph.status, GraphStatus::Created);
    assert_eq!(graph.version.to_string(), "1.0.0");
    assert_eq!(graph.target_version.to_string(), "1.0.0");

    let mut notifications = engine.notifications();
    let running = engine.service().run(&ctx, graph.id).await.unwrap();
    assert_eq!(running.status, GraphStatus::Running);

    // Graph(Compiling) then Graph(Running), in that order.
    let mut engine_statuses = Vec::new();
    while let Ok(n) = notifications.try_recv() {
        if let Notification::Graph { status, .. } = n {
            engine_statuses.push(status);
        }
    }
    assert_eq!(engine_statuses, vec![GraphStatus::Compiling, GraphStatus::Running]);

    let err = engine.service().run(&ctx, graph.id).await.unwrap_err();
    assert_eq!(err.kind(), "GRAPH_ALREADY_RUNNING");

    engine.shutdown().await;
}

// ============================================================================
// S2 — invalid schemas are rejected at create time, nothing persisted
// ============================================================================

#[tokio::test]
async fn invalid_schemas_are_rejected() {
    let engine = engine();
    let ctx = ctx();

    let cases: Vec<(Value, &str)> = vec![
        (
            json!({
                "nodes": [
                    {"id": "dup", "template": "manual-trigger", "config": {}},
                    {"id": "dup", "template": "manual-trigger", "config": {}}
                ],
                "edges": []
            }),
            "GRAPH_DUPLICATE_NODE",
        ),
        (
            json!({
                "nodes": [{"id": "x", "template": "manual-trigger", "config": {}}],
                "edges": [{"from": "x", "to": "y"}]
            }),
            "GRAPH_EDGE_NOT_FOUND",
        ),
        (
            json!({
                "nodes": [{"id": "x", "template": "unknown", "config": {}}],
                "edges": []
            }),
            "TEMPLATE_NOT_REGISTERED",
        ),
        (
            json!({
                "nodes": [{"id": "x", "template": "simple-agent", "config": {"invalid": "x"}}],
                "edges": []
            }),
            "INVALID_TEMPLATE_CONFIG",
        ),
    ];

    for (schema, expected_kind) in cases {
        let schema: GraphSchema = serde_json::from_value(schema).unwrap();
        let err = engine
            .service()
            .create(&ctx, create_input(schema))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), expected_kind);
        assert_eq!(err.status(), 400);
    }

    // Nothing was persisted.
    assert!(engine.service().get_all(&ctx).await.unwrap().is_empty());
    engine.shutdown().await;
}

// ============================================================================
// S3 — schema updates are queued revisions
// ============================================================================

#[tokio::test]
async fn schema_update_is_a_revision() {
    let engine = engine();
    let ctx = ctx();

    let graph = engine
        .service()
        .create(&ctx, create_input(minimal_schema()))
        .await
        .unwrap();
    engine.service().run(&ctx, graph.id).await.unwrap();

    let mut new_schema = minimal_schema();
    new_schema.nodes[1].config["instructions"] = json!("Follow the updated request.");

    let outcome = engine
        .service()
        .update(
            &ctx,
            graph.id,
            UpdateGraphInput {
                current_version: "1.0.0".parse().unwrap(),
                name: None,
                description: None,
                schema: Some(new_schema),
            },
        )
        .await
        .unwrap();

    let revision = outcome.revision.expect("schema change queues a revision");
    assert_eq!(revision.to_version.to_string(), "1.0.1");
    assert_eq!(revision.base_version.to_string(), "1.0.0");
    assert_eq!(outcome.graph.target_version.to_string(), "1.0.1");
    assert!(outcome.graph.version <= outcome.graph.target_version);

    // A second edit computed against the stale base conflicts.
    let mut conflicting = minimal_schema();
    conflicting.nodes[1].config["instructions"] = json!("Another edit.");
    let err = engine
        .service()
        .update(
            &ctx,
            graph.id,
            UpdateGraphInput {
                current_version: "1.0.0".parse().unwrap(),
                name: None,
                description: None,
                schema: Some(conflicting),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "MERGE_CONFLICT");

    // The worker restarts the running graph under the new version.
    wait_until!("revision applied", {
        let g = engine.service().find_by_id(&ctx, graph.id).await.unwrap();
        g.version.to_string() == "1.0.1" && g.status == GraphStatus::Running
    });

    let applied = engine
        .ctx()
        .revisions
        .get(revision.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(applied.status, RevisionStatus::Applied);

    // Version invariant holds after apply.
    let final_graph = engine.service().find_by_id(&ctx, graph.id).await.unwrap();
    assert_eq!(final_graph.version, final_graph.target_version);
    assert_eq!(final_graph.version, GraphVersion::new(1, 0, 1));

    engine.shutdown().await;
}

#[tokio::test]
async fn name_only_update_is_synchronous() {
    let engine = engine();
    let ctx = ctx();

    let graph = engine
        .service()
        .create(&ctx, create_input(minimal_schema()))
        .await
        .unwrap();

    let outcome = engine
        .service()
        .update(
            &ctx,
            graph.id,
            UpdateGraphInput {
                current_version: "1.0.0".parse().unwrap(),
                name: Some("renamed".into()),
                description: Some("a description".into()),
                schema: None,
            },
        )
        .await
        .unwrap();

    // No revision, no version bump.
    assert!(outcome.revision.is_none());
    assert_eq!(outcome.graph.name, "renamed");
    assert_eq!(outcome.graph.version.to_string(), "1.0.0");
    assert_eq!(outcome.graph.target_version.to_string(), "1.0.0");

    // A stale current_version is rejected outright.
    let err = engine
        .service()
        .update(
            &ctx,
            graph.id,
            UpdateGraphInput {
                current_version: "0.9.0".parse().unwrap(),
                name: Some("again".into()),
                description: None,
                schema: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "VERSION_CONFLICT");

    engine.shutdown().await;
}

// ============================================================================
// S4 — destroy while an execution is in progress
// ============================================================================

#[tokio::test]
async fn destroy_while_execution_in_progress() {
    let engine = engine();
    let ctx = ctx();

    let graph = engine
        .service()
        .create(&ctx, create_input(runtime_schema()))
        .await
        .unwrap();
    engine.service().run(&ctx, graph.id).await.unwrap();

    let result = engine
        .service()
        .execute_trigger(
            &ctx,
            graph.id,
            "trigger-1",
            ExecuteTriggerInput {
                messages: vec![Message::human(
                    "Run this command: sleep 100 && echo interrupt me",
                )],
                thread_sub_id: Some("s1".into()),
                async_run: true,
            },
        )
        .await
        .unwrap();
    assert!(result.output.is_none());
    let thread_id = result.external_thread_id.clone();
    assert_eq!(thread_id, format!("{}:s1", graph.id));
    assert_eq!(result.checkpoint_ns, format!("{}:agent-1", thread_id));

    // The run reaches the agent and the thread reports running.
    wait_until!("thread running", {
        let nodes = engine
            .service()
            .get_compiled_nodes(
                &ctx,
                graph.id,
                StateScope { thread_id: Some(thread_id.clone()), run_id: None },
            )
            .await
            .unwrap();
        nodes
            .iter()
            .any(|n| n.thread_statuses.get(&thread_id) == Some(&ThreadStatus::Running))
    });

    let stopped = engine.service().destroy(&ctx, graph.id).await.unwrap();
    assert_eq!(stopped.status, GraphStatus::Stopped);
    assert!(stopped.error.is_none());

    wait_until!("thread stopped", {
        engine
            .ctx()
            .threads
            .get_by_external_id(&thread_id)
            .await
            .unwrap()
            .map(|t| t.status == ThreadStatus::Stopped)
            .unwrap_or(false)
    });

    let messages = engine
        .service()
        .get_thread_messages(&ctx, &thread_id, None, None)
        .await
        .unwrap();
    let markers: Vec<_> = messages
        .iter()
        .filter(|m| {
            m.role == MessageRole::System
                && m.content
                    .contains("Graph execution was stopped for agent Test Agent")
        })
        .collect();
    assert_eq!(markers.len(), 1, "exactly one stop marker per thread");

    engine.shutdown().await;
}

// ============================================================================
// S5 — concurrent executions on distinct threads
// ============================================================================

#[tokio::test]
async fn concurrent_executions_then_destroy() {
    let engine = engine();
    let ctx = ctx();

    let graph = engine
        .service()
        .create(&ctx, create_input(runtime_schema()))
        .await
        .unwrap();
    engine.service().run(&ctx, graph.id).await.unwrap();

    for sub in ["a", "b"] {
        engine
            .service()
            .execute_trigger(
                &ctx,
                graph.id,
                "trigger-1",
                ExecuteTriggerInput {
                    messages: vec![Message::human("Run this command: sleep 50")],
                    thread_sub_id: Some(sub.into()),
                    async_run: true,
                },
            )
            .await
            .unwrap();
    }

    wait_until!("both threads running", {
        let nodes = engine
            .service()
            .get_compiled_nodes(&ctx, graph.id, StateScope::default())
            .await
            .unwrap();
        nodes
            .iter()
            .find(|n| n.node_id == "agent-1")
            .map(|n| n.thread_statuses.len() == 2)
            .unwrap_or(false)
    });

    engine.service().destroy(&ctx, graph.id).await.unwrap();

    for sub in ["a", "b"] {
        let external = format!("{}:{}", graph.id, sub);
        let thread = engine
            .ctx()
            .threads
            .get_by_external_id(&external)
            .await
            .unwrap()
            .unwrap();
        assert!(
            matches!(thread.status, ThreadStatus::Stopped | ThreadStatus::NeedMoreInfo),
            "unexpected final status {:?} for {}",
            thread.status,
            external
        );
    }

    engine.shutdown().await;
}

// ============================================================================
// S6 — destroy without activity
// ============================================================================

#[tokio::test]
async fn destroy_without_activity() {
    let engine = engine();
    let ctx = ctx();

    let graph = engine
        .service()
        .create(&ctx, create_input(minimal_schema()))
        .await
        .unwrap();
    engine.service().run(&ctx, graph.id).await.unwrap();

    let mut notifications = engine.notifications();
    let stopped = engine.service().destroy(&ctx, graph.id).await.unwrap();
    assert_eq!(stopped.status, GraphStatus::Stopped);
    assert!(engine.ctx().registry.get(graph.id).is_none());

    while let Ok(n) = notifications.try_recv() {
        assert!(
            !matches!(n, Notification::ThreadUpdate { .. }),
            "no ThreadUpdate may be emitted for an idle destroy"
        );
    }

    engine.shutdown().await;
}

// ============================================================================
// Trigger execution semantics
// ============================================================================

#[tokio::test]
async fn synchronous_trigger_returns_run_output() {
    let engine = engine();
    let ctx = ctx();

    let graph = engine
        .service()
        .create(&ctx, create_input(minimal_schema()))
        .await
        .unwrap();
    engine.service().run(&ctx, graph.id).await.unwrap();

    let result = engine
        .service()
        .execute_trigger(
            &ctx,
            graph.id,
            "trigger-1",
            ExecuteTriggerInput {
                messages: vec![Message::human("hello")],
                thread_sub_id: Some("chat".into()),
                async_run: false,
            },
        )
        .await
        .unwrap();

    let output = result.output.expect("synchronous run returns output");
    assert!(!output.needs_more_info);
    assert!(output.messages.iter().any(|m| m.is_ai() && m.content == "ok"));

    // The thread settles as done and its messages are persisted.
    wait_until!("thread done", {
        engine
            .ctx()
            .threads
            .get_by_external_id(&result.external_thread_id)
            .await
            .unwrap()
            .map(|t| t.status == ThreadStatus::Done)
            .unwrap_or(false)
    });
    let messages = engine
        .service()
        .get_thread_messages(&ctx, &result.external_thread_id, None, None)
        .await
        .unwrap();
    assert!(messages.iter().any(|m| m.content == "hello"));
    assert!(messages.iter().any(|m| m.content == "ok"));

    engine.shutdown().await;
}

#[tokio::test]
async fn execute_trigger_error_taxonomy() {
    let engine = engine();
    let ctx = ctx();

    let graph = engine
        .service()
        .create(&ctx, create_input(minimal_schema()))
        .await
        .unwrap();

    let input = || ExecuteTriggerInput {
        messages: vec![Message::human("x")],
        thread_sub_id: None,
        async_run: false,
    };

    // Not running yet.
    let err = engine
        .service()
        .execute_trigger(&ctx, graph.id, "trigger-1", input())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "GRAPH_NOT_RUNNING");

    engine.service().run(&ctx, graph.id).await.unwrap();

    let err = engine
        .service()
        .execute_trigger(&ctx, graph.id, "missing-node", input())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NODE_NOT_FOUND");
    assert_eq!(err.status(), 404);

    let err = engine
        .service()
        .execute_trigger(&ctx, graph.id, "agent-1", input())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NODE_NOT_TRIGGER");

    let err = engine
        .service()
        .execute_trigger(&ctx, Uuid::new_v4(), "trigger-1", input())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "GRAPH_NOT_FOUND");

    engine.shutdown().await;
}

// ============================================================================
// Lifecycle extras: principal scoping, init cleanup
// ============================================================================

#[tokio::test]
async fn graphs_are_scoped_to_their_principal() {
    let engine = engine();
    let alice = RequestCtx::new("alice");
    let bob = RequestCtx::new("bob");

    let graph = engine
        .service()
        .create(&alice, create_input(minimal_schema()))
        .await
        .unwrap();

    let err = engine.service().find_by_id(&bob, graph.id).await.unwrap_err();
    assert_eq!(err.kind(), "GRAPH_NOT_FOUND");
    assert!(engine.service().get_all(&bob).await.unwrap().is_empty());
    assert_eq!(engine.service().get_all(&alice).await.unwrap().len(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn init_cleans_temporary_graphs_and_stale_statuses() {
    let engine = engine();
    let ctx = ctx();

    let mut temp_input = create_input(minimal_schema());
    temp_input.temporary = true;
    let temp = engine.service().create(&ctx, temp_input).await.unwrap();

    let durable = engine
        .service()
        .create(&ctx, create_input(minimal_schema()))
        .await
        .unwrap();
    // Simulate a crash: persisted Running with no live instance.
    engine
        .ctx()
        .graphs
        .update_by_id(
            durable.id,
            agentry_engine::GraphPatch::status(GraphStatus::Running),
        )
        .await
        .unwrap();

    engine.init().await.unwrap();

    let err = engine.service().find_by_id(&ctx, temp.id).await.unwrap_err();
    assert_eq!(err.kind(), "GRAPH_NOT_FOUND");

    let durable = engine.service().find_by_id(&ctx, durable.id).await.unwrap();
    assert_eq!(durable.status, GraphStatus::Stopped);

    engine.shutdown().await;
}
