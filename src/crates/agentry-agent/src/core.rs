//! AgentCore: one agent's reasoning loop over its threads.
//!
//! The control flow is the declarative state graph `summarize →
//! invoke_llm → tools → tool_usage_guard / inject_pending`, realized as a
//! loop dispatching over step labels:
//!
//! - `summarize → invoke_llm` always.
//! - `invoke_llm → tools` when the AI message carries tool calls, else
//!   `invoke_llm → tool_usage_guard`.
//! - `tool_usage_guard → invoke_llm` while the guard still activates, else
//!   terminal.
//! - `tools → inject_pending` when finish was called and pending messages
//!   exist, or when pending messages exist under `InjectMode::AfterToolCall`.
//! - `tools → summarize` when finish was not called and no injection is due.
//! - `tools → terminal` when finish was called and nothing is pending.
//! - `inject_pending → summarize`.
//!
//! Iterations are bounded by `max_iterations`; exceeding the bound surfaces
//! as a recoverable run error. Runs are checkpointed after every tool round
//! and on termination, keyed by `(thread_id, checkpoint_ns)`.

use crate::config::{AgentConfig, InjectMode};
use crate::finish::{finish_tool_definition, guard_message, needs_more_info, stop_marker, FINISH_TOOL};
use crate::runs::{ActiveRuns, RunEntry};
use crate::turn::{estimate_tokens, ReasoningAccumulator, TurnState};
use agentry_checkpoint::{CheckpointKey, CheckpointStore};
use agentry_graph::{
    added_messages, AgentEvent, AgentNode, AgentRunOutput, EngineError, ExecOutcome,
    InvocationBackend, InvocationRequest, McpNode, Message, ReasoningEffort, Result,
    RunnableConfig, ToolCall, ToolChoice, ToolDefinition, ToolNode, UsageSnapshot,
    EVENT_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

const SUMMARIZE_PROMPT: &str =
    "Summarize the conversation below for your own future reference. Keep every \
     fact, decision, open question and tool result that later turns may need. \
     Respond with the summary only.";

/// Step labels of the internal state graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Summarize,
    InvokeLlm,
    Tools,
    ToolUsageGuard,
    InjectPending,
}

/// What one LLM invocation produced
struct Invocation {
    content: String,
    tool_calls: Vec<ToolCall>,
    reasoning: Option<String>,
}

/// One agent's reasoning engine.
///
/// Owns the active-run table, the event stream, and the checkpoint wiring.
/// Implements [`AgentNode`] so triggers and the engine address it through
/// the registry.
pub struct AgentCore {
    graph_id: Uuid,
    node_id: String,
    config: RwLock<AgentConfig>,
    backend: Arc<dyn InvocationBackend>,
    checkpoints: Arc<dyn CheckpointStore>,
    tools: RwLock<Vec<Arc<dyn ToolNode>>>,
    mcp_services: RwLock<Vec<Arc<dyn McpNode>>>,
    events: broadcast::Sender<AgentEvent>,
    runs: ActiveRuns,
}

impl AgentCore {
    /// Create an agent core
    pub fn new(
        graph_id: Uuid,
        node_id: impl Into<String>,
        config: AgentConfig,
        backend: Arc<dyn InvocationBackend>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            graph_id,
            node_id: node_id.into(),
            config: RwLock::new(config),
            backend,
            checkpoints,
            tools: RwLock::new(Vec::new()),
            mcp_services: RwLock::new(Vec::new()),
            events,
            runs: ActiveRuns::new(),
        }
    }

    /// Graph this agent belongs to
    pub fn graph_id(&self) -> Uuid {
        self.graph_id
    }

    /// Node id of this agent
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Replace the configuration
    pub fn set_config(&self, config: AgentConfig) {
        *self.config.write() = config;
    }

    /// Replace the static tool set
    pub fn set_tools(&self, tools: Vec<Arc<dyn ToolNode>>) {
        *self.tools.write() = tools;
    }

    /// Replace the MCP services whose tools are merged in per turn
    pub fn set_mcp_services(&self, services: Vec<Arc<dyn McpNode>>) {
        *self.mcp_services.write() = services;
    }

    /// Number of active runs (test and introspection helper)
    pub fn active_run_count(&self) -> usize {
        self.runs.len()
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }

    fn emit_message(&self, entry: &RunEntry, message: Message) {
        self.emit(AgentEvent::Message {
            thread_id: entry.rc.thread_id.clone(),
            run_id: entry.run_id.clone(),
            message,
        });
    }

    fn push_message(&self, entry: &RunEntry, state: &mut TurnState, message: Message) {
        state.messages.push(message.clone());
        self.emit_message(entry, message);
    }

    fn stopped_error(&self, entry: &RunEntry) -> EngineError {
        let reason = entry
            .stop_reason
            .lock()
            .clone()
            .unwrap_or_else(|| stop_marker(&self.display_name()));
        EngineError::Stopped { reason }
    }

    fn check_cancelled(&self, entry: &RunEntry) -> Result<()> {
        if entry.cancel.is_cancelled() {
            Err(self.stopped_error(entry))
        } else {
            Ok(())
        }
    }

    fn display_name(&self) -> String {
        self.config
            .read()
            .name
            .clone()
            .unwrap_or_else(|| self.node_id.clone())
    }

    async fn collect_tools(&self) -> Vec<Arc<dyn ToolNode>> {
        let mut tools = self.tools.read().clone();
        let services = self.mcp_services.read().clone();
        for service in services {
            match service.tools().await {
                Ok(discovered) => tools.extend(discovered),
                Err(e) => warn!(service = service.name(), error = %e, "mcp tool discovery failed"),
            }
        }
        tools
    }

    async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .collect_tools()
            .await
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect();
        defs.push(finish_tool_definition());
        defs
    }

    /// Drive one invocation stream to completion, folding deltas and
    /// absorbing usage into the run's counters (emitting a full snapshot on
    /// every usage report).
    async fn stream_invocation(
        &self,
        entry: &RunEntry,
        state: &mut TurnState,
        request: InvocationRequest,
    ) -> Result<Invocation> {
        let model = request.model.clone();
        let mut stream = self.backend.invoke(request, entry.cancel.clone()).await?;

        let mut content = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut reasoning = ReasoningAccumulator::new();

        while let Some(chunk) = stream.next().await {
            self.check_cancelled(entry)?;
            let chunk = chunk?;
            if let Some(c) = chunk.delta.content {
                content.push_str(&c);
            }
            if let Some(r) = chunk.delta.reasoning {
                reasoning.push(r);
            }
            tool_calls.extend(chunk.delta.tool_calls);

            if let Some(usage) = chunk.usage {
                let price = self.config.read().price_of(&model, &usage);
                let snapshot = {
                    let mut snap = entry.usage.lock();
                    snap.absorb(&usage);
                    snap.total_price += price;
                    *snap
                };
                state.usage = snapshot;
                self.emit(AgentEvent::StateUpdate {
                    thread_id: entry.rc.thread_id.clone(),
                    run_id: entry.run_id.clone(),
                    usage: snapshot,
                });
            }
        }

        Ok(Invocation { content, tool_calls, reasoning: reasoning.take() })
    }

    /// `invoke_llm` step: call the backend with the current history and the
    /// tool set, producing the next AI message.
    async fn invoke_llm(&self, entry: &RunEntry, state: &mut TurnState) -> Result<Message> {
        let (model, instructions) = {
            let config = self.config.read();
            (config.invoke_model_name.clone(), config.instructions.clone())
        };

        let request = InvocationRequest {
            model: model.clone(),
            messages: state.messages.clone(),
            system_prompt: Some(instructions),
            tools: self.tool_definitions().await,
            tool_choice: Some(ToolChoice::Auto),
            parallel_tool_calls: self.backend.supports_parallel_tool_calls(&model),
            reasoning: self
                .backend
                .supports_reasoning(&model)
                .then_some(ReasoningEffort::Medium),
            streaming: self.backend.supports_streaming(&model),
        };

        let invocation = self.stream_invocation(entry, state, request).await?;
        if let Some(reasoning) = invocation.reasoning {
            self.push_message(entry, state, Message::reasoning(reasoning));
        }
        Ok(Message::ai(invocation.content)
            .with_name(self.display_name())
            .with_tool_calls(invocation.tool_calls))
    }

    /// `summarize` step: fold older history into a rolling summary when the
    /// running context exceeds the budget, keeping a recent tail.
    async fn maybe_summarize(&self, entry: &RunEntry, state: &mut TurnState) -> Result<()> {
        let (max_tokens, keep_tokens, model) = {
            let config = self.config.read();
            (
                config.summarize_max_tokens,
                config.summarize_keep_tokens,
                config.summarize_model().to_string(),
            )
        };

        let current = state.usage.current_context.max(estimate_tokens(&state.messages));
        if current <= max_tokens || state.messages.len() < 2 {
            return Ok(());
        }

        // Retain the newest messages within the keep budget; everything
        // before the split gets folded.
        let mut split = state.messages.len();
        let mut budget = keep_tokens;
        while split > 0 {
            let cost = estimate_tokens(&state.messages[split - 1..split]);
            if cost > budget {
                break;
            }
            budget -= cost;
            split -= 1;
        }
        if split >= state.messages.len() {
            split = state.messages.len() - 1;
        }
        if split == 0 {
            return Ok(());
        }

        debug!(
            agent = %self.node_id,
            thread = %entry.rc.thread_id,
            folded = split,
            "summarizing conversation prefix"
        );

        let mut prompt = Vec::new();
        if let Some(previous) = &state.summary {
            prompt.push(Message::system(format!("Previous summary: {}", previous)));
        }
        prompt.extend(state.messages[..split].iter().cloned());

        let request = InvocationRequest::new(model, prompt).with_system_prompt(SUMMARIZE_PROMPT);
        let invocation = self.stream_invocation(entry, state, request).await?;
        let summary = invocation.content;

        let before = state.messages.clone();
        let marker = Message::system(format!("Summary of the conversation so far: {}", summary));
        let tail = state.messages.split_off(split);
        state.messages = std::iter::once(marker).chain(tail).collect();
        state.summary = Some(summary);

        // Replace-mode update: surface inserted markers exactly once via the
        // identity diff, never a length-suffix comparison.
        for message in added_messages(&before, &state.messages) {
            self.emit_message(entry, message);
        }
        Ok(())
    }

    /// `tools` step: execute the AI message's tool calls in order.
    async fn run_tools(
        &self,
        entry: &RunEntry,
        state: &mut TurnState,
        calls: &[ToolCall],
    ) -> Result<()> {
        let tools = self.collect_tools().await;

        for call in calls {
            self.check_cancelled(entry)?;

            if call.name == FINISH_TOOL {
                entry.finish_called.store(true, Ordering::SeqCst);
                entry
                    .needs_more_info
                    .store(needs_more_info(&call.args), Ordering::SeqCst);
                self.push_message(
                    entry,
                    state,
                    Message::tool(json!({"ok": true}).to_string(), &call.id),
                );
                continue;
            }

            let Some(tool) = tools.iter().find(|t| t.name() == call.name) else {
                self.push_message(
                    entry,
                    state,
                    Message::tool(format!("Tool '{}' is not available", call.name), &call.id),
                );
                continue;
            };

            let is_shell = tool.is_shell();
            if is_shell {
                *entry.shell_call.lock() = Some(call.clone());
            }

            let outcome = tokio::select! {
                _ = entry.cancel.cancelled() => {
                    // A stop landed mid-call: shell calls get the
                    // deterministic aborted result before the run winds down.
                    if is_shell {
                        let aborted = serde_json::to_string(&ExecOutcome::aborted())?;
                        self.push_message(entry, state, Message::tool_shell(aborted, &call.id));
                    }
                    entry.shell_call.lock().take();
                    return Err(self.stopped_error(entry));
                }
                result = tool.call(call.args.clone(), &entry.rc) => result,
            };
            entry.shell_call.lock().take();

            let message = match outcome {
                Ok(value) => {
                    let content = match value {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    if is_shell {
                        Message::tool_shell(content, &call.id)
                    } else {
                        Message::tool(content, &call.id)
                    }
                }
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "tool call failed");
                    Message::tool(format!("Tool '{}' failed: {}", call.name, e), &call.id)
                }
            };
            self.push_message(entry, state, message);
        }
        Ok(())
    }

    async fn save_checkpoint(&self, entry: &RunEntry, state: &TurnState) -> Result<()> {
        let key = CheckpointKey::new(&entry.rc.thread_id, &entry.rc.checkpoint_ns);
        self.checkpoints.put(&key, state.snapshot()?).await?;
        Ok(())
    }

    /// The state machine proper.
    async fn execute_run(&self, entry: &Arc<RunEntry>, state: &mut TurnState) -> Result<()> {
        let (max_iterations, guard_max, inject_mode) = {
            let config = self.config.read();
            (config.max_iterations, config.guard_max_retries, config.inject_mode)
        };

        let mut step = Step::Summarize;
        let mut iterations = 0u32;
        let mut guard_used = 0u32;
        let mut last_tool_calls: Vec<ToolCall> = Vec::new();

        loop {
            self.check_cancelled(entry)?;

            match step {
                Step::Summarize => {
                    self.maybe_summarize(entry, state).await?;
                    step = Step::InvokeLlm;
                }
                Step::InvokeLlm => {
                    iterations += 1;
                    if iterations > max_iterations {
                        return Err(EngineError::MaxIterations { limit: max_iterations });
                    }
                    let message = self.invoke_llm(entry, state).await?;
                    let has_calls = message.has_tool_calls();
                    last_tool_calls = message.tool_calls.clone();
                    self.push_message(entry, state, message);
                    step = if has_calls { Step::Tools } else { Step::ToolUsageGuard };
                }
                Step::Tools => {
                    self.run_tools(entry, state, &last_tool_calls).await?;
                    self.save_checkpoint(entry, state).await?;

                    let finish = entry.is_finished();
                    let has_pending = !entry.pending.lock().is_empty();
                    step = match (finish, has_pending) {
                        (true, true) => Step::InjectPending,
                        (false, true) if inject_mode == InjectMode::AfterToolCall => {
                            Step::InjectPending
                        }
                        (false, _) => Step::Summarize,
                        (true, false) => break,
                    };
                }
                Step::ToolUsageGuard => {
                    if guard_used < guard_max {
                        guard_used += 1;
                        self.push_message(entry, state, guard_message());
                        step = Step::InvokeLlm;
                    } else {
                        break;
                    }
                }
                Step::InjectPending => {
                    let pending: Vec<Message> = std::mem::take(&mut *entry.pending.lock());
                    debug!(
                        agent = %self.node_id,
                        thread = %entry.rc.thread_id,
                        count = pending.len(),
                        "injecting pending messages"
                    );
                    for message in pending {
                        self.push_message(entry, state, message);
                    }
                    step = Step::Summarize;
                }
            }
        }

        self.save_checkpoint(entry, state).await?;
        Ok(())
    }

    async fn run_inner(
        &self,
        entry: &Arc<RunEntry>,
        incoming: Vec<Message>,
    ) -> Result<AgentRunOutput> {
        let key = CheckpointKey::new(&entry.rc.thread_id, &entry.rc.checkpoint_ns);
        let tuple = self.checkpoints.get_tuple(&key).await?;
        let mut state = TurnState::restore(tuple);
        *entry.usage.lock() = state.usage;

        let baseline: HashSet<String> = state.messages.iter().map(|m| m.id.clone()).collect();
        for message in incoming {
            self.push_message(entry, &mut state, message);
        }

        self.execute_run(entry, &mut state).await?;

        let messages = state
            .messages
            .iter()
            .filter(|m| !baseline.contains(&m.id))
            .cloned()
            .collect();
        Ok(AgentRunOutput {
            messages,
            thread_id: entry.rc.thread_id.clone(),
            checkpoint_ns: entry.rc.checkpoint_ns.clone(),
            needs_more_info: self.final_needs_more_info(entry),
        })
    }

    fn final_needs_more_info(&self, entry: &RunEntry) -> bool {
        if entry.is_finished() {
            entry.needs_more_info.load(Ordering::SeqCst)
        } else {
            // The model never declared the turn complete.
            true
        }
    }

    async fn stop_matching(&self, thread_id: Option<&str>, reason: Option<String>) -> Result<()> {
        let reason = reason.unwrap_or_else(|| stop_marker(&self.display_name()));
        for entry in self.runs.matching(thread_id) {
            if entry.is_finished() {
                continue;
            }
            // Double-stop safe: only the first stop claims the run.
            if entry.stopped.swap(true, Ordering::SeqCst) {
                continue;
            }
            debug!(
                agent = %self.node_id,
                thread = %entry.rc.thread_id,
                run = %entry.run_id,
                "stopping active run"
            );
            *entry.stop_reason.lock() = Some(reason.clone());
            self.emit_message(&entry, Message::system(reason.clone()));
            self.emit(AgentEvent::Stop {
                thread_id: Some(entry.rc.thread_id.clone()),
                reason: reason.clone(),
            });
            entry.cancel.cancel();
            self.runs.remove(&entry.run_id);
        }
        Ok(())
    }
}

#[async_trait]
impl AgentNode for AgentCore {
    fn name(&self) -> String {
        self.display_name()
    }

    fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    async fn run(&self, messages: Vec<Message>, rc: RunnableConfig) -> Result<AgentRunOutput> {
        let entry = self.runs.insert(rc)?;
        debug!(agent = %self.node_id, thread = %entry.rc.thread_id, run = %entry.run_id, "run started");
        self.emit(AgentEvent::Invoke {
            thread_id: entry.rc.thread_id.clone(),
            run_id: entry.run_id.clone(),
        });

        let result = self.run_inner(&entry, messages).await;
        self.runs.remove(&entry.run_id);

        match result {
            Ok(output) => {
                self.emit(AgentEvent::Run {
                    thread_id: entry.rc.thread_id.clone(),
                    run_id: entry.run_id.clone(),
                    error: None,
                    stopped: false,
                    needs_more_info: output.needs_more_info,
                });
                Ok(output)
            }
            Err(e) => {
                let stopped = e.is_stopped() || entry.is_stopped();
                let error_text = if stopped { "stopped".to_string() } else { e.to_string() };
                self.emit(AgentEvent::Run {
                    thread_id: entry.rc.thread_id.clone(),
                    run_id: entry.run_id.clone(),
                    error: Some(error_text),
                    stopped,
                    needs_more_info: self.final_needs_more_info(&entry),
                });
                if stopped {
                    Err(self.stopped_error(&entry))
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn run_or_append(
        &self,
        messages: Vec<Message>,
        rc: RunnableConfig,
    ) -> Result<Option<AgentRunOutput>> {
        if let Some(entry) = self.runs.by_thread(&rc.thread_id) {
            debug!(
                agent = %self.node_id,
                thread = %rc.thread_id,
                count = messages.len(),
                "appending to active run"
            );
            entry.pending.lock().extend(messages);
            return Ok(None);
        }
        match self.run(messages.clone(), rc.clone()).await {
            Ok(output) => Ok(Some(output)),
            // Lost the insert race: another run claimed the thread first.
            Err(EngineError::ThreadBusy(_)) => {
                if let Some(entry) = self.runs.by_thread(&rc.thread_id) {
                    entry.pending.lock().extend(messages);
                    Ok(None)
                } else {
                    Err(EngineError::ThreadBusy(rc.thread_id))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn stop(&self) -> Result<()> {
        self.stop_matching(None, None).await
    }

    async fn stop_thread(&self, thread_id: &str, reason: Option<String>) -> Result<()> {
        self.stop_matching(Some(thread_id), reason).await
    }

    async fn thread_token_usage(&self, thread_id: &str) -> Result<Option<UsageSnapshot>> {
        if let Some(entry) = self.runs.by_thread(thread_id) {
            return Ok(Some(entry.usage_snapshot()));
        }
        let ns = format!("{}:{}", thread_id, self.node_id);
        let tuple = self
            .checkpoints
            .get_tuple(&CheckpointKey::new(thread_id, ns))
            .await?;
        Ok(tuple.map(|t| TurnState::restore(Some(t)).usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentry_checkpoint::InMemoryCheckpointStore;
    use agentry_graph::{InvocationChunk, InvocationStream, MessageRole, TokenUsage};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio_util::sync::CancellationToken;

    /// Backend replaying a scripted sequence of responses; blocks forever
    /// (until cancelled) once the script is exhausted.
    struct ScriptedBackend {
        script: Mutex<VecDeque<Vec<InvocationChunk>>>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Vec<InvocationChunk>>) -> Arc<Self> {
            Arc::new(Self { script: Mutex::new(script.into_iter().collect()) })
        }
    }

    #[async_trait]
    impl InvocationBackend for ScriptedBackend {
        async fn invoke(
            &self,
            _request: InvocationRequest,
            abort: CancellationToken,
        ) -> Result<InvocationStream> {
            let next = self.script.lock().pop_front();
            match next {
                Some(chunks) => {
                    let items: Vec<Result<InvocationChunk>> = chunks.into_iter().map(Ok).collect();
                    Ok(Box::pin(futures::stream::iter(items)))
                }
                None => {
                    // Script exhausted: hang until the run is cancelled.
                    abort.cancelled().await;
                    Err(EngineError::Stopped { reason: "aborted".into() })
                }
            }
        }
    }

    fn finish_call() -> InvocationChunk {
        InvocationChunk::tool_calls(vec![ToolCall::new("call-finish", FINISH_TOOL, json!({}))])
    }

    fn usage(input: u64, output: u64) -> InvocationChunk {
        InvocationChunk::usage(TokenUsage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
            ..Default::default()
        })
    }

    fn agent(backend: Arc<dyn InvocationBackend>) -> AgentCore {
        let mut config = AgentConfig::new("be useful", "test-model");
        config.name = Some("Test Agent".into());
        AgentCore::new(
            Uuid::new_v4(),
            "agent-1",
            config,
            backend,
            Arc::new(InMemoryCheckpointStore::new()),
        )
    }

    fn rc_for(core: &AgentCore, sub: &str) -> RunnableConfig {
        let thread = format!("{}:{}", core.graph_id(), sub);
        let ns = format!("{}:{}", thread, core.node_id());
        RunnableConfig::for_run(core.graph_id(), core.node_id().to_string(), thread, ns)
    }

    #[tokio::test]
    async fn run_completes_on_finish_tool() {
        let backend = ScriptedBackend::new(vec![vec![
            InvocationChunk::content("done"),
            finish_call(),
            usage(10, 5),
        ]]);
        let core = agent(backend);

        let output = core
            .run(vec![Message::human("hi")], rc_for(&core, "s1"))
            .await
            .unwrap();

        assert!(!output.needs_more_info);
        assert!(output.messages.iter().any(|m| m.is_ai()));
        assert!(output
            .messages
            .iter()
            .any(|m| m.role == MessageRole::Tool && m.tool_call_id.as_deref() == Some("call-finish")));
        assert_eq!(core.active_run_count(), 0);
    }

    #[tokio::test]
    async fn state_update_carries_full_snapshot_across_runs() {
        let backend = ScriptedBackend::new(vec![
            vec![finish_call(), usage(100, 50)],
            vec![finish_call(), usage(200, 25)],
        ]);
        let core = agent(backend);
        let mut events = core.subscribe();

        core.run(vec![Message::human("one")], rc_for(&core, "s1")).await.unwrap();
        core.run(vec![Message::human("two")], rc_for(&core, "s1")).await.unwrap();

        let mut snapshots = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if let AgentEvent::StateUpdate { usage, .. } = ev {
                snapshots.push(usage);
            }
        }
        // Counters restored from the checkpoint: the second run's snapshot
        // includes the first run's tokens.
        let last = snapshots.last().unwrap();
        assert_eq!(last.input_tokens, 300);
        assert_eq!(last.output_tokens, 75);
        assert_eq!(last.total_tokens, 375);
        assert_eq!(last.current_context, 200);

        let persisted = core
            .thread_token_usage(&format!("{}:s1", core.graph_id()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.total_tokens, 375);
    }

    #[tokio::test]
    async fn busy_thread_rejects_second_run_and_append_queues() {
        // Empty script: the first run hangs on the backend until stopped.
        let backend = ScriptedBackend::new(vec![]);
        let core = Arc::new(agent(backend));

        let runner = core.clone();
        let rc = rc_for(&core, "s1");
        let handle = tokio::spawn(async move { runner.run(vec![Message::human("go")], rc).await });

        // Wait for the run to register.
        while core.active_run_count() == 0 {
            tokio::task::yield_now().await;
        }

        let err = core
            .run(vec![Message::human("again")], rc_for(&core, "s1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "THREAD_BUSY");

        let appended = core
            .run_or_append(vec![Message::human("later")], rc_for(&core, "s1"))
            .await
            .unwrap();
        assert!(appended.is_none());

        core.stop().await.unwrap();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(EngineError::Stopped { .. })));
        assert_eq!(core.active_run_count(), 0);
    }

    #[tokio::test]
    async fn stop_emits_marker_and_stop_event_once() {
        let backend = ScriptedBackend::new(vec![]);
        let core = Arc::new(agent(backend));
        let mut events = core.subscribe();

        let runner = core.clone();
        let rc = rc_for(&core, "s1");
        let handle = tokio::spawn(async move { runner.run(vec![Message::human("go")], rc).await });
        while core.active_run_count() == 0 {
            tokio::task::yield_now().await;
        }

        core.stop().await.unwrap();
        // Double stop emits nothing new.
        core.stop().await.unwrap();
        let _ = handle.await.unwrap();

        let mut markers = 0;
        let mut stop_events = 0;
        let mut stopped_runs = 0;
        while let Ok(ev) = events.try_recv() {
            match ev {
                AgentEvent::Message { message, .. }
                    if message.role == MessageRole::System
                        && message.content.contains("Graph execution was stopped for agent Test Agent") =>
                {
                    markers += 1;
                }
                AgentEvent::Stop { .. } => stop_events += 1,
                AgentEvent::Run { stopped: true, .. } => stopped_runs += 1,
                _ => {}
            }
        }
        assert_eq!(markers, 1, "exactly one stop marker per thread");
        assert_eq!(stop_events, 1);
        assert_eq!(stopped_runs, 1);
    }

    #[tokio::test]
    async fn guard_forces_finish_then_terminates() {
        let backend = ScriptedBackend::new(vec![
            // First response: plain text, no tool calls -> guard activates.
            vec![InvocationChunk::content("all done!"), usage(5, 5)],
            // Second response after the guard message: finish.
            vec![finish_call(), usage(5, 2)],
        ]);
        let core = agent(backend);

        let output = core
            .run(vec![Message::human("hi")], rc_for(&core, "s1"))
            .await
            .unwrap();

        assert!(output
            .messages
            .iter()
            .any(|m| m.role == MessageRole::System && m.content.contains("finish")));
        assert!(!output.needs_more_info);
    }

    #[tokio::test]
    async fn max_iterations_is_a_recoverable_run_error() {
        let loop_call = || {
            vec![InvocationChunk::tool_calls(vec![ToolCall::new(
                "c",
                "missing-tool",
                json!({}),
            )])]
        };
        let backend = ScriptedBackend::new(vec![loop_call(), loop_call(), loop_call()]);
        let core = {
            let mut config = AgentConfig::new("x", "m");
            config.max_iterations = 2;
            AgentCore::new(
                Uuid::new_v4(),
                "agent-1",
                config,
                backend,
                Arc::new(InMemoryCheckpointStore::new()),
            )
        };
        let mut events = core.subscribe();

        let err = core
            .run(vec![Message::human("loop forever")], rc_for(&core, "s1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "MAX_ITERATIONS");

        let mut saw_run_error = false;
        while let Ok(ev) = events.try_recv() {
            if let AgentEvent::Run { error: Some(_), stopped: false, needs_more_info, .. } = ev {
                saw_run_error = true;
                // Finish never called: the thread still needs input.
                assert!(needs_more_info);
            }
        }
        assert!(saw_run_error);
    }

    #[tokio::test]
    async fn summarize_folds_prefix_into_marker() {
        let backend = ScriptedBackend::new(vec![
            // Summarize call output.
            vec![InvocationChunk::content("user asked about X"), usage(50, 10)],
            // Invoke call output.
            vec![finish_call(), usage(10, 2)],
        ]);
        let core = {
            let mut config = AgentConfig::new("x", "m");
            config.summarize_max_tokens = 50;
            config.summarize_keep_tokens = 30;
            AgentCore::new(
                Uuid::new_v4(),
                "agent-1",
                config,
                backend,
                Arc::new(InMemoryCheckpointStore::new()),
            )
        };
        let mut events = core.subscribe();

        let big = "x".repeat(400);
        let output = core
            .run(
                vec![Message::human(big), Message::human("and now?")],
                rc_for(&core, "s1"),
            )
            .await
            .unwrap();

        let marker = output
            .messages
            .iter()
            .find(|m| m.content.starts_with("Summary of the conversation so far:"))
            .expect("summary marker present");
        assert_eq!(marker.role, MessageRole::System);

        // The marker is surfaced exactly once through the event stream.
        let mut marker_events = 0;
        while let Ok(ev) = events.try_recv() {
            if let AgentEvent::Message { message, .. } = ev {
                if message.id == marker.id {
                    marker_events += 1;
                }
            }
        }
        assert_eq!(marker_events, 1);
    }

    #[tokio::test]
    async fn pending_messages_inject_after_finish() {
        // Finish with pending present -> inject -> summarize -> invoke again
        // -> finish for real.
        let backend = ScriptedBackend::new(vec![
            vec![finish_call(), usage(5, 1)],
            vec![InvocationChunk::content("handled the late message"), finish_call(), usage(5, 1)],
        ]);
        let core = Arc::new(agent(backend));

        let rc = rc_for(&core, "s1");
        let thread = rc.thread_id.clone();
        let runner = core.clone();
        let handle = tokio::spawn(async move { runner.run(vec![Message::human("go")], rc).await });

        // Queue a message while the run is active; timing decides whether it
        // lands in the pending queue or misses the run entirely.
        while core.active_run_count() == 0 {
            tokio::task::yield_now().await;
        }
        if let Some(entry) = core.runs.by_thread(&thread) {
            entry.pending.lock().push(Message::human("one more thing"));
        }

        let output = handle.await.unwrap().unwrap();
        if output.messages.iter().any(|m| m.content == "one more thing") {
            // Injected: the follow-up AI answer must also be present.
            assert!(output.messages.iter().any(|m| m.content == "handled the late message"));
        }
    }
}
