//! The invocation backend contract.
//!
//! agentry is an orchestration engine, not an LLM client: the engine defines
//! this provider-agnostic trait and concrete providers implement it outside
//! the engine. A backend call produces a stream of [`InvocationChunk`]s so
//! adapters can surface fine-grained deltas (content, reasoning fragments)
//! and coarse usage updates as they arrive. Backpressure is the backend's
//! responsibility; the engine never buffers unboundedly.

use crate::error::Result;
use crate::llm::usage::TokenUsage;
use crate::messages::{Message, ToolCall};
use async_trait::async_trait;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// A tool surfaced to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name
    pub name: String,
    /// What the tool does, for the model
    pub description: String,
    /// JSON Schema of the arguments
    pub parameters: Value,
}

/// How the model is steered toward tool use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// Model decides
    Auto,
    /// Model must call some tool
    Required,
    /// Model must call this specific tool
    Tool(String),
}

/// Reasoning effort requested from thinking models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    /// Minimal reasoning
    Low,
    /// Default reasoning
    Medium,
    /// Extended reasoning
    High,
}

/// One backend call
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    /// Model identifier
    pub model: String,
    /// Conversation history
    pub messages: Vec<Message>,
    /// System prompt, prepended by the backend
    pub system_prompt: Option<String>,
    /// Tools available to the model
    pub tools: Vec<ToolDefinition>,
    /// Tool-choice steering
    pub tool_choice: Option<ToolChoice>,
    /// Whether multiple tool calls per turn are allowed
    pub parallel_tool_calls: bool,
    /// Reasoning effort, for models that support it
    pub reasoning: Option<ReasoningEffort>,
    /// Whether the caller wants incremental chunks
    pub streaming: bool,
}

impl InvocationRequest {
    /// Create a request with defaults for the optional fields
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            system_prompt: None,
            tools: Vec::new(),
            tool_choice: None,
            parallel_tool_calls: false,
            reasoning: None,
            streaming: true,
        }
    }

    /// Attach a system prompt
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Attach tools
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Attach a tool choice
    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }
}

/// A reasoning fragment. Providers may vary the chunk id across fragments of
/// what ends up as one logical reasoning message; consumers keep a single
/// entry and migrate accumulated content when the id changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningDelta {
    /// Provider chunk identifier
    pub id: String,
    /// Reasoning text fragment
    pub content: String,
}

/// Incremental AI output within one invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiDelta {
    /// Content fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Reasoning fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningDelta>,
    /// Completed tool calls
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

/// One element of the invocation stream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvocationChunk {
    /// AI output delta
    #[serde(default)]
    pub delta: AiDelta,
    /// Usage report; typically present on the final chunk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl InvocationChunk {
    /// Chunk carrying a content fragment
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            delta: AiDelta { content: Some(text.into()), ..Default::default() },
            usage: None,
        }
    }

    /// Chunk carrying completed tool calls
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            delta: AiDelta { tool_calls: calls, ..Default::default() },
            usage: None,
        }
    }

    /// Chunk carrying a reasoning fragment
    pub fn reasoning(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            delta: AiDelta {
                reasoning: Some(ReasoningDelta { id: id.into(), content: content.into() }),
                ..Default::default()
            },
            usage: None,
        }
    }

    /// Final chunk carrying only usage
    pub fn usage(usage: TokenUsage) -> Self {
        Self { delta: AiDelta::default(), usage: Some(usage) }
    }
}

/// Stream of invocation chunks
pub type InvocationStream = Pin<Box<dyn Stream<Item = Result<InvocationChunk>> + Send>>;

/// Provider-agnostic LLM backend.
///
/// Implementations must be `Send + Sync`; share across nodes with
/// `Arc<dyn InvocationBackend>`. The `abort` token is cancelled when the run
/// is stopped; implementations should terminate the stream promptly.
#[async_trait]
pub trait InvocationBackend: Send + Sync {
    /// Invoke the model, streaming chunks until completion or abort
    async fn invoke(
        &self,
        request: InvocationRequest,
        abort: CancellationToken,
    ) -> Result<InvocationStream>;

    /// Whether this model is served through a responses-style API
    fn supports_responses_api(&self, _model: &str) -> bool {
        false
    }

    /// Whether this model emits reasoning chunks
    fn supports_reasoning(&self, _model: &str) -> bool {
        false
    }

    /// Whether this model can return several tool calls per turn
    fn supports_parallel_tool_calls(&self, _model: &str) -> bool {
        true
    }

    /// Whether this model streams incrementally
    fn supports_streaming(&self, _model: &str) -> bool {
        true
    }
}
