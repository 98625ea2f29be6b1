//! Conversation messages.
//!
//! Messages are the unit of exchange between triggers, agents, tools and the
//! invocation backend. Every message carries a stable id assigned at
//! construction; ids are what the engine uses to compute *set-difference*
//! deltas when an agent node replaces its message list (summarization inserts
//! a summary marker mid-list, so suffix-by-length comparison would miss it).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Role of a message within a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageRole {
    /// Engine- or operator-authored instruction
    System,
    /// End-user input
    Human,
    /// Model output
    Ai,
    /// Result of a tool call
    Tool,
    /// Result of a shell-style tool call (structured exec outcome)
    ToolShell,
    /// Accumulated model reasoning
    Reasoning,
}

/// One tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id, echoed back in the tool result
    pub id: String,
    /// Tool name
    pub name: String,
    /// JSON arguments
    pub args: Value,
}

impl ToolCall {
    /// Create a tool call
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self { id: id.into(), name: name.into(), args }
    }
}

/// A single message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Stable identity, assigned at construction
    pub id: String,
    /// Role
    pub role: MessageRole,
    /// Text content
    pub content: String,
    /// Optional author name (e.g. the agent's display name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Tool calls requested by an AI message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For tool results, the call id being answered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Free-form metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Message {
    /// Create a message with a fresh id
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            name: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            metadata: None,
        }
    }

    /// System message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Human message
    pub fn human(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Human, content)
    }

    /// AI message
    pub fn ai(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Ai, content)
    }

    /// Tool result message answering `tool_call_id`
    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageRole::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// Shell tool result message answering `tool_call_id`
    pub fn tool_shell(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageRole::ToolShell, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// Reasoning message
    pub fn reasoning(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Reasoning, content)
    }

    /// Override the id (used when restoring from checkpoints)
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach an author name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attach tool calls
    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    /// Attach metadata
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// True for AI messages
    pub fn is_ai(&self) -> bool {
        self.role == MessageRole::Ai
    }

    /// True when this message requests at least one tool call
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Messages present in `after` but not in `before`, by id.
///
/// This is the delta rule for replace-mode message updates: identity, not
/// position, decides novelty, so markers spliced into the middle of the list
/// are surfaced exactly once and unchanged messages never re-emit.
pub fn added_messages(before: &[Message], after: &[Message]) -> Vec<Message> {
    let seen: std::collections::HashSet<&str> = before.iter().map(|m| m.id.as_str()).collect();
    after
        .iter()
        .filter(|m| !seen.contains(m.id.as_str()))
        .cloned()
        .collect()
}
