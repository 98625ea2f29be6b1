//! LLM integration layer: the [`InvocationBackend`] contract and its
//! streaming chunk/usage model.

pub mod backend;
pub mod usage;

pub use backend::{
    AiDelta, InvocationBackend, InvocationChunk, InvocationRequest, InvocationStream,
    ReasoningDelta, ReasoningEffort, ToolChoice, ToolDefinition,
};
pub use usage::{TokenUsage, UsageSnapshot};
