//! # agentry-agent
//!
//! The agent execution core: a per-thread reasoning state machine
//! (summarize → invoke LLM → tools → guard → inject) with checkpoint-backed
//! resumability, concurrent per-thread runs, mid-run message injection,
//! cooperative cancellation and deterministic stopped accounting.
//!
//! [`AgentCore`] implements [`agentry_graph::AgentNode`]; graphs address it
//! through the registry, triggers invoke it, and its event stream feeds the
//! graph state manager.

pub mod config;
pub mod core;
pub mod finish;
pub mod runs;
pub mod turn;

pub use config::{AgentConfig, InjectMode, ModelPrice};
pub use core::AgentCore;
pub use finish::{finish_tool_definition, stop_marker, FINISH_TOOL};
pub use runs::{ActiveRuns, RunEntry};
pub use turn::{ReasoningAccumulator, TurnState};
