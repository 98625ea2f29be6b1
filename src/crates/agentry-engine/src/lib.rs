//! # agentry-engine
//!
//! The engine facade for agentry: persisted graph/thread/revision models,
//! storage contracts with in-memory reference implementations, the revision
//! engine and its background worker, the [`GraphService`] facade, engine
//! lifecycle (`init`/`shutdown`), and the built-in `manual-trigger` and
//! `simple-agent` templates.
//!
//! ```rust,ignore
//! let engine = Engine::new(EngineOptions::in_memory(backend));
//! engine.init().await?;
//!
//! let ctx = RequestCtx::new("user-1");
//! let graph = engine.service().create(&ctx, input).await?;
//! engine.service().run(&ctx, graph.id).await?;
//! let result = engine
//!     .service()
//!     .execute_trigger(&ctx, graph.id, "trigger-1", trigger_input)
//!     .await?;
//! ```

pub mod context;
pub mod engine;
pub mod model;
pub mod revision;
pub mod service;
pub mod store;
pub mod templates;

pub use context::EngineCtx;
pub use engine::{Engine, EngineOptions};
pub use model::{
    config_diff, CreateGraphInput, Graph, GraphPatch, RequestCtx, Revision, RevisionStatus,
    Thread, UpdateGraphInput,
};
pub use revision::RevisionEngine;
pub use service::{ExecuteTriggerInput, ExecuteTriggerOutput, GraphService, UpdateOutcome};
pub use store::memory::{InMemoryGraphStore, InMemoryRevisionStore, InMemoryThreadStore};
pub use store::{GraphStore, RevisionStore, ThreadStore};
pub use templates::{
    ManualTriggerTemplate, SimpleAgentTemplate, MANUAL_TRIGGER_TEMPLATE, SIMPLE_AGENT_TEMPLATE,
};
