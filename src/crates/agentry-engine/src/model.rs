//! Persisted engine records: graphs, threads, revisions.

use agentry_graph::{GraphConfig, GraphSchema, GraphStatus, GraphVersion, ThreadStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use uuid::Uuid;

/// Authenticated principal scoping every service call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestCtx {
    /// Principal id recorded as `created_by`
    pub user_id: String,
}

impl RequestCtx {
    /// Create a context for a principal
    pub fn new(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into() }
    }
}

/// A persisted graph definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Graph {
    /// Graph id
    pub id: Uuid,
    /// Owning principal
    pub created_by: String,
    /// Display name
    pub name: String,
    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Currently applied schema version
    pub version: GraphVersion,
    /// Head version including any queued revision (`>= version`)
    pub target_version: GraphVersion,
    /// Persisted runtime status
    pub status: GraphStatus,
    /// The node/edge definition
    pub schema: GraphSchema,
    /// Eligible for cleanup on engine restart
    #[serde(default)]
    pub temporary: bool,
    /// Last terminal error text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
    /// Soft-delete timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Graph {
    /// Create a new graph record at version 1.0.0, status Created
    pub fn new(ctx: &RequestCtx, input: CreateGraphInput) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            created_by: ctx.user_id.clone(),
            name: input.name,
            description: input.description,
            version: GraphVersion::INITIAL,
            target_version: GraphVersion::INITIAL,
            status: GraphStatus::Created,
            schema: input.schema,
            temporary: input.temporary,
            error: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// The editable surface of this graph
    pub fn config(&self) -> GraphConfig {
        GraphConfig {
            name: self.name.clone(),
            description: self.description.clone(),
            schema: self.schema.clone(),
        }
    }
}

/// Input for `GraphService::create`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGraphInput {
    /// Display name
    pub name: String,
    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Node/edge definition
    pub schema: GraphSchema,
    /// Cleanup on restart
    #[serde(default)]
    pub temporary: bool,
}

/// Input for `GraphService::update`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateGraphInput {
    /// Version the caller computed this edit against
    pub current_version: GraphVersion,
    /// New display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// New description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// New schema; presence makes the update a queued revision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<GraphSchema>,
}

/// Partial update applied by a [`GraphStore`](crate::store::GraphStore)
#[derive(Debug, Clone, Default)]
pub struct GraphPatch {
    /// New name
    pub name: Option<String>,
    /// New description (`Some(None)` clears it)
    pub description: Option<Option<String>>,
    /// New applied version
    pub version: Option<GraphVersion>,
    /// New target version
    pub target_version: Option<GraphVersion>,
    /// New status
    pub status: Option<GraphStatus>,
    /// New schema
    pub schema: Option<GraphSchema>,
    /// New error text (`Some(None)` clears it)
    pub error: Option<Option<String>>,
}

impl GraphPatch {
    /// Patch only the status
    pub fn status(status: GraphStatus) -> Self {
        Self { status: Some(status), ..Default::default() }
    }

    /// Patch status and error together
    pub fn status_with_error(status: GraphStatus, error: Option<String>) -> Self {
        Self { status: Some(status), error: Some(error), ..Default::default() }
    }
}

/// A persisted conversation thread
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    /// Internal id
    pub internal_id: Uuid,
    /// External id (`"{graph_id}:{sub_id}"`)
    pub external_id: String,
    /// Owning graph
    pub graph_id: Uuid,
    /// Current status
    pub status: ThreadStatus,
    /// Owning principal
    pub created_by: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
    /// Soft-delete timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Thread {
    /// Create a running thread record
    pub fn new(graph_id: Uuid, external_id: impl Into<String>, created_by: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            internal_id: Uuid::new_v4(),
            external_id: external_id.into(),
            graph_id,
            status: ThreadStatus::Running,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// Status of a queued revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionStatus {
    /// Queued, waiting for the worker
    Pending,
    /// Claimed by the worker
    Applying,
    /// Applied; `to_version` became the graph's version
    Applied,
    /// Apply failed; `target_version` was rewound
    Failed,
    /// Rejected at enqueue time
    Conflict,
}

/// A queued schema edit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    /// Revision id
    pub id: Uuid,
    /// Graph being edited
    pub graph_id: Uuid,
    /// Version the edit was computed against
    pub base_version: GraphVersion,
    /// Version the edit produces
    pub to_version: GraphVersion,
    /// Lifecycle status
    pub status: RevisionStatus,
    /// Desired post-apply state
    pub new_config: GraphConfig,
    /// Structural diff against the applied config
    pub config_diff: Value,
    /// Principal that queued the edit
    pub created_by: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

/// Structural diff between two graph configs.
///
/// Node changes are keyed by node id; a node whose template or config
/// changed counts as changed.
pub fn config_diff(old: &GraphConfig, new: &GraphConfig) -> Value {
    let old_ids: HashSet<&str> = old.schema.nodes.iter().map(|n| n.id.as_str()).collect();
    let new_ids: HashSet<&str> = new.schema.nodes.iter().map(|n| n.id.as_str()).collect();

    let mut added_nodes: Vec<&str> = new_ids.difference(&old_ids).copied().collect();
    added_nodes.sort_unstable();
    let mut removed_nodes: Vec<&str> = old_ids.difference(&new_ids).copied().collect();
    removed_nodes.sort_unstable();
    let changed_nodes: Vec<&str> = new
        .schema
        .nodes
        .iter()
        .filter(|n| {
            old.schema
                .node(&n.id)
                .map(|o| o.template != n.template || o.config != n.config)
                .unwrap_or(false)
        })
        .map(|n| n.id.as_str())
        .collect();

    let old_edges: HashSet<(&str, &str)> = old
        .schema
        .edges
        .iter()
        .map(|e| (e.from.as_str(), e.to.as_str()))
        .collect();
    let new_edges: HashSet<(&str, &str)> = new
        .schema
        .edges
        .iter()
        .map(|e| (e.from.as_str(), e.to.as_str()))
        .collect();

    let added_edges: Vec<Value> = new_edges
        .difference(&old_edges)
        .map(|(f, t)| json!({"from": f, "to": t}))
        .collect();
    let removed_edges: Vec<Value> = old_edges
        .difference(&new_edges)
        .map(|(f, t)| json!({"from": f, "to": t}))
        .collect();

    json!({
        "nameChanged": old.name != new.name,
        "descriptionChanged": old.description != new.description,
        "addedNodes": added_nodes,
        "removedNodes": removed_nodes,
        "changedNodes": changed_nodes,
        "addedEdges": added_edges,
        "removedEdges": removed_edges,
    })
}
