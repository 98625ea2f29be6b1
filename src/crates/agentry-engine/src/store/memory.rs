//! In-memory reference stores for development and testing.
//!
//! Thread-safe `Arc<RwLock<HashMap>>` implementations of the store traits.
//! Soft deletes are honored (deleted records become invisible to reads) and
//! message appends deduplicate by message id.

use crate::model::{Graph, GraphPatch, Revision, RevisionStatus, Thread};
use crate::store::{GraphStore, RevisionStore, ThreadStore};
use agentry_graph::{EngineError, Message, Result, ThreadStatus};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// In-memory [`GraphStore`]
#[derive(Clone, Default)]
pub struct InMemoryGraphStore {
    graphs: Arc<RwLock<HashMap<Uuid, Graph>>>,
}

impl InMemoryGraphStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn create(&self, graph: Graph) -> Result<Graph> {
        self.graphs.write().insert(graph.id, graph.clone());
        Ok(graph)
    }

    async fn get_one(&self, id: Uuid, created_by: Option<&str>) -> Result<Option<Graph>> {
        let graphs = self.graphs.read();
        Ok(graphs
            .get(&id)
            .filter(|g| g.deleted_at.is_none())
            .filter(|g| created_by.map_or(true, |user| g.created_by == user))
            .cloned())
    }

    async fn get_all(&self, created_by: Option<&str>) -> Result<Vec<Graph>> {
        let graphs = self.graphs.read();
        let mut all: Vec<Graph> = graphs
            .values()
            .filter(|g| g.deleted_at.is_none())
            .filter(|g| created_by.map_or(true, |user| g.created_by == user))
            .cloned()
            .collect();
        all.sort_by_key(|g| g.created_at);
        Ok(all)
    }

    async fn update_by_id(&self, id: Uuid, patch: GraphPatch) -> Result<Graph> {
        let mut graphs = self.graphs.write();
        let graph = graphs
            .get_mut(&id)
            .filter(|g| g.deleted_at.is_none())
            .ok_or(EngineError::GraphNotFound(id))?;

        if let Some(name) = patch.name {
            graph.name = name;
        }
        if let Some(description) = patch.description {
            graph.description = description;
        }
        if let Some(version) = patch.version {
            graph.version = version;
        }
        if let Some(target_version) = patch.target_version {
            graph.target_version = target_version;
        }
        if let Some(status) = patch.status {
            graph.status = status;
        }
        if let Some(schema) = patch.schema {
            graph.schema = schema;
        }
        if let Some(error) = patch.error {
            graph.error = error;
        }
        graph.updated_at = Utc::now();
        Ok(graph.clone())
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<()> {
        if let Some(graph) = self.graphs.write().get_mut(&id) {
            if graph.deleted_at.is_none() {
                graph.deleted_at = Some(Utc::now());
            }
        }
        Ok(())
    }
}

struct ThreadRecord {
    thread: Thread,
    messages: Vec<Message>,
}

impl ThreadRecord {
    fn new(thread: Thread) -> Self {
        Self { thread, messages: Vec::new() }
    }
}

/// In-memory [`ThreadStore`]
#[derive(Clone, Default)]
pub struct InMemoryThreadStore {
    // keyed by external id
    threads: Arc<RwLock<HashMap<String, ThreadRecord>>>,
}

impl InMemoryThreadStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ThreadStore for InMemoryThreadStore {
    async fn create(&self, thread: Thread) -> Result<Thread> {
        let mut threads = self.threads.write();
        threads
            .entry(thread.external_id.clone())
            .or_insert_with(|| ThreadRecord::new(thread.clone()));
        Ok(thread)
    }

    async fn get_by_external_id(&self, external_id: &str) -> Result<Option<Thread>> {
        let threads = self.threads.read();
        Ok(threads
            .get(external_id)
            .filter(|r| r.thread.deleted_at.is_none())
            .map(|r| r.thread.clone()))
    }

    async fn get_all(&self, graph_id: Uuid, status: Option<ThreadStatus>) -> Result<Vec<Thread>> {
        let threads = self.threads.read();
        let mut all: Vec<Thread> = threads
            .values()
            .filter(|r| r.thread.graph_id == graph_id && r.thread.deleted_at.is_none())
            .filter(|r| status.map_or(true, |s| r.thread.status == s))
            .map(|r| r.thread.clone())
            .collect();
        all.sort_by_key(|t| t.created_at);
        Ok(all)
    }

    async fn update_status(&self, external_id: &str, status: ThreadStatus) -> Result<()> {
        if let Some(record) = self.threads.write().get_mut(external_id) {
            record.thread.status = status;
            record.thread.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn append_message(&self, external_id: &str, message: Message) -> Result<()> {
        let mut threads = self.threads.write();
        let Some(record) = threads.get_mut(external_id) else {
            return Err(EngineError::ThreadNotFound(external_id.to_string()));
        };
        if !record.messages.iter().any(|m| m.id == message.id) {
            record.messages.push(message);
            record.thread.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_messages(
        &self,
        external_id: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Message>> {
        let threads = self.threads.read();
        let Some(record) = threads.get(external_id).filter(|r| r.thread.deleted_at.is_none())
        else {
            return Err(EngineError::ThreadNotFound(external_id.to_string()));
        };
        let offset = offset.unwrap_or(0);
        let limit = limit.unwrap_or(usize::MAX);
        Ok(record.messages.iter().skip(offset).take(limit).cloned().collect())
    }

    async fn delete_for_graph(&self, graph_id: Uuid) -> Result<()> {
        let now = Utc::now();
        for record in self.threads.write().values_mut() {
            if record.thread.graph_id == graph_id && record.thread.deleted_at.is_none() {
                record.thread.deleted_at = Some(now);
            }
        }
        Ok(())
    }
}

/// In-memory [`RevisionStore`]
#[derive(Clone, Default)]
pub struct InMemoryRevisionStore {
    revisions: Arc<RwLock<HashMap<Uuid, Revision>>>,
}

impl InMemoryRevisionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RevisionStore for InMemoryRevisionStore {
    async fn insert(&self, revision: Revision) -> Result<Revision> {
        self.revisions.write().insert(revision.id, revision.clone());
        Ok(revision)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Revision>> {
        Ok(self.revisions.read().get(&id).cloned())
    }

    async fn has_open_revision(&self, graph_id: Uuid) -> Result<bool> {
        Ok(self.revisions.read().values().any(|r| {
            r.graph_id == graph_id
                && matches!(r.status, RevisionStatus::Pending | RevisionStatus::Applying)
        }))
    }

    async fn claim_pending(&self, graph_id: Uuid) -> Result<Option<Revision>> {
        let mut revisions = self.revisions.write();
        let claimed = revisions
            .values_mut()
            .filter(|r| r.graph_id == graph_id && r.status == RevisionStatus::Pending)
            .min_by_key(|r| r.created_at);
        Ok(claimed.map(|r| {
            r.status = RevisionStatus::Applying;
            r.updated_at = Utc::now();
            r.clone()
        }))
    }

    async fn update_status(&self, id: Uuid, status: RevisionStatus) -> Result<()> {
        if let Some(revision) = self.revisions.write().get_mut(&id) {
            revision.status = status;
            revision.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn pending_graphs(&self) -> Result<Vec<Uuid>> {
        let revisions = self.revisions.read();
        let mut graphs: Vec<Uuid> = revisions
            .values()
            .filter(|r| r.status == RevisionStatus::Pending)
            .map(|r| r.graph_id)
            .collect();
        graphs.sort();
        graphs.dedup();
        Ok(graphs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CreateGraphInput, RequestCtx};
    use agentry_graph::{GraphSchema, GraphStatus};

    fn graph(user: &str) -> Graph {
        Graph::new(
            &RequestCtx::new(user),
            CreateGraphInput {
                name: "g".into(),
                description: None,
                schema: GraphSchema::default(),
                temporary: false,
            },
        )
    }

    #[tokio::test]
    async fn graph_reads_are_principal_scoped() {
        let store = InMemoryGraphStore::new();
        let g = store.create(graph("alice")).await.unwrap();

        assert!(store.get_one(g.id, Some("alice")).await.unwrap().is_some());
        assert!(store.get_one(g.id, Some("bob")).await.unwrap().is_none());
        assert!(store.get_one(g.id, None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn soft_deleted_graphs_disappear() {
        let store = InMemoryGraphStore::new();
        let g = store.create(graph("alice")).await.unwrap();

        store.delete_by_id(g.id).await.unwrap();
        assert!(store.get_one(g.id, None).await.unwrap().is_none());
        assert!(store.get_all(None).await.unwrap().is_empty());

        // Updates on a deleted graph report not-found.
        let err = store
            .update_by_id(g.id, GraphPatch::status(GraphStatus::Running))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "GRAPH_NOT_FOUND");
    }

    #[tokio::test]
    async fn message_appends_dedupe_by_id() {
        let store = InMemoryThreadStore::new();
        let graph_id = Uuid::new_v4();
        let external = format!("{}:s1", graph_id);
        store
            .create(Thread::new(graph_id, external.clone(), "alice"))
            .await
            .unwrap();

        let msg = Message::human("hello");
        store.append_message(&external, msg.clone()).await.unwrap();
        store.append_message(&external, msg.clone()).await.unwrap();
        store.append_message(&external, Message::ai("hi")).await.unwrap();

        let messages = store.get_messages(&external, None, None).await.unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn message_paging() {
        let store = InMemoryThreadStore::new();
        let graph_id = Uuid::new_v4();
        let external = format!("{}:s1", graph_id);
        store
            .create(Thread::new(graph_id, external.clone(), "alice"))
            .await
            .unwrap();
        for i in 0..5 {
            store
                .append_message(&external, Message::human(format!("m{}", i)))
                .await
                .unwrap();
        }

        let page = store.get_messages(&external, Some(2), Some(1)).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].content, "m1");
        assert_eq!(page[1].content, "m2");
    }

    #[tokio::test]
    async fn claim_pending_transitions_to_applying() {
        use crate::model::config_diff;
        use agentry_graph::{GraphConfig, GraphVersion};

        let store = InMemoryRevisionStore::new();
        let graph_id = Uuid::new_v4();
        let config = GraphConfig {
            name: "g".into(),
            description: None,
            schema: GraphSchema::default(),
        };
        let revision = Revision {
            id: Uuid::new_v4(),
            graph_id,
            base_version: GraphVersion::INITIAL,
            to_version: GraphVersion::INITIAL.next_patch(),
            status: RevisionStatus::Pending,
            new_config: config.clone(),
            config_diff: config_diff(&config, &config),
            created_by: "alice".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.insert(revision.clone()).await.unwrap();
        assert!(store.has_open_revision(graph_id).await.unwrap());
        assert_eq!(store.pending_graphs().await.unwrap(), vec![graph_id]);

        let claimed = store.claim_pending(graph_id).await.unwrap().unwrap();
        assert_eq!(claimed.id, revision.id);
        assert_eq!(claimed.status, RevisionStatus::Applying);

        // Nothing left to claim; the revision is still open.
        assert!(store.claim_pending(graph_id).await.unwrap().is_none());
        assert!(store.has_open_revision(graph_id).await.unwrap());
        assert!(store.pending_graphs().await.unwrap().is_empty());
    }
}
