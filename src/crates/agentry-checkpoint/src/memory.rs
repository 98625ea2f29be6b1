//! In-memory checkpoint store for development and testing.
//!
//! Reference implementation of [`CheckpointStore`] backed by an
//! `Arc<RwLock<HashMap>>`. All operations are in-memory and ephemeral; data
//! is lost on restart. Each `(thread_id, checkpoint_ns)` key owns an
//! append-only vector of snapshots, newest last.

use crate::checkpoint::{Checkpoint, CheckpointKey, CheckpointTuple};
use crate::error::Result;
use crate::store::CheckpointStore;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Thread-safe in-memory checkpoint store.
#[derive(Clone, Default)]
pub struct InMemoryCheckpointStore {
    // thread_id -> checkpoint_ns -> snapshots (oldest first)
    inner: Arc<RwLock<HashMap<String, HashMap<String, Vec<CheckpointTuple>>>>>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct threads with at least one snapshot
    pub fn thread_count(&self) -> usize {
        self.inner.read().len()
    }

    /// Total snapshot count across all threads and namespaces
    pub fn checkpoint_count(&self) -> usize {
        self.inner
            .read()
            .values()
            .flat_map(|ns| ns.values())
            .map(|v| v.len())
            .sum()
    }

    /// Remove every snapshot (test isolation helper)
    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get_tuple(&self, key: &CheckpointKey) -> Result<Option<CheckpointTuple>> {
        let guard = self.inner.read();
        Ok(guard
            .get(&key.thread_id)
            .and_then(|ns| ns.get(&key.checkpoint_ns))
            .and_then(|v| v.last())
            .cloned())
    }

    async fn put(&self, key: &CheckpointKey, checkpoint: Checkpoint) -> Result<CheckpointTuple> {
        let mut guard = self.inner.write();
        let snapshots = guard
            .entry(key.thread_id.clone())
            .or_default()
            .entry(key.checkpoint_ns.clone())
            .or_default();

        let tuple = CheckpointTuple {
            key: key.clone(),
            parent_id: snapshots.last().map(|t| t.checkpoint.id.clone()),
            checkpoint,
        };
        snapshots.push(tuple.clone());
        Ok(tuple)
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<CheckpointTuple>> {
        let guard = self.inner.read();
        let mut tuples: Vec<CheckpointTuple> = guard
            .get(thread_id)
            .map(|ns| ns.values().flatten().cloned().collect())
            .unwrap_or_default();
        tuples.sort_by(|a, b| b.checkpoint.created_at.cmp(&a.checkpoint.created_at));
        Ok(tuples)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.inner.write().remove(thread_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(thread: &str, ns: &str) -> CheckpointKey {
        CheckpointKey::new(thread, ns)
    }

    #[tokio::test]
    async fn get_tuple_returns_latest() {
        let store = InMemoryCheckpointStore::new();
        let k = key("g1:s1", "g1:s1:agent");

        store.put(&k, Checkpoint::new(json!({"turn": 1}))).await.unwrap();
        let second = store.put(&k, Checkpoint::new(json!({"turn": 2}))).await.unwrap();

        let latest = store.get_tuple(&k).await.unwrap().unwrap();
        assert_eq!(latest.checkpoint.id, second.checkpoint.id);
        assert_eq!(latest.checkpoint.state["turn"], 2);
    }

    #[tokio::test]
    async fn parent_id_chains_snapshots() {
        let store = InMemoryCheckpointStore::new();
        let k = key("t", "ns");

        let first = store.put(&k, Checkpoint::new(json!({}))).await.unwrap();
        assert!(first.parent_id.is_none());

        let second = store.put(&k, Checkpoint::new(json!({}))).await.unwrap();
        assert_eq!(second.parent_id.as_deref(), Some(first.checkpoint.id.as_str()));
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let store = InMemoryCheckpointStore::new();
        let a = key("t", "g:s:agent-a");
        let b = key("t", "g:s:agent-b");

        store.put(&a, Checkpoint::new(json!({"who": "a"}))).await.unwrap();
        assert!(store.get_tuple(&b).await.unwrap().is_none());

        store.put(&b, Checkpoint::new(json!({"who": "b"}))).await.unwrap();
        let got = store.get_tuple(&a).await.unwrap().unwrap();
        assert_eq!(got.checkpoint.state["who"], "a");
    }

    #[tokio::test]
    async fn delete_thread_removes_all_namespaces() {
        let store = InMemoryCheckpointStore::new();
        store.put(&key("t", "ns1"), Checkpoint::new(json!({}))).await.unwrap();
        store.put(&key("t", "ns2"), Checkpoint::new(json!({}))).await.unwrap();
        assert_eq!(store.checkpoint_count(), 2);

        store.delete_thread("t").await.unwrap();
        assert_eq!(store.checkpoint_count(), 0);
        assert!(store.get_tuple(&key("t", "ns1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let store = InMemoryCheckpointStore::new();
        let k = key("t", "ns");
        store.put(&k, Checkpoint::new(json!({"n": 1}))).await.unwrap();
        store.put(&k, Checkpoint::new(json!({"n": 2}))).await.unwrap();

        let all = store.list("t").await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].checkpoint.created_at >= all[1].checkpoint.created_at);
    }
}
