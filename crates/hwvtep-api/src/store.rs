// ── Operational store ──
//
// Write path for operational state. Writes are staged in a transaction and
// applied atomically on commit; a cancelled transaction leaves the store
// untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::Error;

// ── StorePath ───────────────────────────────────────────────────────

/// Typed path into the operational tree, one segment per level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorePath(Vec<String>);

impl StorePath {
    pub fn root(segment: impl Into<String>) -> Self {
        Self(vec![segment.into()])
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// `true` if `self` is `prefix` or lies below it.
    pub fn starts_with(&self, prefix: &StorePath) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0.join("/"))
    }
}

// ── Traits ──────────────────────────────────────────────────────────

#[async_trait]
pub trait OperationalStore: Send + Sync {
    /// Point read.
    async fn read(&self, path: &StorePath) -> Result<Option<Value>, Error>;

    /// Open a write transaction.
    fn begin(&self) -> Box<dyn StoreTransaction>;
}

/// Staged writes. Every write is idempotent; `delete` removes the subtree.
#[async_trait]
pub trait StoreTransaction: Send {
    fn put(&mut self, path: StorePath, value: Value);
    fn merge(&mut self, path: StorePath, value: Value);
    fn delete(&mut self, path: StorePath);

    fn is_empty(&self) -> bool;

    async fn commit(self: Box<Self>) -> Result<(), Error>;

    /// Drop staged writes without applying them.
    fn cancel(self: Box<Self>);
}

// ── MemoryStore ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum StagedWrite {
    Put(StorePath, Value),
    Merge(StorePath, Value),
    Delete(StorePath),
}

/// In-process operational store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<BTreeMap<StorePath, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All paths at or below `prefix`.
    pub async fn paths_under(&self, prefix: &StorePath) -> Vec<StorePath> {
        self.data
            .read()
            .await
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait]
impl OperationalStore for MemoryStore {
    async fn read(&self, path: &StorePath) -> Result<Option<Value>, Error> {
        Ok(self.data.read().await.get(path).cloned())
    }

    fn begin(&self) -> Box<dyn StoreTransaction> {
        Box::new(MemoryTransaction {
            data: Arc::clone(&self.data),
            writes: Vec::new(),
        })
    }
}

struct MemoryTransaction {
    data: Arc<RwLock<BTreeMap<StorePath, Value>>>,
    writes: Vec<StagedWrite>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    fn put(&mut self, path: StorePath, value: Value) {
        self.writes.push(StagedWrite::Put(path, value));
    }

    fn merge(&mut self, path: StorePath, value: Value) {
        self.writes.push(StagedWrite::Merge(path, value));
    }

    fn delete(&mut self, path: StorePath) {
        self.writes.push(StagedWrite::Delete(path));
    }

    fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    async fn commit(self: Box<Self>) -> Result<(), Error> {
        let mut data = self.data.write().await;
        for write in self.writes {
            match write {
                StagedWrite::Put(path, value) => {
                    data.insert(path, value);
                }
                StagedWrite::Merge(path, value) => match data.get_mut(&path) {
                    Some(existing) => merge_value(existing, value),
                    None => {
                        data.insert(path, value);
                    }
                },
                StagedWrite::Delete(path) => data.retain(|p, _| !p.starts_with(&path)),
            }
        }
        Ok(())
    }

    fn cancel(self: Box<Self>) {}
}

/// Recursive object merge; anything else is replaced.
fn merge_value(existing: &mut Value, incoming: Value) {
    match (existing, incoming) {
        (Value::Object(into), Value::Object(from)) => {
            for (k, v) in from {
                match into.get_mut(&k) {
                    Some(slot) => merge_value(slot, v),
                    None => {
                        into.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node() -> StorePath {
        StorePath::root("hwvtep://10.0.0.1")
    }

    #[tokio::test]
    async fn commit_applies_writes_in_order() {
        let store = MemoryStore::new();
        let ls = node().child("logical-switches").child("LS1");

        let mut tx = store.begin();
        tx.put(ls.clone(), json!({ "name": "LS1", "tunnel_key": 1 }));
        tx.merge(ls.clone(), json!({ "tunnel_key": 2, "description": "blue" }));
        tx.commit().await.unwrap();

        assert_eq!(
            store.read(&ls).await.unwrap(),
            Some(json!({ "name": "LS1", "tunnel_key": 2, "description": "blue" }))
        );
    }

    #[tokio::test]
    async fn delete_removes_subtree() {
        let store = MemoryStore::new();
        let mut tx = store.begin();
        tx.put(node(), json!({}));
        tx.put(node().child("logical-switches").child("LS1"), json!({}));
        tx.put(StorePath::root("hwvtep://10.0.0.2"), json!({}));
        tx.commit().await.unwrap();

        let mut tx = store.begin();
        tx.delete(node());
        tx.commit().await.unwrap();

        assert!(store.paths_under(&node()).await.is_empty());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn cancel_discards_writes() {
        let store = MemoryStore::new();
        let mut tx = store.begin();
        tx.put(node(), json!({}));
        assert!(!tx.is_empty());
        tx.cancel();

        assert!(store.is_empty().await);
    }

    #[test]
    fn path_display_and_prefix() {
        let path = node().child("logical-switches").child("LS1");
        assert_eq!(path.to_string(), "/hwvtep://10.0.0.1/logical-switches/LS1");
        assert!(path.starts_with(&node()));
        assert!(!node().starts_with(&path));
    }
}
