//! Document store abstraction
//!
//! Signaling rides on a document database used as a mailbox. This module
//! defines the narrow slice of such a database the call flow needs and an
//! in-process implementation.
//!
//! # Paths
//!
//! Paths alternate collection and document segments, Firestore style:
//! `calls` is a collection, `calls/{id}` a document and
//! `calls/{id}/offerCandidates` a sub-collection of that document.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

/// Document store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Store cannot be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Document does not exist
    #[error("Document not found: {0}")]
    NotFound(String),

    /// Document already exists
    #[error("Document already exists: {0}")]
    AlreadyExists(String),

    /// Conditional write rejected
    #[error("Precondition failed on {path}: {reason}")]
    PreconditionFailed {
        /// Document path
        path: String,
        /// What did not hold
        reason: String,
    },

    /// Document data has the wrong shape
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
}

/// Path to a collection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionPath(String);

impl CollectionPath {
    /// Top-level collection
    pub fn root(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Document inside this collection
    pub fn doc(&self, id: impl fmt::Display) -> DocumentPath {
        DocumentPath(format!("{}/{}", self.0, id))
    }

    /// Path as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Path to a document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentPath(String);

impl DocumentPath {
    /// Sub-collection under this document
    pub fn collection(&self, name: &str) -> CollectionPath {
        CollectionPath(format!("{}/{}", self.0, name))
    }

    /// Collection containing this document
    pub fn parent(&self) -> CollectionPath {
        match self.0.rsplit_once('/') {
            Some((parent, _)) => CollectionPath(parent.to_string()),
            None => CollectionPath(String::new()),
        }
    }

    /// Last path segment
    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Path as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Condition checked atomically before an update is applied
#[derive(Debug, Clone, PartialEq)]
pub enum Precondition {
    /// Always apply
    None,
    /// Field must not be set (or be null)
    FieldAbsent(String),
    /// Field must be unset or already hold exactly this value
    FieldAbsentOrEqual(String, Value),
}

impl Precondition {
    fn check(&self, data: &Value) -> Result<(), String> {
        match self {
            Self::None => Ok(()),
            Self::FieldAbsent(field) => match data.get(field) {
                None | Some(Value::Null) => Ok(()),
                Some(_) => Err(format!("field '{field}' is already set")),
            },
            Self::FieldAbsentOrEqual(field, expected) => match data.get(field) {
                None | Some(Value::Null) => Ok(()),
                Some(current) if current == expected => Ok(()),
                Some(_) => Err(format!("field '{field}' holds a different value")),
            },
        }
    }
}

/// Kind of change seen by a watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Document created
    Added,
    /// Document updated
    Modified,
    /// Document deleted
    Removed,
}

/// Document snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Document path
    pub path: DocumentPath,
    /// Document data
    pub data: Value,
}

/// Change delivered to a watcher
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    /// What happened
    pub kind: ChangeKind,
    /// Document path
    pub path: DocumentPath,
    /// Data after the change; last known data for removals
    pub data: Value,
}

/// Stream of changes from a watch
pub type ChangeStream = BoxStream<'static, DocumentChange>;

/// Document store used as the signaling mailbox
///
/// Implement this for the production database. Watches must deliver the
/// current contents first (as `Added`) and then every later change, in the
/// order the store applied them.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a document; fails if it exists
    async fn create(&self, path: &DocumentPath, data: Value) -> Result<(), StoreError>;

    /// Read a document
    async fn get(&self, path: &DocumentPath) -> Result<Option<Value>, StoreError>;

    /// Merge `patch` into an existing document if `precondition` holds
    async fn update(
        &self,
        path: &DocumentPath,
        patch: Map<String, Value>,
        precondition: Precondition,
    ) -> Result<(), StoreError>;

    /// Append a document with a generated id to a collection
    async fn append(&self, collection: &CollectionPath, data: Value)
        -> Result<DocumentPath, StoreError>;

    /// List a collection in append order
    async fn list(&self, collection: &CollectionPath) -> Result<Vec<Snapshot>, StoreError>;

    /// Delete a document; deleting a missing document is not an error
    async fn delete(&self, path: &DocumentPath) -> Result<(), StoreError>;

    /// Watch a single document
    async fn watch_document(&self, path: &DocumentPath) -> Result<ChangeStream, StoreError>;

    /// Watch every document of a collection
    async fn watch_collection(&self, collection: &CollectionPath)
        -> Result<ChangeStream, StoreError>;
}

struct StoredDocument {
    data: Value,
    seq: u64,
}

enum WatchTarget {
    Document(DocumentPath),
    Collection(CollectionPath),
}

impl WatchTarget {
    fn matches(&self, path: &DocumentPath) -> bool {
        match self {
            Self::Document(target) => target == path,
            Self::Collection(target) => &path.parent() == target,
        }
    }
}

struct Watcher {
    target: WatchTarget,
    sender: mpsc::UnboundedSender<DocumentChange>,
}

#[derive(Default)]
struct MemoryState {
    documents: BTreeMap<DocumentPath, StoredDocument>,
    watchers: Vec<Watcher>,
    next_seq: u64,
    unavailable: bool,
}

impl MemoryState {
    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            Err(StoreError::Unavailable("store is offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn notify(&mut self, change: DocumentChange) {
        self.watchers.retain(|watcher| {
            if !watcher.target.matches(&change.path) {
                return !watcher.sender.is_closed();
            }
            watcher.sender.send(change.clone()).is_ok()
        });
    }

    fn collection_snapshot(&self, collection: &CollectionPath) -> Vec<Snapshot> {
        let mut docs: Vec<(&DocumentPath, &StoredDocument)> = self
            .documents
            .iter()
            .filter(|(path, _)| &path.parent() == collection)
            .collect();
        docs.sort_by_key(|(_, doc)| doc.seq);
        docs.into_iter()
            .map(|(path, doc)| Snapshot {
                path: path.clone(),
                data: doc.data.clone(),
            })
            .collect()
    }

    fn watch(&mut self, target: WatchTarget, initial: Vec<Snapshot>) -> ChangeStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        for snapshot in initial {
            let _ = sender.send(DocumentChange {
                kind: ChangeKind::Added,
                path: snapshot.path,
                data: snapshot.data,
            });
        }
        self.watchers.push(Watcher { target, sender });
        UnboundedReceiverStream::new(receiver).boxed()
    }
}

/// In-process document store
///
/// Keeps documents in memory and fans changes out to watchers over unbounded
/// channels. Clones share the same data, so two controllers built on clones of
/// one store can call each other.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDocumentStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while unavailable every operation fails with
    /// [`StoreError::Unavailable`]. Existing watches stay open.
    pub fn set_available(&self, available: bool) {
        self.state.lock().unavailable = !available;
        tracing::debug!(available, "Memory store availability changed");
    }

    /// Number of stored documents, across all collections
    #[must_use]
    pub fn document_count(&self) -> usize {
        self.state.lock().documents.len()
    }

    /// Number of open watches
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        let mut state = self.state.lock();
        state.watchers.retain(|watcher| !watcher.sender.is_closed());
        state.watchers.len()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create(&self, path: &DocumentPath, data: Value) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.ensure_available()?;
        if state.documents.contains_key(path) {
            return Err(StoreError::AlreadyExists(path.to_string()));
        }
        let seq = state.next_seq();
        state.documents.insert(
            path.clone(),
            StoredDocument {
                data: data.clone(),
                seq,
            },
        );
        state.notify(DocumentChange {
            kind: ChangeKind::Added,
            path: path.clone(),
            data,
        });
        Ok(())
    }

    async fn get(&self, path: &DocumentPath) -> Result<Option<Value>, StoreError> {
        let state = self.state.lock();
        state.ensure_available()?;
        Ok(state.documents.get(path).map(|doc| doc.data.clone()))
    }

    async fn update(
        &self,
        path: &DocumentPath,
        patch: Map<String, Value>,
        precondition: Precondition,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.ensure_available()?;
        let doc = state
            .documents
            .get_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        precondition
            .check(&doc.data)
            .map_err(|reason| StoreError::PreconditionFailed {
                path: path.to_string(),
                reason,
            })?;

        let fields = doc
            .data
            .as_object_mut()
            .ok_or_else(|| StoreError::InvalidDocument(format!("{path} is not an object")))?;
        let mut changed = false;
        for (key, value) in patch {
            if fields.get(&key) != Some(&value) {
                fields.insert(key, value);
                changed = true;
            }
        }

        if changed {
            let data = doc.data.clone();
            state.notify(DocumentChange {
                kind: ChangeKind::Modified,
                path: path.clone(),
                data,
            });
        }
        Ok(())
    }

    async fn append(
        &self,
        collection: &CollectionPath,
        data: Value,
    ) -> Result<DocumentPath, StoreError> {
        let path = collection.doc(Uuid::new_v4().simple());
        self.create(&path, data).await?;
        Ok(path)
    }

    async fn list(&self, collection: &CollectionPath) -> Result<Vec<Snapshot>, StoreError> {
        let state = self.state.lock();
        state.ensure_available()?;
        Ok(state.collection_snapshot(collection))
    }

    async fn delete(&self, path: &DocumentPath) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.ensure_available()?;
        if let Some(doc) = state.documents.remove(path) {
            state.notify(DocumentChange {
                kind: ChangeKind::Removed,
                path: path.clone(),
                data: doc.data,
            });
        }
        Ok(())
    }

    async fn watch_document(&self, path: &DocumentPath) -> Result<ChangeStream, StoreError> {
        let mut state = self.state.lock();
        state.ensure_available()?;
        let initial = state
            .documents
            .get(path)
            .map(|doc| Snapshot {
                path: path.clone(),
                data: doc.data.clone(),
            })
            .into_iter()
            .collect();
        Ok(state.watch(WatchTarget::Document(path.clone()), initial))
    }

    async fn watch_collection(
        &self,
        collection: &CollectionPath,
    ) -> Result<ChangeStream, StoreError> {
        let mut state = self.state.lock();
        state.ensure_available()?;
        let initial = state.collection_snapshot(collection);
        Ok(state.watch(WatchTarget::Collection(collection.clone()), initial))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn calls() -> CollectionPath {
        CollectionPath::root("calls")
    }

    #[test]
    fn test_paths() {
        let doc = calls().doc("abc");
        assert_eq!(doc.as_str(), "calls/abc");
        assert_eq!(doc.id(), "abc");
        assert_eq!(doc.parent(), calls());

        let sub = doc.collection("offerCandidates");
        assert_eq!(sub.as_str(), "calls/abc/offerCandidates");
        assert_eq!(sub.doc("x").parent(), sub);
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let store = MemoryDocumentStore::new();
        let path = calls().doc("s1");

        store.create(&path, json!({"a": 1})).await.unwrap();
        assert_eq!(store.get(&path).await.unwrap(), Some(json!({"a": 1})));

        let dup = store.create(&path, json!({})).await;
        assert!(matches!(dup, Err(StoreError::AlreadyExists(_))));

        store.delete(&path).await.unwrap();
        assert_eq!(store.get(&path).await.unwrap(), None);
        // Deleting twice is fine
        store.delete(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_preconditions() {
        let store = MemoryDocumentStore::new();
        let path = calls().doc("s1");
        store.create(&path, json!({})).await.unwrap();

        let mut patch = Map::new();
        patch.insert("answer".to_string(), json!("first"));
        store
            .update(&path, patch.clone(), Precondition::FieldAbsent("answer".into()))
            .await
            .unwrap();

        let second = store
            .update(&path, patch.clone(), Precondition::FieldAbsent("answer".into()))
            .await;
        assert!(matches!(second, Err(StoreError::PreconditionFailed { .. })));

        store
            .update(
                &path,
                patch,
                Precondition::FieldAbsentOrEqual("answer".into(), json!("first")),
            )
            .await
            .unwrap();

        let mut other = Map::new();
        other.insert("answer".to_string(), json!("second"));
        let conflict = store
            .update(
                &path,
                other,
                Precondition::FieldAbsentOrEqual("answer".into(), json!("second")),
            )
            .await;
        assert!(matches!(conflict, Err(StoreError::PreconditionFailed { .. })));

        let missing = store
            .update(&calls().doc("nope"), Map::new(), Precondition::None)
            .await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_keeps_append_order() {
        let store = MemoryDocumentStore::new();
        let coll = calls().doc("s1").collection("offerCandidates");
        for i in 0..5 {
            store.append(&coll, json!({ "n": i })).await.unwrap();
        }
        let listed: Vec<Value> = store
            .list(&coll)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.data["n"].clone())
            .collect();
        assert_eq!(listed, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
    }

    #[tokio::test]
    async fn test_watch_collection_delivers_existing_then_new() {
        let store = MemoryDocumentStore::new();
        let coll = calls().doc("s1").collection("answerCandidates");
        store.append(&coll, json!({"n": 0})).await.unwrap();

        let mut changes = store.watch_collection(&coll).await.unwrap();
        store.append(&coll, json!({"n": 1})).await.unwrap();
        // Unrelated collection is not delivered
        store
            .append(&calls().doc("s2").collection("answerCandidates"), json!({"n": 99}))
            .await
            .unwrap();
        let second = store.append(&coll, json!({"n": 2})).await.unwrap();
        store.delete(&second).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            let change = changes.next().await.unwrap();
            seen.push((change.kind, change.data["n"].clone()));
        }
        assert_eq!(
            seen,
            vec![
                (ChangeKind::Added, json!(0)),
                (ChangeKind::Added, json!(1)),
                (ChangeKind::Added, json!(2)),
                (ChangeKind::Removed, json!(2)),
            ]
        );
    }

    #[tokio::test]
    async fn test_watch_document_sees_modifications() {
        let store = MemoryDocumentStore::new();
        let path = calls().doc("s1");
        store.create(&path, json!({"offer": null})).await.unwrap();

        let mut changes = store.watch_document(&path).await.unwrap();
        let first = changes.next().await.unwrap();
        assert_eq!(first.kind, ChangeKind::Added);

        let mut patch = Map::new();
        patch.insert("answer".into(), json!({"type": "answer", "sdp": "v=0"}));
        store.update(&path, patch.clone(), Precondition::None).await.unwrap();
        // Re-writing the same value is not a change
        store.update(&path, patch, Precondition::None).await.unwrap();
        store.delete(&path).await.unwrap();

        let modified = changes.next().await.unwrap();
        assert_eq!(modified.kind, ChangeKind::Modified);
        assert_eq!(modified.data["answer"]["sdp"], "v=0");
        let removed = changes.next().await.unwrap();
        assert_eq!(removed.kind, ChangeKind::Removed);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_everything() {
        let store = MemoryDocumentStore::new();
        let path = calls().doc("s1");
        store.set_available(false);

        assert!(matches!(
            store.create(&path, json!({})).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(store.get(&path).await, Err(StoreError::Unavailable(_))));
        assert!(store.watch_document(&path).await.is_err());

        store.set_available(true);
        store.create(&path, json!({})).await.unwrap();
        assert_eq!(store.document_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_watch_is_pruned() {
        let store = MemoryDocumentStore::new();
        let changes = store.watch_collection(&calls()).await.unwrap();
        assert_eq!(store.watcher_count(), 1);
        drop(changes);
        assert_eq!(store.watcher_count(), 0);
    }
}
