//! Execution checkpoints.
//!
//! The engine saves an [`ExecutionSnapshot`] after every batch of transitions
//! and on the terminal transition. A snapshot carries everything needed to
//! resume: the definition (recompiled on load), the queue state with its
//! journal, the context, and the open credit ledger.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use weaver_types::execution::ExecutionStatus;
use weaver_types::workflow::WorkflowDefinition;

use super::context::ExecutionContext;
use super::queue::QueueState;
use crate::credit::coordinator::CreditLedgerState;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint store error: {0}")]
    Store(String),

    #[error("failed to serialize checkpoint: {0}")]
    Serialization(String),
}

/// Serializable state of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub definition: WorkflowDefinition,
    pub queue: QueueState,
    pub context: ExecutionContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits: Option<CreditLedgerState>,
    pub saved_at: DateTime<Utc>,
}

impl ExecutionSnapshot {
    pub fn to_json(&self) -> Result<String, CheckpointError> {
        serde_json::to_string(self).map_err(|e| CheckpointError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, CheckpointError> {
        serde_json::from_str(json).map_err(|e| CheckpointError::Serialization(e.to_string()))
    }
}

/// Persistence for execution snapshots.
///
/// Uses native async fn in traits (Rust 2024 edition, RPITIT).
/// For dynamic dispatch, use [`BoxExecutionStore`].
pub trait ExecutionStore: Send + Sync {
    /// Save (or replace) the snapshot for its execution.
    fn save_snapshot(
        &self,
        snapshot: &ExecutionSnapshot,
    ) -> impl Future<Output = Result<(), CheckpointError>> + Send;

    fn load_snapshot(
        &self,
        execution_id: Uuid,
    ) -> impl Future<Output = Result<Option<ExecutionSnapshot>, CheckpointError>> + Send;

    /// Returns whether a snapshot existed.
    fn delete_snapshot(
        &self,
        execution_id: Uuid,
    ) -> impl Future<Output = Result<bool, CheckpointError>> + Send;
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CheckpointError>> + Send + 'a>>;

/// Object-safe version of [`ExecutionStore`].
pub trait ExecutionStoreDyn: Send + Sync {
    fn save_snapshot_boxed<'a>(&'a self, snapshot: &'a ExecutionSnapshot) -> BoxFuture<'a, ()>;
    fn load_snapshot_boxed(&self, execution_id: Uuid) -> BoxFuture<'_, Option<ExecutionSnapshot>>;
    fn delete_snapshot_boxed(&self, execution_id: Uuid) -> BoxFuture<'_, bool>;
}

impl<T: ExecutionStore> ExecutionStoreDyn for T {
    fn save_snapshot_boxed<'a>(&'a self, snapshot: &'a ExecutionSnapshot) -> BoxFuture<'a, ()> {
        Box::pin(self.save_snapshot(snapshot))
    }

    fn load_snapshot_boxed(&self, execution_id: Uuid) -> BoxFuture<'_, Option<ExecutionSnapshot>> {
        Box::pin(self.load_snapshot(execution_id))
    }

    fn delete_snapshot_boxed(&self, execution_id: Uuid) -> BoxFuture<'_, bool> {
        Box::pin(self.delete_snapshot(execution_id))
    }
}

/// Type-erased, cloneable execution store.
#[derive(Clone)]
pub struct BoxExecutionStore {
    inner: Arc<dyn ExecutionStoreDyn>,
}

impl BoxExecutionStore {
    pub fn new<T: ExecutionStore + 'static>(store: T) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    pub async fn save_snapshot(&self, snapshot: &ExecutionSnapshot) -> Result<(), CheckpointError> {
        self.inner.save_snapshot_boxed(snapshot).await
    }

    pub async fn load_snapshot(&self, execution_id: Uuid) -> Result<Option<ExecutionSnapshot>, CheckpointError> {
        self.inner.load_snapshot_boxed(execution_id).await
    }

    pub async fn delete_snapshot(&self, execution_id: Uuid) -> Result<bool, CheckpointError> {
        self.inner.delete_snapshot_boxed(execution_id).await
    }
}

impl std::fmt::Debug for BoxExecutionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxExecutionStore").finish_non_exhaustive()
    }
}

/// Snapshot store held in memory. Snapshots are kept serialized so a load
/// always returns an independent copy.
#[derive(Debug, Clone, Default)]
pub struct InMemoryExecutionStore {
    snapshots: Arc<DashMap<Uuid, String>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl ExecutionStore for InMemoryExecutionStore {
    async fn save_snapshot(&self, snapshot: &ExecutionSnapshot) -> Result<(), CheckpointError> {
        let json = snapshot.to_json()?;
        self.snapshots.insert(snapshot.execution_id, json);
        tracing::debug!(
            execution_id = %snapshot.execution_id,
            status = %snapshot.status,
            transitions = snapshot.queue.journal().len(),
            "checkpoint saved"
        );
        Ok(())
    }

    async fn load_snapshot(&self, execution_id: Uuid) -> Result<Option<ExecutionSnapshot>, CheckpointError> {
        self.snapshots
            .get(&execution_id)
            .map(|json| ExecutionSnapshot::from_json(json.value()))
            .transpose()
    }

    async fn delete_snapshot(&self, execution_id: Uuid) -> Result<bool, CheckpointError> {
        Ok(self.snapshots.remove(&execution_id).is_some())
    }
}

/// Snapshot store backed by a directory, one `{execution_id}.json` per execution.
///
/// Writes go to a temporary file first and are renamed into place, so a
/// crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct FileExecutionStore {
    dir: PathBuf,
}

impl FileExecutionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, execution_id: Uuid) -> PathBuf {
        self.dir.join(format!("{execution_id}.json"))
    }

    /// Every snapshot in the directory, newest first. Unreadable files are
    /// logged and skipped.
    pub async fn list(&self) -> Result<Vec<ExecutionSnapshot>, CheckpointError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(store_error(&self.dir, e)),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| store_error(&self.dir, e))? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let parsed = match tokio::fs::read_to_string(&path).await {
                Ok(json) => ExecutionSnapshot::from_json(&json),
                Err(e) => Err(store_error(&path, e)),
            };
            match parsed {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint"),
            }
        }
        snapshots.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(snapshots)
    }
}

fn store_error(path: &Path, err: std::io::Error) -> CheckpointError {
    CheckpointError::Store(format!("{}: {err}", path.display()))
}

impl ExecutionStore for FileExecutionStore {
    async fn save_snapshot(&self, snapshot: &ExecutionSnapshot) -> Result<(), CheckpointError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| store_error(&self.dir, e))?;

        let path = self.path_for(snapshot.execution_id);
        let tmp = path.with_extension("json.tmp");
        let json = snapshot.to_json()?;
        tokio::fs::write(&tmp, json).await.map_err(|e| store_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| store_error(&path, e))?;

        tracing::debug!(
            execution_id = %snapshot.execution_id,
            status = %snapshot.status,
            path = %path.display(),
            "checkpoint written"
        );
        Ok(())
    }

    async fn load_snapshot(&self, execution_id: Uuid) -> Result<Option<ExecutionSnapshot>, CheckpointError> {
        let path = self.path_for(execution_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => ExecutionSnapshot::from_json(&json).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(store_error(&path, e)),
        }
    }

    async fn delete_snapshot(&self, execution_id: Uuid) -> Result<bool, CheckpointError> {
        let path = self.path_for(execution_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(store_error(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::compiler::compile;
    use serde_json::json;

    fn snapshot() -> ExecutionSnapshot {
        let definition: WorkflowDefinition = serde_json::from_value(json!({
            "name": "pair",
            "entryPoint": "a",
            "nodes": {
                "a": { "type": "input", "name": "A" },
                "b": { "type": "output", "name": "B" }
            },
            "edges": [{ "id": "e1", "source": "a", "target": "b" }]
        }))
        .unwrap();
        let plan = compile(&definition).unwrap();
        let mut queue = QueueState::initialize(&plan);
        queue.dispatch(4).unwrap();
        queue.mark_completed(&plan, "a", json!({ "x": 1 })).unwrap();
        let mut context = ExecutionContext::new(json!({ "x": 1 }));
        context.record_output("a", json!({ "x": 1 })).unwrap();

        ExecutionSnapshot {
            execution_id: Uuid::now_v7(),
            status: ExecutionStatus::Running,
            definition,
            queue,
            context,
            credits: None,
            saved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_load_delete() {
        let store = BoxExecutionStore::new(InMemoryExecutionStore::new());
        let snap = snapshot();

        store.save_snapshot(&snap).await.unwrap();
        let loaded = store.load_snapshot(snap.execution_id).await.unwrap().unwrap();
        assert_eq!(loaded, snap);
        assert_eq!(loaded.queue.journal().len(), 2);

        assert!(store.delete_snapshot(snap.execution_id).await.unwrap());
        assert!(!store.delete_snapshot(snap.execution_id).await.unwrap());
        assert!(store.load_snapshot(snap.execution_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_replaces_previous_snapshot() {
        let store = InMemoryExecutionStore::new();
        let mut snap = snapshot();
        store.save_snapshot(&snap).await.unwrap();
        snap.status = ExecutionStatus::Completed;
        store.save_snapshot(&snap).await.unwrap();

        assert_eq!(store.len(), 1);
        let loaded = store.load_snapshot(snap.execution_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn file_store_round_trips_and_lists() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FileExecutionStore::new(tmp.path().join("checkpoints"));
        assert!(store.list().await.unwrap().is_empty());

        let first = snapshot();
        let mut second = snapshot();
        second.saved_at = first.saved_at + chrono::Duration::seconds(5);
        store.save_snapshot(&first).await.unwrap();
        store.save_snapshot(&second).await.unwrap();

        let loaded = store.load_snapshot(first.execution_id).await.unwrap().unwrap();
        assert_eq!(loaded, first);

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].execution_id, second.execution_id);

        assert!(store.delete_snapshot(first.execution_id).await.unwrap());
        assert!(store.load_snapshot(first.execution_id).await.unwrap().is_none());
        assert!(!store.delete_snapshot(first.execution_id).await.unwrap());
    }

    #[tokio::test]
    async fn file_store_skips_corrupt_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FileExecutionStore::new(tmp.path());
        store.save_snapshot(&snapshot()).await.unwrap();
        tokio::fs::write(tmp.path().join("broken.json"), "{ not json").await.unwrap();

        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
