//! Checkpoint storage port and manager.
//!
//! The scheduler records a checkpoint after every successful step; only the
//! recovery manager reads them back. Checkpoints are append-only: a second
//! checkpoint for the same (run, step) returns the existing record.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use switchyard_types::checkpoint::Checkpoint;
use switchyard_types::error::RepositoryError;

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Persistence for checkpoints.
///
/// Implementations live in `switchyard-infra` (SQLite) and below
/// (in-memory).
pub trait CheckpointStore: Send + Sync {
    /// Insert unless a checkpoint for `(run_id, step_id)` already exists;
    /// either way return the stored record.
    fn insert_if_absent(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl Future<Output = Result<Checkpoint, RepositoryError>> + Send;

    /// All checkpoints of a run, oldest first.
    fn list(
        &self,
        run_id: Uuid,
    ) -> impl Future<Output = Result<Vec<Checkpoint>, RepositoryError>> + Send;

    /// Delete every checkpoint of a run, returning how many were removed.
    fn delete_run(
        &self,
        run_id: Uuid,
    ) -> impl Future<Output = Result<u64, RepositoryError>> + Send;
}

/// Object-safe companion of [`CheckpointStore`].
pub trait CheckpointStoreDyn: Send + Sync {
    fn insert_if_absent_boxed<'a>(
        &'a self,
        checkpoint: &'a Checkpoint,
    ) -> Pin<Box<dyn Future<Output = Result<Checkpoint, RepositoryError>> + Send + 'a>>;

    fn list_boxed<'a>(
        &'a self,
        run_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Checkpoint>, RepositoryError>> + Send + 'a>>;

    fn delete_run_boxed<'a>(
        &'a self,
        run_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<u64, RepositoryError>> + Send + 'a>>;
}

impl<T: CheckpointStore> CheckpointStoreDyn for T {
    fn insert_if_absent_boxed<'a>(
        &'a self,
        checkpoint: &'a Checkpoint,
    ) -> Pin<Box<dyn Future<Output = Result<Checkpoint, RepositoryError>> + Send + 'a>> {
        Box::pin(self.insert_if_absent(checkpoint))
    }

    fn list_boxed<'a>(
        &'a self,
        run_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Checkpoint>, RepositoryError>> + Send + 'a>> {
        Box::pin(self.list(run_id))
    }

    fn delete_run_boxed<'a>(
        &'a self,
        run_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<u64, RepositoryError>> + Send + 'a>> {
        Box::pin(self.delete_run(run_id))
    }
}

pub type DynCheckpointStore = Arc<dyn CheckpointStoreDyn>;

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    runs: DashMap<Uuid, Vec<Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    async fn insert_if_absent(&self, checkpoint: &Checkpoint) -> Result<Checkpoint, RepositoryError> {
        let mut entries = self.runs.entry(checkpoint.run_id).or_default();
        if let Some(existing) = entries.iter().find(|c| c.step_id == checkpoint.step_id) {
            return Ok(existing.clone());
        }
        entries.push(checkpoint.clone());
        Ok(checkpoint.clone())
    }

    async fn list(&self, run_id: Uuid) -> Result<Vec<Checkpoint>, RepositoryError> {
        Ok(self
            .runs
            .get(&run_id)
            .map(|entries| entries.value().clone())
            .unwrap_or_default())
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<u64, RepositoryError> {
        Ok(self
            .runs
            .remove(&run_id)
            .map(|(_, entries)| entries.len() as u64)
            .unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Higher-level checkpoint API over a [`CheckpointStore`].
#[derive(Clone)]
pub struct CheckpointManager {
    store: DynCheckpointStore,
}

impl CheckpointManager {
    pub fn new(store: DynCheckpointStore) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryCheckpointStore::new()))
    }

    /// Record a step's successful completion. Idempotent per (run, step).
    pub async fn checkpoint(
        &self,
        run_id: Uuid,
        step_id: &str,
        state: Value,
    ) -> Result<Uuid, CheckpointError> {
        let candidate = Checkpoint {
            id: Uuid::now_v7(),
            run_id,
            step_id: step_id.to_string(),
            state,
            created_at: Utc::now(),
        };
        let stored = self.store.insert_if_absent_boxed(&candidate).await?;

        if stored.id == candidate.id {
            tracing::debug!(run_id = %run_id, step_id, checkpoint_id = %stored.id, "checkpoint recorded");
        } else {
            tracing::trace!(run_id = %run_id, step_id, "checkpoint already present");
        }
        Ok(stored.id)
    }

    /// Checkpoints of a run, oldest first.
    pub async fn list(&self, run_id: Uuid) -> Result<Vec<Checkpoint>, CheckpointError> {
        let mut checkpoints = self.store.list_boxed(run_id).await?;
        checkpoints.sort_by_key(|c| c.created_at);
        Ok(checkpoints)
    }

    pub async fn latest(&self, run_id: Uuid) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.list(run_id).await?.pop())
    }

    /// Discard every checkpoint of a run.
    pub async fn cleanup(&self, run_id: Uuid) -> Result<u64, CheckpointError> {
        let removed = self.store.delete_run_boxed(run_id).await?;
        tracing::debug!(run_id = %run_id, removed, "checkpoints cleaned up");
        Ok(removed)
    }
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint store error: {0}")]
    Repository(#[from] RepositoryError),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn checkpoint_is_idempotent_per_step() {
        let manager = CheckpointManager::in_memory();
        let run_id = Uuid::now_v7();

        let first = manager.checkpoint(run_id, "a", json!({"output": {}})).await.unwrap();
        let second = manager.checkpoint(run_id, "a", json!({"output": {"main": []}})).await.unwrap();
        assert_eq!(first, second);

        let all = manager.list(run_id).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state, json!({"output": {}}));
    }

    #[tokio::test]
    async fn list_is_ordered_and_scoped_to_run() {
        let manager = CheckpointManager::in_memory();
        let run_id = Uuid::now_v7();
        let other = Uuid::now_v7();

        for step in ["a", "b", "c"] {
            manager.checkpoint(run_id, step, Value::Null).await.unwrap();
        }
        manager.checkpoint(other, "a", Value::Null).await.unwrap();

        let steps: Vec<String> = manager
            .list(run_id)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.step_id)
            .collect();
        assert_eq!(steps, vec!["a", "b", "c"]);
        assert_eq!(manager.latest(run_id).await.unwrap().unwrap().step_id, "c");
    }

    #[tokio::test]
    async fn cleanup_removes_only_that_run() {
        let manager = CheckpointManager::in_memory();
        let run_id = Uuid::now_v7();
        let other = Uuid::now_v7();
        manager.checkpoint(run_id, "a", Value::Null).await.unwrap();
        manager.checkpoint(run_id, "b", Value::Null).await.unwrap();
        manager.checkpoint(other, "a", Value::Null).await.unwrap();

        assert_eq!(manager.cleanup(run_id).await.unwrap(), 2);
        assert!(manager.list(run_id).await.unwrap().is_empty());
        assert_eq!(manager.list(other).await.unwrap().len(), 1);
        assert_eq!(manager.cleanup(run_id).await.unwrap(), 0);
    }

    #[test]
    fn error_display() {
        let err = CheckpointError::from(RepositoryError::Query("locked".to_string()));
        assert!(err.to_string().contains("locked"));
    }
}
