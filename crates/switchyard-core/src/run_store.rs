//! Run snapshot storage port.
//!
//! The engine saves a [`RunState`] when a run starts, when it finishes and
//! after every recovery attempt. Recovery loads the snapshot back to decide
//! what to re-run.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use switchyard_types::error::RepositoryError;
use switchyard_types::run::{RunState, RunStatus};

/// Short listing entry for a stored run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub graph_name: String,
    pub status: RunStatus,
}

pub trait RunStore: Send + Sync {
    /// Insert or replace the snapshot for `state.run_id`.
    fn save(&self, state: &RunState) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn load(
        &self,
        run_id: Uuid,
    ) -> impl Future<Output = Result<Option<RunState>, RepositoryError>> + Send;

    /// Most recent runs first.
    fn list(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<RunSummary>, RepositoryError>> + Send;
}

/// Object-safe companion of [`RunStore`].
pub trait RunStoreDyn: Send + Sync {
    fn save_boxed<'a>(
        &'a self,
        state: &'a RunState,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + 'a>>;

    fn load_boxed<'a>(
        &'a self,
        run_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RunState>, RepositoryError>> + Send + 'a>>;

    fn list_boxed<'a>(
        &'a self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RunSummary>, RepositoryError>> + Send + 'a>>;
}

impl<T: RunStore> RunStoreDyn for T {
    fn save_boxed<'a>(
        &'a self,
        state: &'a RunState,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + 'a>> {
        Box::pin(self.save(state))
    }

    fn load_boxed<'a>(
        &'a self,
        run_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RunState>, RepositoryError>> + Send + 'a>> {
        Box::pin(self.load(run_id))
    }

    fn list_boxed<'a>(
        &'a self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RunSummary>, RepositoryError>> + Send + 'a>> {
        Box::pin(self.list(limit))
    }
}

pub type DynRunStore = Arc<dyn RunStoreDyn>;

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: DashMap<Uuid, RunState>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStore for InMemoryRunStore {
    async fn save(&self, state: &RunState) -> Result<(), RepositoryError> {
        self.runs.insert(state.run_id, state.clone());
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<RunState>, RepositoryError> {
        Ok(self.runs.get(&run_id).map(|r| r.value().clone()))
    }

    async fn list(&self, limit: usize) -> Result<Vec<RunSummary>, RepositoryError> {
        let mut runs: Vec<(chrono::DateTime<chrono::Utc>, RunSummary)> = self
            .runs
            .iter()
            .map(|r| {
                (
                    r.started_at,
                    RunSummary {
                        run_id: r.run_id,
                        graph_name: r.graph.name.clone(),
                        status: r.status,
                    },
                )
            })
            .collect();
        runs.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(runs.into_iter().take(limit).map(|(_, s)| s).collect())
    }
}
