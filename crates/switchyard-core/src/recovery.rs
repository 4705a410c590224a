//! Failure analysis and resume of failed runs.
//!
//! The recovery manager is the only component that brings a Failed run
//! back. It loads the run snapshot from the [`RunStore`](crate::run_store),
//! rewrites step records according to the chosen [`RecoveryStrategy`] and
//! hands the state back to the scheduler, which keeps every terminal step
//! and re-runs the rest.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use switchyard_types::checkpoint::{
    Checkpoint, FailureCategory, RecoveryRecommendation, RecoveryStrategy,
};
use switchyard_types::error::{RepositoryError, StepError, StepErrorKind};
use switchyard_types::item::PortBundle;
use switchyard_types::run::{RunState, RunStatus, SkipReason, StepRecord, StepStatus};

use crate::active::ActiveRuns;
use crate::checkpoint::{CheckpointError, CheckpointManager};
use crate::graph::Topology;
use crate::run_store::DynRunStore;
use crate::scheduler::Scheduler;

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("run {0} is already executing")]
    RunActive(Uuid),

    #[error("run {run_id} is {status}, only failed runs can be recovered")]
    NotFailed { run_id: Uuid, status: &'static str },

    #[error("checkpoint for step '{step_id}' is unreadable: {source}")]
    CorruptCheckpoint {
        step_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("run store error: {0}")]
    Repository(#[from] RepositoryError),
}

pub struct RecoveryManager {
    scheduler: Scheduler,
    runs: DynRunStore,
    active: ActiveRuns,
}

impl RecoveryManager {
    pub fn new(scheduler: Scheduler, runs: DynRunStore) -> Self {
        Self {
            scheduler,
            runs,
            active: ActiveRuns::new(),
        }
    }

    /// Register resumed runs in `active` so they can be cancelled by id.
    pub fn with_active_runs(mut self, active: ActiveRuns) -> Self {
        self.active = active;
        self
    }

    fn checkpoints(&self) -> &CheckpointManager {
        self.scheduler.checkpoints()
    }

    // -----------------------------------------------------------------------
    // Checkpoint API
    // -----------------------------------------------------------------------

    pub async fn checkpoint(
        &self,
        run_id: Uuid,
        step_id: &str,
        state: Value,
    ) -> Result<Uuid, RecoveryError> {
        Ok(self.checkpoints().checkpoint(run_id, step_id, state).await?)
    }

    pub async fn list_checkpoints(&self, run_id: Uuid) -> Result<Vec<Checkpoint>, RecoveryError> {
        Ok(self.checkpoints().list(run_id).await?)
    }

    /// Discard every checkpoint of a run. Returns how many were removed.
    pub async fn cleanup(&self, run_id: Uuid) -> Result<u64, RecoveryError> {
        let removed = self.checkpoints().cleanup(run_id).await?;
        tracing::info!(run_id = %run_id, removed, "run checkpoints discarded");
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Analysis
    // -----------------------------------------------------------------------

    /// Classify `error` and recommend a strategy for `run_id`.
    pub async fn analyze(
        &self,
        run_id: Uuid,
        error: &StepError,
    ) -> Result<RecoveryRecommendation, RecoveryError> {
        let latest = self.checkpoints().latest(run_id).await?.map(|c| c.id);
        let recommendation = recommend(error, latest);
        tracing::debug!(
            run_id = %run_id,
            category = ?recommendation.category,
            strategy = recommendation.strategy.as_str(),
            "failure analyzed"
        );
        Ok(recommendation)
    }

    /// Analyze the failure recorded on a stored run.
    pub async fn analyze_run(&self, run_id: Uuid) -> Result<RecoveryRecommendation, RecoveryError> {
        let state = self.load_failed(run_id).await?;
        let error = state
            .failure
            .map(|f| f.error)
            .unwrap_or_else(|| StepError::execution("run failed without a recorded error"));
        self.analyze(run_id, &error).await
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Apply `strategy` to a failed run. Returns `true` when the resumed
    /// run ends Succeeded.
    ///
    /// While resumed the run is registered as active, so cancelling it by id
    /// stops every in-flight step.
    pub async fn recover(
        &self,
        run_id: Uuid,
        strategy: RecoveryStrategy,
    ) -> Result<bool, RecoveryError> {
        let mut state = self.load_failed(run_id).await?;
        tracing::info!(run_id = %run_id, strategy = strategy.as_str(), "recovering run");

        if strategy == RecoveryStrategy::Manual {
            state.awaiting_manual = true;
            self.runs.save_boxed(&state).await?;
            tracing::info!(run_id = %run_id, "run left for manual intervention");
            return Ok(false);
        }

        let active = self
            .active
            .claim(run_id)
            .ok_or(RecoveryError::RunActive(run_id))?;
        match strategy {
            RecoveryStrategy::Manual => {}
            RecoveryStrategy::Retry => {
                self.wait_out_retry_after(&state, active.token()).await;
                self.prepare_retry(&mut state);
            }
            RecoveryStrategy::Skip => self.prepare_skip(&mut state),
            RecoveryStrategy::RestartFromCheckpoint => {
                let checkpoints = self.checkpoints().list(run_id).await?;
                self.prepare_restart(&mut state, &checkpoints)?;
            }
        }

        state.failure = None;
        state.awaiting_manual = false;
        state.status = RunStatus::Running;
        state.finished_at = None;
        self.runs.save_boxed(&state).await?;

        let finished = self.scheduler.execute(state, active.token().clone()).await;
        self.runs.save_boxed(&finished).await?;
        drop(active);

        let succeeded = finished.status == RunStatus::Succeeded;
        tracing::info!(
            run_id = %run_id,
            strategy = strategy.as_str(),
            status = finished.status.as_str(),
            "recovery finished"
        );
        Ok(succeeded)
    }

    async fn load_failed(&self, run_id: Uuid) -> Result<RunState, RecoveryError> {
        let state = self
            .runs
            .load_boxed(run_id)
            .await?
            .ok_or(RecoveryError::RunNotFound(run_id))?;
        if state.status != RunStatus::Failed {
            return Err(RecoveryError::NotFailed {
                run_id,
                status: state.status.as_str(),
            });
        }
        Ok(state)
    }

    /// Sleep out whatever is left of the failing step's `retry_after`.
    async fn wait_out_retry_after(&self, state: &RunState, cancel: &CancellationToken) {
        let Some(failure) = &state.failure else {
            return;
        };
        let Some(delay) = failure.error.retry_after() else {
            return;
        };
        let failed_at = state
            .record(&failure.step_id)
            .and_then(|r| r.finished_at)
            .unwrap_or(state.started_at);
        let elapsed = (Utc::now() - failed_at).to_std().unwrap_or(Duration::ZERO);
        if let Some(remaining) = delay.checked_sub(elapsed) {
            tracing::debug!(
                run_id = %state.run_id,
                remaining_ms = remaining.as_millis() as u64,
                "waiting for retry-after"
            );
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    /// Every failed step goes back to Pending together with its forward
    /// closure. Upstream outputs are untouched so each failed step sees the
    /// inputs it saw before.
    fn prepare_retry(&self, state: &mut RunState) {
        let topo = Topology::build(&state.graph, self.scheduler.registry());
        let failed: Vec<String> = state
            .steps_with_status(StepStatus::Failed)
            .into_iter()
            .map(str::to_string)
            .collect();
        for step_id in &failed {
            reset(state, step_id);
            reset_all(state, topo.downstream(&state.graph, step_id));
        }
    }

    fn prepare_skip(&self, state: &mut RunState) {
        let Some(step_id) = state.failure.as_ref().map(|f| f.step_id.clone()) else {
            return;
        };
        let topo = Topology::build(&state.graph, self.scheduler.registry());
        reset_all(state, topo.downstream(&state.graph, &step_id));
        if let Some(record) = state.steps.get_mut(&step_id) {
            record.status = StepStatus::Skipped;
            record.skip_reason = Some(SkipReason::Manual);
            record.output = None;
            record.error = None;
        }
    }

    /// Restore every checkpointed step outside a loop region; everything
    /// else runs again.
    fn prepare_restart(
        &self,
        state: &mut RunState,
        checkpoints: &[Checkpoint],
    ) -> Result<(), RecoveryError> {
        let registry = self.scheduler.registry();
        let topo = Topology::build(&state.graph, registry);

        let mut loop_regions = BTreeSet::new();
        for node in &state.graph.steps {
            let iterative = registry
                .get(&node.step_type)
                .is_some_and(|h| h.descriptor().iterative);
            if iterative {
                loop_regions.insert(node.id.clone());
                loop_regions.extend(topo.downstream(&state.graph, &node.id));
            }
        }

        let ids: Vec<String> = state.steps.keys().cloned().collect();
        reset_all(state, ids);
        state.step_state.clear();

        let mut restored = 0usize;
        for checkpoint in checkpoints {
            if loop_regions.contains(&checkpoint.step_id) {
                continue;
            }
            let Some(record) = state.steps.get_mut(&checkpoint.step_id) else {
                continue;
            };
            if record.status != StepStatus::Pending {
                continue;
            }
            let output: PortBundle = serde_json::from_value(
                checkpoint.state.get("output").cloned().unwrap_or(Value::Null),
            )
            .map_err(|source| RecoveryError::CorruptCheckpoint {
                step_id: checkpoint.step_id.clone(),
                source,
            })?;

            record.status = StepStatus::Succeeded;
            record.output = Some(output);
            record.finished_at = Some(checkpoint.created_at);
            match checkpoint.state.get("state") {
                None | Some(Value::Null) => {}
                Some(blob) => {
                    state.step_state.insert(checkpoint.step_id.clone(), blob.clone());
                }
            }
            restored += 1;
        }
        tracing::debug!(run_id = %state.run_id, restored, "steps restored from checkpoints");
        Ok(())
    }
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Record helpers
// ---------------------------------------------------------------------------

/// Back to Pending unless the step is disabled or unreachable, which no
/// recovery changes.
fn reset(state: &mut RunState, step_id: &str) {
    let Some(record) = state.steps.get_mut(step_id) else {
        return;
    };
    if matches!(
        record.skip_reason,
        Some(SkipReason::Disabled | SkipReason::Unreachable)
    ) {
        return;
    }
    let invocations = record.invocations;
    *record = StepRecord {
        invocations,
        ..StepRecord::pending()
    };
    state.step_state.remove(step_id);
}

fn reset_all(state: &mut RunState, ids: impl IntoIterator<Item = String>) {
    for id in ids {
        reset(state, &id);
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

const NETWORK_HINTS: &[&str] = &[
    "connection",
    "network",
    "econnrefused",
    "econnreset",
    "socket",
    "dns",
    "unreachable",
    "rate limit",
    "too many requests",
    "429",
    "502",
    "503",
];
const TIMEOUT_HINTS: &[&str] = &["timeout", "timed out", "deadline"];
const PERMISSION_HINTS: &[&str] = &[
    "permission",
    "forbidden",
    "unauthorized",
    "access denied",
    "401",
    "403",
];
const VALIDATION_HINTS: &[&str] = &["invalid", "validation", "missing required", "malformed"];

fn classify(error: &StepError) -> FailureCategory {
    match error.kind {
        StepErrorKind::Network | StepErrorKind::Dependency => FailureCategory::Network,
        StepErrorKind::Timeout => FailureCategory::Timeout,
        StepErrorKind::Validation
        | StepErrorKind::SandboxViolation
        | StepErrorKind::IterationLimitExceeded => FailureCategory::Validation,
        StepErrorKind::Permission => FailureCategory::Permission,
        StepErrorKind::Cancelled => FailureCategory::Unknown,
        StepErrorKind::Execution => {
            let message = error.message.to_lowercase();
            let hit = |hints: &[&str]| hints.iter().any(|h| message.contains(h));
            if hit(TIMEOUT_HINTS) {
                FailureCategory::Timeout
            } else if hit(NETWORK_HINTS) {
                FailureCategory::Network
            } else if hit(PERMISSION_HINTS) {
                FailureCategory::Permission
            } else if hit(VALIDATION_HINTS) {
                FailureCategory::Validation
            } else {
                FailureCategory::Unknown
            }
        }
    }
}

fn recommend(error: &StepError, latest_checkpoint: Option<Uuid>) -> RecoveryRecommendation {
    let category = classify(error);
    // A typed timeout the author marked non-retryable is final.
    let retry_blocked = error.kind == StepErrorKind::Timeout && !error.retryable;

    let (strategy, reason) = match category {
        FailureCategory::Network => (
            RecoveryStrategy::Retry,
            format!("transient {} failure, retrying the step", error.kind),
        ),
        FailureCategory::Timeout if retry_blocked => (
            RecoveryStrategy::Manual,
            "step timed out and is marked non-retryable".to_string(),
        ),
        FailureCategory::Timeout => (
            RecoveryStrategy::Retry,
            "step timed out, retrying the step".to_string(),
        ),
        FailureCategory::Validation => (
            RecoveryStrategy::Manual,
            format!("{} failure needs a graph or code change", error.kind),
        ),
        FailureCategory::Permission => (
            RecoveryStrategy::Manual,
            "access was denied, credentials need attention".to_string(),
        ),
        FailureCategory::Unknown if latest_checkpoint.is_some() => (
            RecoveryStrategy::RestartFromCheckpoint,
            "unclassified failure, resuming from the last checkpoint".to_string(),
        ),
        FailureCategory::Unknown => (
            RecoveryStrategy::Manual,
            "unclassified failure and no checkpoint to resume from".to_string(),
        ),
    };

    RecoveryRecommendation {
        category,
        strategy,
        reason,
        retry_after_ms: error.retry_after_ms,
        latest_checkpoint,
    }
}
