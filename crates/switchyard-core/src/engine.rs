//! Trigger activation facade.
//!
//! Transports (webhooks, schedules, a CLI) build a [`TriggerEvent`] and call
//! [`Engine::start_run`]. The engine validates the graph, persists the
//! initial snapshot, runs the scheduler on its own task and hands back a
//! [`RunHandle`]. Active runs are tracked by id so they can be cancelled
//! from anywhere holding the engine.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use switchyard_types::error::RepositoryError;
use switchyard_types::graph::Graph;
use switchyard_types::run::RunState;
use switchyard_types::trigger::TriggerEvent;

use crate::active::ActiveRuns;
use crate::graph::ValidationResult;
use crate::recovery::RecoveryManager;
use crate::run_store::{DynRunStore, InMemoryRunStore};
use crate::scheduler::Scheduler;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid graph: {0}")]
    InvalidGraph(ValidationResult),

    #[error("start step '{0}' is not in the graph")]
    UnknownStartStep(String),

    #[error("run {0} is already active")]
    RunAlreadyActive(Uuid),

    #[error("run {0} is not active")]
    RunNotActive(Uuid),

    #[error("run task failed: {0}")]
    RunAborted(String),

    #[error("run store error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Handle to a started run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    cancel: CancellationToken,
    join: JoinHandle<RunState>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Request cancellation. The run still finishes with a full snapshot.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to reach a terminal state.
    pub async fn wait(self) -> Result<RunState, EngineError> {
        self.join
            .await
            .map_err(|e| EngineError::RunAborted(e.to_string()))
    }
}

#[derive(Clone)]
pub struct Engine {
    scheduler: Scheduler,
    runs: DynRunStore,
    active: ActiveRuns,
}

impl Engine {
    pub fn new(scheduler: Scheduler, runs: DynRunStore) -> Self {
        Self {
            scheduler,
            runs,
            active: ActiveRuns::new(),
        }
    }

    /// Built-in steps with in-memory checkpoints and run snapshots.
    pub fn in_memory() -> Self {
        Self::new(Scheduler::in_memory(), Arc::new(InMemoryRunStore::new()))
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn runs(&self) -> &DynRunStore {
        &self.runs
    }

    /// Validate `graph`, persist the initial snapshot and start executing.
    pub async fn start_run(
        &self,
        graph: Graph,
        event: TriggerEvent,
    ) -> Result<RunHandle, EngineError> {
        let validation = self.scheduler.validate(&graph);
        if !validation.is_valid() {
            tracing::warn!(
                graph = %graph.name,
                issues = validation.issues.len(),
                "rejected invalid graph"
            );
            return Err(EngineError::InvalidGraph(validation));
        }
        if let Some(start) = &event.start_step_id {
            if graph.step(start).is_none() {
                return Err(EngineError::UnknownStartStep(start.clone()));
            }
        }

        let run_id = event.run_id;
        let active = self
            .active
            .claim(run_id)
            .ok_or(EngineError::RunAlreadyActive(run_id))?;

        let state = RunState::new(graph, event);
        self.runs.save_boxed(&state).await?;

        let cancel = active.token().clone();
        tracing::info!(run_id = %run_id, graph = %state.graph.name, "run accepted");

        let scheduler = self.scheduler.clone();
        let runs = Arc::clone(&self.runs);
        let join = tokio::spawn(async move {
            let finished = scheduler.execute(state, active.token().clone()).await;
            if let Err(e) = runs.save_boxed(&finished).await {
                tracing::warn!(run_id = %run_id, error = %e, "failed to persist final run snapshot");
            }
            drop(active);
            finished
        });

        Ok(RunHandle {
            run_id,
            cancel,
            join,
        })
    }

    /// Cancel an active run, whether started here or resumed by recovery.
    pub fn cancel_run(&self, run_id: Uuid) -> Result<(), EngineError> {
        if !self.active.cancel(run_id) {
            return Err(EngineError::RunNotActive(run_id));
        }
        tracing::info!(run_id = %run_id, "run cancellation requested");
        Ok(())
    }

    pub fn is_active(&self, run_id: Uuid) -> bool {
        self.active.contains(run_id)
    }

    /// Latest stored snapshot of a run.
    pub async fn run_state(&self, run_id: Uuid) -> Result<Option<RunState>, EngineError> {
        Ok(self.runs.load_boxed(run_id).await?)
    }

    /// Recovery manager sharing this engine's scheduler and stores.
    pub fn recovery(&self) -> RecoveryManager {
        RecoveryManager::new(self.scheduler.clone(), Arc::clone(&self.runs))
            .with_active_runs(self.active.clone())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("scheduler", &self.scheduler)
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use serde_json::json;
    use switchyard_types::checkpoint::RecoveryStrategy;
    use switchyard_types::error::{StepError, StepErrorKind};
    use switchyard_types::graph::StepNode;
    use switchyard_types::item::{Item, ParamBag, PortBundle};
    use switchyard_types::run::{RunStatus, SkipReason, StepStatus};

    use super::*;
    use crate::checkpoint::CheckpointManager;
    use crate::step::{ExecutionContext, StepDescriptor, StepHandler, StepRegistry};
    use crate::variables::StaticVariables;

    fn linear() -> Graph {
        Graph::new("linear")
            .with_step(StepNode::new("start", "manual_trigger"))
            .with_step(StepNode::new("tag", "set").with_param("values", json!({"tagged": true})))
            .connect("start", "tag")
    }

    fn slow() -> Graph {
        Graph::new("slow")
            .with_step(StepNode::new("start", "manual_trigger"))
            .with_step(StepNode::new("pause", "wait").with_param("ms", json!(10_000)))
            .with_step(StepNode::new("after", "no_op"))
            .connect("start", "pause")
            .connect("pause", "after")
    }

    #[tokio::test]
    async fn start_run_executes_and_persists() {
        let engine = Engine::in_memory();
        let handle = engine
            .start_run(linear(), TriggerEvent::manual(vec![Item::new(json!({"id": 1}))]))
            .await
            .unwrap();
        let run_id = handle.run_id();

        let state = handle.wait().await.unwrap();
        assert_eq!(state.status, RunStatus::Succeeded);
        assert_eq!(
            state.output_of("tag").unwrap().get("main")[0].payload,
            json!({"id": 1, "tagged": true})
        );

        let stored = engine.run_state(run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
        assert!(!engine.is_active(run_id));
    }

    #[tokio::test]
    async fn invalid_graph_reports_every_issue() {
        let engine = Engine::in_memory();
        let graph = Graph::new("bad")
            .with_step(StepNode::new("a", "manual_trigger"))
            .with_step(StepNode::new("b", "does_not_exist"))
            .connect("a", "ghost");

        let err = engine
            .start_run(graph, TriggerEvent::manual(vec![]))
            .await
            .unwrap_err();
        match err {
            EngineError::InvalidGraph(result) => assert!(result.issues.len() >= 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unknown_start_step_is_rejected() {
        let engine = Engine::in_memory();
        let event = TriggerEvent::manual(vec![]).starting_at("nowhere");
        let err = engine.start_run(linear(), event).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownStartStep(id) if id == "nowhere"));
    }

    #[tokio::test]
    async fn cancel_run_stops_an_active_run() {
        let engine = Engine::in_memory();
        let handle = engine
            .start_run(slow(), TriggerEvent::manual(vec![Item::empty()]))
            .await
            .unwrap();
        let run_id = handle.run_id();
        tokio::time::sleep(Duration::from_millis(50)).await;

        engine.cancel_run(run_id).unwrap();
        let state = tokio::time::timeout(Duration::from_secs(2), handle.wait())
            .await
            .expect("run should stop promptly")
            .unwrap();

        assert_eq!(state.status, RunStatus::Cancelled);
        assert_eq!(state.status_of("pause"), Some(StepStatus::Failed));
        assert_eq!(state.record("after").unwrap().skip_reason, Some(SkipReason::Cancelled));
        assert!(matches!(
            engine.cancel_run(run_id),
            Err(EngineError::RunNotActive(_))
        ));
    }

    #[tokio::test]
    async fn handle_cancel_is_equivalent() {
        let engine = Engine::in_memory();
        let handle = engine
            .start_run(slow(), TriggerEvent::manual(vec![]))
            .await
            .unwrap();
        handle.cancel();
        let state = handle.wait().await.unwrap();
        assert_eq!(state.status, RunStatus::Cancelled);
    }

    /// Fails its first call; later calls stall until cancelled.
    struct FailThenStall {
        descriptor: StepDescriptor,
        calls: AtomicU32,
    }

    impl StepHandler for FailThenStall {
        fn descriptor(&self) -> &StepDescriptor {
            &self.descriptor
        }

        async fn execute(
            &self,
            _inputs: PortBundle,
            _params: &ParamBag,
            _ctx: &ExecutionContext,
        ) -> Result<PortBundle, StepError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(StepError::network("connection reset"));
            }
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(PortBundle::new())
        }
    }

    #[tokio::test]
    async fn cancel_run_reaches_a_recovering_run() {
        let mut registry = StepRegistry::with_builtins();
        registry.register(FailThenStall {
            descriptor: StepDescriptor::simple("fail_then_stall", "Fail Then Stall"),
            calls: AtomicU32::new(0),
        });
        let scheduler = Scheduler::new(
            Arc::new(registry),
            CheckpointManager::in_memory(),
            Arc::new(StaticVariables::new()),
        );
        let engine = Engine::new(scheduler, Arc::new(InMemoryRunStore::new()));
        let graph = Graph::new("stall")
            .with_step(StepNode::new("start", "manual_trigger"))
            .with_step(StepNode::new("stall", "fail_then_stall"))
            .connect("start", "stall");

        let handle = engine
            .start_run(graph, TriggerEvent::manual(vec![Item::empty()]))
            .await
            .unwrap();
        let run_id = handle.run_id();
        assert_eq!(handle.wait().await.unwrap().status, RunStatus::Failed);

        let recovery = engine.recovery();
        let resumed =
            tokio::spawn(async move { recovery.recover(run_id, RecoveryStrategy::Retry).await });

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !engine.is_active(run_id) {
            assert!(std::time::Instant::now() < deadline, "recovery never registered the run");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.cancel_run(run_id).unwrap();

        let recovered = tokio::time::timeout(Duration::from_secs(2), resumed)
            .await
            .expect("recovery should stop promptly")
            .unwrap()
            .unwrap();
        assert!(!recovered);
        assert!(!engine.is_active(run_id));

        let stored = engine.run_state(run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Cancelled);
        assert_eq!(
            stored.record("stall").unwrap().error.as_ref().unwrap().kind,
            StepErrorKind::Cancelled
        );
    }

    #[tokio::test]
    async fn duplicate_run_id_is_rejected_while_active() {
        let engine = Engine::in_memory();
        let event = TriggerEvent::manual(vec![Item::empty()]);
        let duplicate = event.clone();
        let handle = engine.start_run(slow(), event).await.unwrap();

        let err = engine.start_run(slow(), duplicate).await.unwrap_err();
        assert!(matches!(err, EngineError::RunAlreadyActive(id) if id == handle.run_id()));

        handle.cancel();
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn recovery_shares_engine_stores() {
        let engine = Engine::in_memory();
        let graph = Graph::new("failing")
            .with_step(StepNode::new("start", "manual_trigger"))
            .with_step(
                StepNode::new("stop", "stop_and_error").with_param("message", json!("halt")),
            )
            .connect("start", "stop");

        let handle = engine
            .start_run(graph, TriggerEvent::manual(vec![]))
            .await
            .unwrap();
        let run_id = handle.run_id();
        assert_eq!(handle.wait().await.unwrap().status, RunStatus::Failed);

        let recovery = engine.recovery();
        assert_eq!(recovery.list_checkpoints(run_id).await.unwrap().len(), 1);
        assert!(recovery.recover(run_id, RecoveryStrategy::Skip).await.unwrap());
        assert_eq!(
            engine.run_state(run_id).await.unwrap().unwrap().status,
            RunStatus::Succeeded
        );
    }
}
