//! Work-queue scheduler for one run.
//!
//! Steps become eligible in Kahn order once every required input port has
//! a delivery. Eligible steps are spawned into a `JoinSet`; a semaphore
//! bounds how many execute at once. Independent branches therefore run
//! concurrently while order within a port is preserved end to end.
//!
//! Failure handling per step:
//! - retryable errors are retried in the step task per its `RetryPolicy`
//! - `continue_on_fail` turns the error into an error-shaped output item
//! - otherwise the step Fails and, with `abort_downstream`, every pending
//!   dependent is Skipped with `UpstreamFailed`
//!
//! Loop steps (iterative, with a back-edge input port) are re-entered once
//! their body goes quiet, up to `max_loop_iterations` times.

mod driver;
mod task;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use switchyard_types::config::EngineConfig;
use switchyard_types::graph::Graph;
use switchyard_types::run::RunState;
use switchyard_types::trigger::TriggerEvent;

use crate::checkpoint::CheckpointManager;
use crate::graph::{ValidationResult, validate};
use crate::step::StepRegistry;
use crate::variables::{DynVariableResolver, StaticVariables};

use driver::Driver;

/// Runtime bounds applied to every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerLimits {
    pub max_in_flight: usize,
    pub max_loop_iterations: u32,
    pub default_step_timeout: Duration,
}

impl SchedulerLimits {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_in_flight: config.max_in_flight,
            max_loop_iterations: config.max_loop_iterations,
            default_step_timeout: Duration::from_millis(config.default_step_timeout_ms),
        }
    }
}

impl Default for SchedulerLimits {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Executes graphs. Cheap to clone; collaborators are shared.
#[derive(Clone)]
pub struct Scheduler {
    registry: Arc<StepRegistry>,
    checkpoints: CheckpointManager,
    variables: DynVariableResolver,
    limits: SchedulerLimits,
}

impl Scheduler {
    pub fn new(
        registry: Arc<StepRegistry>,
        checkpoints: CheckpointManager,
        variables: DynVariableResolver,
    ) -> Self {
        Self {
            registry,
            checkpoints,
            variables,
            limits: SchedulerLimits::default(),
        }
    }

    /// Built-in steps, in-memory checkpoints, no variables.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(StepRegistry::with_builtins()),
            CheckpointManager::in_memory(),
            Arc::new(StaticVariables::new()),
        )
    }

    pub fn with_limits(mut self, limits: SchedulerLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn variables(&self) -> &DynVariableResolver {
        &self.variables
    }

    pub fn limits(&self) -> &SchedulerLimits {
        &self.limits
    }

    pub fn validate(&self, graph: &Graph) -> ValidationResult {
        validate(graph, &self.registry)
    }

    /// Validate `graph` and run it to a terminal state.
    pub async fn run(
        &self,
        graph: Graph,
        trigger: TriggerEvent,
        cancel: CancellationToken,
    ) -> Result<RunState, ValidationResult> {
        let validation = self.validate(&graph);
        if !validation.is_valid() {
            return Err(validation);
        }
        Ok(self.execute(RunState::new(graph, trigger), cancel).await)
    }

    /// Drive an already-validated run state. Steps that are terminal in
    /// `state` are kept and their outputs delivered; the rest run.
    pub(crate) async fn execute(&self, state: RunState, cancel: CancellationToken) -> RunState {
        Driver::new(self, state, cancel).drive().await
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("registry", &self.registry)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
