//! Run driver: the single owner of a run's mutable state.
//!
//! The driver keeps per-connection deliveries, decides which steps are
//! eligible, launches them into a `JoinSet` bounded by a semaphore, and
//! applies every finished invocation. Step tasks never see `RunState`.
//!
//! A loop step's outputs that leave the loop are held while the loop can
//! still be re-entered, so steps past the exit run once on the final output.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use switchyard_types::error::{StepError, StepErrorKind};
use switchyard_types::graph::{Graph, StepNode};
use switchyard_types::item::{Item, MAIN_PORT, PortBundle};
use switchyard_types::run::{RunFailure, RunState, RunStatus, SkipReason, StepStatus};

use super::Scheduler;
use super::task::{InvocationKind, StepJob, TaskOutcome, supervise};
use crate::graph::Topology;
use crate::step::StepHandlerDyn;
use crate::step::context::StepStateMap;
use crate::step::ExecutionContext;

/// Per-step facts resolved once at run start.
struct StepPlan {
    node: StepNode,
    handler: Arc<dyn StepHandlerDyn>,
    waits_for_all: bool,
    optional_inputs: HashSet<String>,
    outputs: Vec<String>,
}

/// What a step should do next, given the current deliveries.
enum Move {
    Wait,
    Skip(SkipReason),
    Launch(PortBundle),
    /// Pass-through step: consume one arrival on the given connection.
    Arrival(usize, PortBundle),
    /// Pass-through step: every source has delivered; settle.
    Finalize,
}

enum Pass {
    Progress,
    Idle,
    /// No permit left; resume once a task finishes.
    Blocked,
}

pub(crate) struct Driver<'s> {
    sched: &'s Scheduler,
    graph: Arc<Graph>,
    topo: Topology,
    plans: HashMap<String, Arc<StepPlan>>,
    state: RunState,
    start_step: Option<String>,
    seeds: Vec<Item>,

    /// Items delivered on each forward connection (by index).
    deliveries: HashMap<usize, Vec<Item>>,
    /// Connections a pass-through step already consumed.
    consumed: HashSet<usize>,
    /// Items queued on back-edges, per loop step.
    back_queue: HashMap<String, PortBundle>,
    /// Loop steps whose body fed the back-edge since the last re-entry.
    back_pending: HashSet<String>,
    loop_counts: HashMap<String, u32>,
    loop_bodies: HashMap<String, BTreeSet<String>>,
    /// Body steps that can feed the loop's back-edges.
    loop_cores: HashMap<String, BTreeSet<String>>,
    /// Forward connections leaving a loop outside its core.
    loop_exits: HashMap<String, HashSet<usize>>,
    /// Exit deliveries held until the loop stops iterating.
    held_exits: HashMap<String, Vec<(usize, Vec<Item>)>>,

    in_flight: HashSet<String>,
    tasks: JoinSet<TaskOutcome>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    cancelled: bool,
    step_state: StepStateMap,
}

impl<'s> Driver<'s> {
    pub(crate) fn new(sched: &'s Scheduler, state: RunState, cancel: CancellationToken) -> Self {
        let graph = Arc::new(state.graph.clone());
        let topo = Topology::build(&graph, sched.registry());

        let mut plans = HashMap::new();
        let mut loop_bodies = HashMap::new();
        let mut loop_cores = HashMap::new();
        let mut loop_exits = HashMap::new();
        for node in &graph.steps {
            let Some(handler) = sched.registry().get(&node.step_type) else {
                continue;
            };
            let optional_inputs = handler
                .input_ports(&node.parameters)
                .into_iter()
                .filter(|p| p.optional)
                .map(|p| p.name)
                .collect();
            if handler.descriptor().iterative {
                let core = topo.loop_core(&graph, &node.id);
                let exits: HashSet<usize> = topo
                    .outgoing(&node.id)
                    .iter()
                    .copied()
                    .filter(|&c| !core.contains(&graph.connections[c].target))
                    .collect();
                loop_bodies.insert(node.id.clone(), topo.downstream(&graph, &node.id));
                loop_cores.insert(node.id.clone(), core);
                loop_exits.insert(node.id.clone(), exits);
            }
            let plan = StepPlan {
                waits_for_all: handler.waits_for_all_inputs(&node.parameters),
                outputs: handler.output_ports(&node.parameters),
                optional_inputs,
                handler,
                node: node.clone(),
            };
            plans.insert(node.id.clone(), Arc::new(plan));
        }

        let step_state: StepStateMap = Arc::new(DashMap::new());
        for (id, blob) in &state.step_state {
            step_state.insert(id.clone(), blob.clone());
        }

        Self {
            semaphore: Arc::new(Semaphore::new(sched.limits().max_in_flight.max(1))),
            start_step: state.trigger.start_step_id.clone(),
            seeds: state.trigger.seed_items.clone(),
            sched,
            graph,
            topo,
            plans,
            state,
            deliveries: HashMap::new(),
            consumed: HashSet::new(),
            back_queue: HashMap::new(),
            back_pending: HashSet::new(),
            loop_counts: HashMap::new(),
            loop_bodies,
            loop_cores,
            loop_exits,
            held_exits: HashMap::new(),
            in_flight: HashSet::new(),
            tasks: JoinSet::new(),
            cancel,
            cancelled: false,
            step_state,
        }
    }

    pub(crate) async fn drive(mut self) -> RunState {
        let run_id = self.state.run_id;
        self.state.status = RunStatus::Running;
        self.state.finished_at = None;
        tracing::info!(run_id = %run_id, graph = %self.graph.name, "run started");

        self.prime();
        if self.cancel.is_cancelled() {
            self.cancel_all().await;
        } else {
            self.pump().await;
        }

        while !self.tasks.is_empty() && !self.cancelled {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.cancel_all().await;
                }
                joined = self.tasks.join_next() => {
                    match joined {
                        Some(Ok(outcome)) => self.apply(outcome).await,
                        Some(Err(join_err)) => {
                            tracing::error!(run_id = %run_id, error = %join_err, "step supervisor failed");
                        }
                        None => break,
                    }
                    self.pump().await;
                }
            }
        }

        self.finish()
    }

    // -----------------------------------------------------------------------
    // Setup
    // -----------------------------------------------------------------------

    /// Mark disabled and unreachable steps, then settle every step that is
    /// already terminal (resumed runs carry those over).
    fn prime(&mut self) {
        let graph = Arc::clone(&self.graph);
        let now = Utc::now();

        for node in &graph.steps {
            let Some(record) = self.state.steps.get_mut(&node.id) else {
                continue;
            };
            if record.status == StepStatus::Running {
                record.status = StepStatus::Pending;
            }
            if node.disabled && record.status == StepStatus::Pending {
                record.status = StepStatus::Skipped;
                record.skip_reason = Some(SkipReason::Disabled);
                record.finished_at = Some(now);
            }
        }

        if let Some(start) = self.start_step.clone() {
            let reachable = self.topo.reachable_from(&graph, &start);
            for id in self.topo.order() {
                if reachable.contains(id) {
                    continue;
                }
                if let Some(record) = self.state.steps.get_mut(id) {
                    if record.status == StepStatus::Pending {
                        record.status = StepStatus::Skipped;
                        record.skip_reason = Some(SkipReason::Unreachable);
                        record.finished_at = Some(now);
                    }
                }
            }
        }

        let order = self.topo.order().to_vec();
        for id in &order {
            let Some(record) = self.state.steps.get(id) else {
                continue;
            };
            match record.status {
                StepStatus::Succeeded => {
                    let output = record.output.clone().unwrap_or_default();
                    self.deliver_output(id, &output);
                }
                StepStatus::Skipped => self.deliver_empty(id),
                StepStatus::Failed => {
                    if let Some(error) = record.error.clone() {
                        self.after_failure(id, error);
                    }
                }
                StepStatus::Pending | StepStatus::Running => {}
            }
        }
    }

    // -----------------------------------------------------------------------
    // Launching
    // -----------------------------------------------------------------------

    /// Launch, skip or settle everything that can move, then re-enter loops
    /// whose body went quiet.
    async fn pump(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        loop {
            match self.pass().await {
                Pass::Progress => continue,
                Pass::Blocked => return,
                Pass::Idle => {}
            }
            let loops: Vec<String> = self.back_pending.iter().cloned().collect();
            let mut reentered = false;
            for loop_id in loops {
                if !self.loop_is_quiet(&loop_id) {
                    continue;
                }
                match self.reenter(&loop_id) {
                    Pass::Progress => reentered = true,
                    Pass::Blocked => return,
                    Pass::Idle => {}
                }
            }
            if !reentered && !self.release_exits() {
                return;
            }
        }
    }

    async fn pass(&mut self) -> Pass {
        let mut progressed = false;
        let order = self.topo.order().to_vec();
        for id in &order {
            match self.next_move(id) {
                Move::Wait => {}
                Move::Skip(reason) => {
                    self.skip(id, reason);
                    progressed = true;
                }
                Move::Launch(inputs) => {
                    let Some(permit) = self.try_permit() else {
                        return Pass::Blocked;
                    };
                    self.launch(id, InvocationKind::Full, inputs, permit);
                    progressed = true;
                }
                Move::Arrival(conn, inputs) => {
                    let Some(permit) = self.try_permit() else {
                        return Pass::Blocked;
                    };
                    self.consumed.insert(conn);
                    self.launch(id, InvocationKind::PassThrough, inputs, permit);
                    progressed = true;
                }
                Move::Finalize => {
                    self.finalize_pass_through(id).await;
                    progressed = true;
                }
            }
        }
        if progressed { Pass::Progress } else { Pass::Idle }
    }

    fn is_seeded(&self, step_id: &str) -> bool {
        match &self.start_step {
            Some(start) => start == step_id,
            None => self.topo.is_entry(step_id),
        }
    }

    fn next_move(&self, step_id: &str) -> Move {
        let (Some(plan), Some(status)) = (self.plans.get(step_id), self.state.status_of(step_id))
        else {
            return Move::Wait;
        };
        if status.is_terminal() || self.in_flight.contains(step_id) {
            return Move::Wait;
        }

        if self.is_seeded(step_id) {
            if status != StepStatus::Pending {
                return Move::Wait;
            }
            return Move::Launch(PortBundle::single(MAIN_PORT, self.seeds.clone()));
        }

        let incoming = self.topo.incoming(step_id);

        if plan.waits_for_all {
            let ready = incoming.iter().all(|c| {
                self.deliveries.contains_key(c)
                    || plan
                        .optional_inputs
                        .contains(&self.graph.connections[*c].target_port)
            });
            if !ready {
                return Move::Wait;
            }
            let mut inputs = PortBundle::new();
            for c in incoming {
                if let Some(items) = self.deliveries.get(c) {
                    let port = &self.graph.connections[*c].target_port;
                    inputs.extend_port(port.clone(), items.iter().cloned());
                }
            }
            if inputs.has_no_items() {
                return Move::Skip(SkipReason::NoInputData);
            }
            return Move::Launch(inputs);
        }

        for c in incoming {
            if self.consumed.contains(c) {
                continue;
            }
            if let Some(items) = self.deliveries.get(c) {
                if !items.is_empty() {
                    let port = self.graph.connections[*c].target_port.clone();
                    return Move::Arrival(*c, PortBundle::single(port, items.clone()));
                }
            }
        }
        if incoming.iter().all(|c| self.deliveries.contains_key(c)) {
            Move::Finalize
        } else {
            Move::Wait
        }
    }

    fn try_permit(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).try_acquire_owned().ok()
    }

    fn launch(
        &mut self,
        step_id: &str,
        kind: InvocationKind,
        inputs: PortBundle,
        permit: OwnedSemaphorePermit,
    ) {
        let Some(plan) = self.plans.get(step_id).cloned() else {
            return;
        };
        let iteration = self.loop_counts.get(step_id).copied().unwrap_or(0);
        let ctx = ExecutionContext::new(
            self.state.run_id,
            step_id,
            self.cancel.clone(),
            self.sched.variables().clone(),
            Arc::clone(&self.step_state),
        )
        .with_iteration(iteration);

        if let Some(record) = self.state.steps.get_mut(step_id) {
            if record.status == StepStatus::Pending {
                record.status = StepStatus::Running;
                record.started_at = Some(Utc::now());
            }
        }
        self.state.execution_order.push(step_id.to_string());
        self.in_flight.insert(step_id.to_string());

        let timeout = plan
            .node
            .settings
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.sched.limits().default_step_timeout);

        tracing::debug!(
            run_id = %self.state.run_id,
            step_id,
            iteration,
            items = inputs.item_count(),
            "step launched"
        );

        let job = StepJob {
            step_id: step_id.to_string(),
            kind,
            handler: Arc::clone(&plan.handler),
            params: plan.node.parameters.clone(),
            inputs,
            ctx,
            timeout,
            retry: plan.node.settings.retry.clone(),
            permit,
        };
        self.tasks.spawn(supervise(job));
    }

    // -----------------------------------------------------------------------
    // Applying outcomes
    // -----------------------------------------------------------------------

    async fn apply(&mut self, outcome: TaskOutcome) {
        let TaskOutcome {
            step_id,
            kind,
            inputs,
            result,
            attempts,
            logs,
        } = outcome;
        self.in_flight.remove(&step_id);
        let Some(plan) = self.plans.get(&step_id).cloned() else {
            return;
        };

        if let Some(record) = self.state.steps.get_mut(&step_id) {
            record.attempts = attempts;
            record.invocations += 1;
            record.logs.extend(logs);
        }

        let result = match result {
            Err(err) if plan.node.settings.continue_on_fail && err.kind != StepErrorKind::Cancelled => {
                tracing::warn!(
                    run_id = %self.state.run_id,
                    step_id = %step_id,
                    error = %err,
                    "step failed, continuing with error item"
                );
                Ok(error_bundle(&plan.outputs, &err))
            }
            other => other,
        };

        match (kind, result) {
            (_, Err(err)) => self.fail_step(&step_id, err, Some(inputs)),
            (InvocationKind::Full, Ok(output)) => self.complete(&step_id, output).await,
            (InvocationKind::PassThrough, Ok(output)) => {
                tracing::debug!(
                    run_id = %self.state.run_id,
                    step_id = %step_id,
                    items = output.item_count(),
                    "pass-through invocation finished"
                );
                if let Some(record) = self.state.steps.get_mut(&step_id) {
                    record.output.get_or_insert_with(PortBundle::new).absorb(output);
                }
            }
        }
    }

    async fn complete(&mut self, step_id: &str, output: PortBundle) {
        let run_id = self.state.run_id;
        if let Some(record) = self.state.steps.get_mut(step_id) {
            record.status = StepStatus::Succeeded;
            record.output = Some(output.clone());
            record.error = None;
            record.input = None;
            record.finished_at = Some(Utc::now());
        }
        tracing::debug!(run_id = %run_id, step_id, items = output.item_count(), "step succeeded");

        let blob = self
            .step_state
            .get(step_id)
            .map(|v| v.value().clone())
            .unwrap_or(Value::Null);
        let snapshot = json!({ "output": output, "state": blob });
        if let Err(e) = self.sched.checkpoints().checkpoint(run_id, step_id, snapshot).await {
            tracing::warn!(run_id = %run_id, step_id, error = %e, "failed to record checkpoint");
        }

        self.deliver_output(step_id, &output);
        for &c in self.topo.back_outgoing(step_id) {
            let conn = &self.graph.connections[c];
            self.back_queue
                .entry(conn.target.clone())
                .or_default()
                .extend_port(conn.target_port.clone(), output.get(&conn.source_port).iter().cloned());
            self.back_pending.insert(conn.target.clone());
        }
    }

    async fn finalize_pass_through(&mut self, step_id: &str) {
        let output = self
            .state
            .steps
            .get_mut(step_id)
            .filter(|r| r.invocations > 0)
            .map(|r| r.output.take().unwrap_or_default());
        match output {
            Some(output) => self.complete(step_id, output).await,
            None => self.skip(step_id, SkipReason::NoInputData),
        }
    }

    fn fail_step(&mut self, step_id: &str, error: StepError, inputs: Option<PortBundle>) {
        if let Some(record) = self.state.steps.get_mut(step_id) {
            record.status = StepStatus::Failed;
            record.error = Some(error.clone());
            record.input = inputs;
            record.finished_at = Some(Utc::now());
        }
        tracing::warn!(
            run_id = %self.state.run_id,
            step_id,
            kind = %error.kind,
            error = %error.message,
            "step failed"
        );
        self.after_failure(step_id, error);
    }

    /// Record the run failure and cascade to dependents.
    fn after_failure(&mut self, step_id: &str, error: StepError) {
        self.held_exits.remove(step_id);
        if self.state.failure.is_none() {
            self.state.failure = Some(RunFailure {
                step_id: step_id.to_string(),
                error,
            });
        }
        let aborts = self
            .plans
            .get(step_id)
            .is_none_or(|p| p.node.settings.abort_downstream);
        if aborts {
            let graph = Arc::clone(&self.graph);
            for id in self.topo.downstream(&graph, step_id) {
                if self.state.status_of(&id) == Some(StepStatus::Pending)
                    && !self.in_flight.contains(&id)
                {
                    self.skip(&id, SkipReason::UpstreamFailed);
                }
            }
        }
        self.deliver_empty(step_id);
    }

    fn skip(&mut self, step_id: &str, reason: SkipReason) {
        if let Some(record) = self.state.steps.get_mut(step_id) {
            record.status = StepStatus::Skipped;
            record.skip_reason = Some(reason);
            record.output = None;
            record.finished_at = Some(Utc::now());
        }
        tracing::debug!(run_id = %self.state.run_id, step_id, reason = ?reason, "step skipped");
        self.deliver_empty(step_id);
    }

    fn deliver_forward(&mut self, step_id: &str, output: &PortBundle) {
        for &c in self.topo.outgoing(step_id) {
            let port = &self.graph.connections[c].source_port;
            self.deliveries.insert(c, output.get(port).to_vec());
            self.consumed.remove(&c);
        }
    }

    fn deliver_output(&mut self, step_id: &str, output: &PortBundle) {
        match self.loop_exits.get(step_id).cloned() {
            Some(exits) => self.deliver_loop_output(step_id, output, &exits),
            None => self.deliver_forward(step_id, output),
        }
    }

    /// Deliver a loop step's output into its core now; hold what leaves
    /// the loop until the final iteration.
    fn deliver_loop_output(&mut self, step_id: &str, output: &PortBundle, exits: &HashSet<usize>) {
        let mut held = Vec::new();
        for &c in self.topo.outgoing(step_id) {
            let port = &self.graph.connections[c].source_port;
            let items = output.get(port).to_vec();
            if exits.contains(&c) {
                held.push((c, items));
            } else {
                self.deliveries.insert(c, items);
                self.consumed.remove(&c);
            }
        }
        self.held_exits.insert(step_id.to_string(), held);
    }

    fn deliver_empty(&mut self, step_id: &str) {
        for &c in self.topo.outgoing(step_id) {
            self.deliveries.insert(c, Vec::new());
            self.consumed.remove(&c);
        }
    }

    // -----------------------------------------------------------------------
    // Loops
    // -----------------------------------------------------------------------

    fn loop_is_quiet(&self, loop_id: &str) -> bool {
        if self.in_flight.contains(loop_id)
            || self.state.status_of(loop_id) != Some(StepStatus::Succeeded)
        {
            return false;
        }
        self.loop_bodies.get(loop_id).is_some_and(|body| {
            body.iter().all(|id| {
                !self.in_flight.contains(id)
                    && self.state.status_of(id) != Some(StepStatus::Running)
            })
        })
    }

    /// Every core step has settled for this iteration.
    fn loop_core_settled(&self, loop_id: &str) -> bool {
        self.loop_cores.get(loop_id).is_none_or(|core| {
            core.iter().all(|id| {
                !self.in_flight.contains(id)
                    && self.state.status_of(id).is_none_or(|s| s.is_terminal())
            })
        })
    }

    /// Deliver held exits of loops that finished iterating: quiet, settled
    /// and with nothing queued on their back-edges.
    fn release_exits(&mut self) -> bool {
        let finished: Vec<String> = self
            .held_exits
            .keys()
            .filter(|id| {
                !self.back_pending.contains(*id)
                    && self.loop_is_quiet(id)
                    && self.loop_core_settled(id)
            })
            .cloned()
            .collect();
        for loop_id in &finished {
            let Some(held) = self.held_exits.remove(loop_id) else {
                continue;
            };
            for (c, items) in held {
                self.deliveries.insert(c, items);
                self.consumed.remove(&c);
            }
            tracing::debug!(
                run_id = %self.state.run_id,
                step_id = %loop_id,
                iterations = self.loop_counts.get(loop_id).copied().unwrap_or(0) + 1,
                "loop finished"
            );
        }
        !finished.is_empty()
    }

    /// Reset the loop body and invoke the loop step with its back-edge items.
    fn reenter(&mut self, loop_id: &str) -> Pass {
        let limit = self.sched.limits().max_loop_iterations;
        let next = self.loop_counts.get(loop_id).copied().unwrap_or(0) + 1;

        if next > limit {
            self.back_pending.remove(loop_id);
            self.back_queue.remove(loop_id);
            self.fail_step(loop_id, StepError::iteration_limit(limit), None);
            return Pass::Progress;
        }
        let Some(permit) = self.try_permit() else {
            return Pass::Blocked;
        };
        self.loop_counts.insert(loop_id.to_string(), next);

        let body = self.loop_bodies.get(loop_id).cloned().unwrap_or_default();
        for id in &body {
            if let Some(record) = self.state.steps.get_mut(id) {
                if record.status == StepStatus::Skipped
                    && matches!(record.skip_reason, Some(SkipReason::Disabled | SkipReason::Unreachable))
                {
                    continue;
                }
                record.status = StepStatus::Pending;
                record.output = None;
                record.error = None;
                record.skip_reason = None;
                record.started_at = None;
                record.finished_at = None;
            }
        }
        for (c, conn) in self.graph.connections.iter().enumerate() {
            if self.topo.is_back_edge(c) {
                continue;
            }
            if conn.source == loop_id || body.contains(&conn.source) {
                self.deliveries.remove(&c);
                self.consumed.remove(&c);
            }
        }

        let inputs = self.back_queue.remove(loop_id).unwrap_or_default();
        self.back_pending.remove(loop_id);
        self.held_exits.remove(loop_id);
        if let Some(record) = self.state.steps.get_mut(loop_id) {
            record.status = StepStatus::Pending;
        }
        tracing::debug!(
            run_id = %self.state.run_id,
            step_id = loop_id,
            iteration = next,
            "loop re-entered"
        );
        self.launch(loop_id, InvocationKind::Full, inputs, permit);
        Pass::Progress
    }

    // -----------------------------------------------------------------------
    // Cancellation and completion
    // -----------------------------------------------------------------------

    async fn cancel_all(&mut self) {
        self.cancelled = true;
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        self.in_flight.clear();

        let now = Utc::now();
        for (id, record) in self.state.steps.iter_mut() {
            match record.status {
                StepStatus::Running => {
                    record.status = StepStatus::Failed;
                    record.error = Some(StepError::cancelled());
                    record.finished_at = Some(now);
                }
                StepStatus::Pending => {
                    record.status = StepStatus::Skipped;
                    record.skip_reason = Some(SkipReason::Cancelled);
                    record.finished_at = Some(now);
                }
                _ => continue,
            }
            tracing::debug!(run_id = %self.state.run_id, step_id = %id, "step cancelled");
        }
    }

    fn finish(mut self) -> RunState {
        let leftover = if self.cancelled {
            SkipReason::Cancelled
        } else if self.state.failure.is_some() {
            SkipReason::UpstreamFailed
        } else {
            SkipReason::NoInputData
        };
        let now = Utc::now();
        for (id, record) in self.state.steps.iter_mut() {
            if record.status == StepStatus::Pending {
                tracing::debug!(run_id = %self.state.run_id, step_id = %id, "step never became eligible");
                record.status = StepStatus::Skipped;
                record.skip_reason = Some(leftover);
                record.finished_at = Some(now);
            }
        }

        self.state.status = if self.cancelled {
            RunStatus::Cancelled
        } else if self.state.failure.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        self.state.step_state = self
            .step_state
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        self.state.finished_at = Some(now);

        tracing::info!(
            run_id = %self.state.run_id,
            status = self.state.status.as_str(),
            steps = self.state.steps.len(),
            "run finished"
        );
        self.state
    }
}

/// Output of a failed step with continue-on-fail set: one error item on the
/// first output port, every other port empty.
fn error_bundle(outputs: &[String], err: &StepError) -> PortBundle {
    let mut bundle = PortBundle::new();
    for (i, port) in outputs.iter().enumerate() {
        let items = if i == 0 {
            vec![Item::error(err.kind.as_str(), &err.message)]
        } else {
            Vec::new()
        };
        bundle.insert(port.clone(), items);
    }
    bundle
}
