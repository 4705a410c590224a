use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use switchyard_types::error::{StepError, StepErrorKind};
use switchyard_types::graph::{Graph, RetryPolicy, StepNode, StepSettings};
use switchyard_types::item::{Item, MAIN_PORT, ParamBag, PortBundle};
use switchyard_types::run::{RunState, RunStatus, SkipReason, StepStatus};
use switchyard_types::trigger::TriggerEvent;

use super::*;
use crate::step::{ExecutionContext, PortSpec, StepDescriptor, StepHandler};

// ---------------------------------------------------------------------------
// Test steps
// ---------------------------------------------------------------------------

struct AlwaysFail {
    descriptor: StepDescriptor,
}

impl AlwaysFail {
    fn new() -> Self {
        Self {
            descriptor: StepDescriptor::simple("always_fail", "Always Fail"),
        }
    }
}

impl StepHandler for AlwaysFail {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        _inputs: PortBundle,
        _params: &ParamBag,
        _ctx: &ExecutionContext,
    ) -> Result<PortBundle, StepError> {
        Err(StepError::execution("boom"))
    }
}

/// Fails with a rate-limited network error until it has been called
/// `failures` times.
struct Flaky {
    descriptor: StepDescriptor,
    failures: u32,
    calls: Arc<AtomicU32>,
}

impl StepHandler for Flaky {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        mut inputs: PortBundle,
        _params: &ParamBag,
        _ctx: &ExecutionContext,
    ) -> Result<PortBundle, StepError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(StepError::network("429 too many requests")
                .with_retry_after(Duration::from_millis(30)));
        }
        Ok(PortBundle::single(MAIN_PORT, inputs.take(MAIN_PORT)))
    }
}

/// Tracks how many invocations overlap.
struct Probe {
    descriptor: StepDescriptor,
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl StepHandler for Probe {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        mut inputs: PortBundle,
        _params: &ParamBag,
        _ctx: &ExecutionContext,
    ) -> Result<PortBundle, StepError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(PortBundle::single(MAIN_PORT, inputs.take(MAIN_PORT)))
    }
}

/// Records the size of every batch it sees.
struct Recorder {
    descriptor: StepDescriptor,
    sizes: Arc<Mutex<Vec<usize>>>,
}

impl StepHandler for Recorder {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        mut inputs: PortBundle,
        _params: &ParamBag,
        _ctx: &ExecutionContext,
    ) -> Result<PortBundle, StepError> {
        let items = inputs.take(MAIN_PORT);
        self.sizes.lock().unwrap().push(items.len());
        Ok(PortBundle::single(MAIN_PORT, items))
    }
}

/// Required `main` input plus an optional `extra`; reports how many items
/// each port carried when it ran.
struct Annotate {
    descriptor: StepDescriptor,
}

impl Annotate {
    fn new() -> Self {
        let mut descriptor = StepDescriptor::simple("annotate", "Annotate");
        descriptor.inputs.push(PortSpec::optional("extra"));
        Self { descriptor }
    }
}

impl StepHandler for Annotate {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        inputs: PortBundle,
        _params: &ParamBag,
        _ctx: &ExecutionContext,
    ) -> Result<PortBundle, StepError> {
        let counts = json!({
            "main": inputs.get(MAIN_PORT).len(),
            "extra": inputs.get("extra").len(),
        });
        Ok(PortBundle::single(MAIN_PORT, vec![Item::new(counts)]))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    scheduler: Scheduler,
    flaky_calls: Arc<AtomicU32>,
    peak: Arc<AtomicUsize>,
    sizes: Arc<Mutex<Vec<usize>>>,
}

fn harness_with(limits: SchedulerLimits) -> Harness {
    let flaky_calls = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let sizes = Arc::new(Mutex::new(Vec::new()));

    let mut registry = StepRegistry::with_builtins();
    registry.register(AlwaysFail::new());
    registry.register(Flaky {
        descriptor: StepDescriptor::simple("flaky", "Flaky"),
        failures: 2,
        calls: Arc::clone(&flaky_calls),
    });
    registry.register(Probe {
        descriptor: StepDescriptor::simple("probe", "Probe"),
        current: Arc::new(AtomicUsize::new(0)),
        peak: Arc::clone(&peak),
    });
    registry.register(Recorder {
        descriptor: StepDescriptor::simple("record", "Record"),
        sizes: Arc::clone(&sizes),
    });
    registry.register(Annotate::new());

    let scheduler = Scheduler::new(
        Arc::new(registry),
        CheckpointManager::in_memory(),
        Arc::new(StaticVariables::new()),
    )
    .with_limits(limits);

    Harness {
        scheduler,
        flaky_calls,
        peak,
        sizes,
    }
}

fn harness() -> Harness {
    harness_with(SchedulerLimits::default())
}

fn step(id: &str, ty: &str) -> StepNode {
    StepNode::new(id, ty)
}

fn seeds(values: Vec<Value>) -> Vec<Item> {
    values.into_iter().map(Item::new).collect()
}

async fn run(h: &Harness, graph: Graph, seed: Vec<Item>) -> RunState {
    h.scheduler
        .run(graph, TriggerEvent::manual(seed), CancellationToken::new())
        .await
        .expect("graph should be valid")
}

fn payloads(state: &RunState, step_id: &str) -> Vec<Value> {
    state
        .output_of(step_id)
        .map(|out| out.get(MAIN_PORT).iter().map(|i| i.payload.clone()).collect())
        .unwrap_or_default()
}

fn first_launch(state: &RunState, step_id: &str) -> usize {
    state
        .execution_order
        .iter()
        .position(|s| s == step_id)
        .unwrap_or_else(|| panic!("{step_id} never launched"))
}

fn diamond(b_type: &str) -> Graph {
    Graph::new("diamond")
        .with_step(step("a", "manual_trigger"))
        .with_step(step("b", b_type))
        .with_step(step("c", "no_op"))
        .with_step(step("d", "merge"))
        .connect("a", "b")
        .connect("a", "c")
        .connect_ports("b", "main", "d", "input1")
        .connect_ports("c", "main", "d", "input2")
}

fn batch_loop(size: u64) -> Graph {
    Graph::new("loop")
        .with_step(step("start", "manual_trigger"))
        .with_step(step("batch", "split_in_batches").with_param("batch_size", json!(size)))
        .with_step(step("work", "record"))
        .with_step(step("after", "no_op"))
        .connect("start", "batch")
        .connect_ports("batch", "loop", "work", "main")
        .connect_ports("work", "main", "batch", "continue")
        .connect_ports("batch", "done", "after", "main")
}

// ---------------------------------------------------------------------------
// Ordering and data flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn linear_graph_flows_items_in_order() {
    let h = harness();
    let graph = Graph::new("linear")
        .with_step(step("a", "manual_trigger"))
        .with_step(step("b", "set").with_param("values", json!({"seen": true})))
        .with_step(step("c", "no_op"))
        .connect("a", "b")
        .connect("b", "c");

    let state = run(&h, graph, seeds(vec![json!({"n": 1}), json!({"n": 2})])).await;

    assert_eq!(state.status, RunStatus::Succeeded);
    assert_eq!(
        payloads(&state, "c"),
        vec![json!({"n": 1, "seen": true}), json!({"n": 2, "seen": true})]
    );
    assert_eq!(state.execution_order, vec!["a", "b", "c"]);
    assert!(state.finished_at.is_some());
}

#[tokio::test]
async fn execution_order_respects_connections() {
    let h = harness();
    let graph = diamond("no_op");
    let state = run(&h, graph.clone(), seeds(vec![json!({"x": 1})])).await;

    assert_eq!(state.status, RunStatus::Succeeded);
    for conn in &graph.connections {
        assert!(first_launch(&state, &conn.source) < first_launch(&state, &conn.target));
    }
    assert_eq!(payloads(&state, "d").len(), 2);
}

#[tokio::test]
async fn successful_steps_are_checkpointed() {
    let h = harness();
    let state = run(&h, diamond("no_op"), seeds(vec![json!(1)])).await;

    let checkpoints = h.scheduler.checkpoints().list(state.run_id).await.unwrap();
    assert_eq!(checkpoints.len(), 4);
    let a = checkpoints.iter().find(|c| c.step_id == "a").unwrap();
    assert_eq!(a.state["output"]["main"][0]["payload"], json!(1));
    assert_eq!(a.state["state"], Value::Null);
}

#[tokio::test]
async fn append_merge_ignores_completion_order() {
    let h = harness();
    // The first input is slower, yet still comes first.
    let graph = Graph::new("merge")
        .with_step(step("a", "manual_trigger"))
        .with_step(step("slow", "wait").with_param("ms", json!(40)))
        .with_step(step("tag_slow", "set").with_param("values", json!({"src": "slow"})))
        .with_step(step("tag_fast", "set").with_param("values", json!({"src": "fast"})))
        .with_step(step("m", "merge"))
        .connect("a", "slow")
        .connect("slow", "tag_slow")
        .connect("a", "tag_fast")
        .connect_ports("tag_slow", "main", "m", "input1")
        .connect_ports("tag_fast", "main", "m", "input2");

    let state = run(&h, graph, seeds(vec![json!({})])).await;
    let sources: Vec<Value> = payloads(&state, "m").iter().map(|p| p["src"].clone()).collect();
    assert_eq!(sources, vec![json!("slow"), json!("fast")]);
}

#[tokio::test]
async fn by_position_merge_pads_shorter_branch() {
    let h = harness();
    let graph = Graph::new("by_position")
        .with_step(step("a", "manual_trigger"))
        .with_step(step("left", "set").with_param("values", json!({"a": 1})))
        .with_step(step("right", "set").with_param("values", json!({"b": 2})))
        .with_step(step("m", "merge").with_param("mode", json!("by_position")))
        .connect("a", "left")
        .connect("a", "right")
        .connect_ports("left", "main", "m", "input1")
        .connect_ports("right", "main", "m", "input2");

    let state = run(&h, graph, seeds(vec![json!({}), json!({})])).await;
    assert_eq!(
        payloads(&state, "m"),
        vec![json!({"a": 1, "b": 2}), json!({"a": 1, "b": 2})]
    );
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

fn fan_out(width: usize) -> Graph {
    let mut graph = Graph::new("fan_out").with_step(step("a", "manual_trigger"));
    for i in 0..width {
        let id = format!("p{i}");
        graph = graph.with_step(step(&id, "probe")).connect("a", &id);
    }
    graph
}

#[tokio::test]
async fn independent_branches_run_concurrently() {
    let h = harness();
    let state = run(&h, fan_out(4), seeds(vec![json!(1)])).await;
    assert_eq!(state.status, RunStatus::Succeeded);
    assert!(h.peak.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn max_in_flight_bounds_concurrency() {
    let h = harness_with(SchedulerLimits {
        max_in_flight: 2,
        ..SchedulerLimits::default()
    });
    let state = run(&h, fan_out(6), seeds(vec![json!(1)])).await;

    assert_eq!(state.status, RunStatus::Succeeded);
    assert_eq!(state.steps_with_status(StepStatus::Succeeded).len(), 7);
    assert!(h.peak.load(Ordering::SeqCst) <= 2);
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_branch_skips_dependents_but_not_siblings() {
    let h = harness();
    let state = run(&h, diamond("always_fail"), seeds(vec![json!(1)])).await;

    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.status_of("b"), Some(StepStatus::Failed));
    assert_eq!(state.status_of("c"), Some(StepStatus::Succeeded));
    assert_eq!(state.status_of("d"), Some(StepStatus::Skipped));
    assert_eq!(state.record("d").unwrap().skip_reason, Some(SkipReason::UpstreamFailed));

    let failure = state.failure.as_ref().unwrap();
    assert_eq!(failure.step_id, "b");
    assert_eq!(failure.error.kind, StepErrorKind::Execution);
    // The failed step keeps what it was given.
    let input = state.record("b").unwrap().input.as_ref().unwrap();
    assert_eq!(input.get(MAIN_PORT).len(), 1);
}

#[tokio::test]
async fn failure_without_abort_lets_dependents_run_on_empty_input() {
    let h = harness();
    let mut graph = diamond("always_fail");
    graph.steps[1].settings = StepSettings {
        abort_downstream: false,
        ..StepSettings::default()
    };
    let state = run(&h, graph, seeds(vec![json!(1)])).await;

    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.status_of("d"), Some(StepStatus::Succeeded));
    assert_eq!(payloads(&state, "d"), vec![json!(1)]);
}

#[tokio::test]
async fn continue_on_fail_emits_error_item() {
    let h = harness();
    let graph = Graph::new("g")
        .with_step(step("a", "manual_trigger"))
        .with_step(step("b", "always_fail").with_settings(StepSettings {
            continue_on_fail: true,
            ..StepSettings::default()
        }))
        .with_step(step("c", "no_op"))
        .connect("a", "b")
        .connect("b", "c");

    let state = run(&h, graph, seeds(vec![json!(1)])).await;

    assert_eq!(state.status, RunStatus::Succeeded);
    assert_eq!(state.status_of("b"), Some(StepStatus::Succeeded));
    assert_eq!(
        payloads(&state, "c"),
        vec![json!({"error": {"kind": "execution", "message": "boom"}})]
    );
}

#[tokio::test]
async fn retry_honors_retry_after() {
    let h = harness();
    let graph = Graph::new("g")
        .with_step(step("a", "manual_trigger"))
        .with_step(step("b", "flaky").with_settings(StepSettings {
            retry: Some(RetryPolicy {
                max_attempts: 3,
                backoff_ms: 1,
                exponential: false,
            }),
            ..StepSettings::default()
        }))
        .connect("a", "b");

    let started = Instant::now();
    let state = run(&h, graph, seeds(vec![json!(1)])).await;

    assert_eq!(state.status, RunStatus::Succeeded);
    assert_eq!(state.record("b").unwrap().attempts, 3);
    assert_eq!(h.flaky_calls.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_millis(60));
}

#[tokio::test]
async fn retryable_error_without_policy_fails_once() {
    let h = harness();
    let graph = Graph::new("g")
        .with_step(step("a", "manual_trigger"))
        .with_step(step("b", "flaky"))
        .connect("a", "b");

    let state = run(&h, graph, seeds(vec![json!(1)])).await;
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(h.flaky_calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.failure.unwrap().error.kind, StepErrorKind::Network);
}

#[tokio::test]
async fn step_timeout_is_retryable_timeout() {
    let h = harness();
    let graph = Graph::new("g")
        .with_step(step("a", "manual_trigger"))
        .with_step(
            step("slow", "wait")
                .with_param("ms", json!(5_000))
                .with_settings(StepSettings {
                    timeout_ms: Some(30),
                    ..StepSettings::default()
                }),
        )
        .connect("a", "slow");

    let started = Instant::now();
    let state = run(&h, graph, seeds(vec![json!(1)])).await;

    assert!(started.elapsed() < Duration::from_secs(2));
    let error = state.record("slow").unwrap().error.clone().unwrap();
    assert_eq!(error.kind, StepErrorKind::Timeout);
    assert!(error.retryable);
}

// ---------------------------------------------------------------------------
// Skips
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_branch_is_skipped_with_no_input_data() {
    let h = harness();
    let graph = Graph::new("branch")
        .with_step(step("a", "manual_trigger"))
        .with_step(step("check", "if").with_param("condition", json!("item.flag == true")))
        .with_step(step("yes", "no_op"))
        .with_step(step("no", "no_op"))
        .connect("a", "check")
        .connect_ports("check", "true", "yes", "main")
        .connect_ports("check", "false", "no", "main");

    let state = run(&h, graph, seeds(vec![json!({"flag": true})])).await;

    assert_eq!(state.status, RunStatus::Succeeded);
    assert_eq!(state.status_of("yes"), Some(StepStatus::Succeeded));
    assert_eq!(state.record("no").unwrap().skip_reason, Some(SkipReason::NoInputData));
}

#[tokio::test]
async fn disabled_step_is_skipped() {
    let h = harness();
    let graph = Graph::new("g")
        .with_step(step("a", "manual_trigger"))
        .with_step(step("b", "no_op").disabled())
        .with_step(step("c", "no_op"))
        .connect("a", "b")
        .connect("b", "c");

    let state = run(&h, graph, seeds(vec![json!(1)])).await;

    assert_eq!(state.status, RunStatus::Succeeded);
    assert_eq!(state.record("b").unwrap().skip_reason, Some(SkipReason::Disabled));
    assert_eq!(state.record("c").unwrap().skip_reason, Some(SkipReason::NoInputData));
}

#[tokio::test]
async fn start_step_runs_only_its_downstream() {
    let h = harness();
    let graph = Graph::new("g")
        .with_step(step("a", "manual_trigger"))
        .with_step(step("b", "set").with_param("values", json!({"b": true})))
        .with_step(step("c", "no_op"))
        .connect("a", "b")
        .connect("b", "c");

    let event = TriggerEvent::manual(seeds(vec![json!({"n": 7})])).starting_at("b");
    let state = h
        .scheduler
        .run(graph, event, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(state.status, RunStatus::Succeeded);
    assert_eq!(state.record("a").unwrap().skip_reason, Some(SkipReason::Unreachable));
    assert_eq!(payloads(&state, "c"), vec![json!({"n": 7, "b": true})]);
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

#[tokio::test]
async fn split_in_batches_loops_until_drained() {
    let h = harness();
    let items = seeds((1..=5).map(|n| json!({"n": n})).collect());
    let state = run(&h, batch_loop(2), items).await;

    assert_eq!(state.status, RunStatus::Succeeded);
    assert_eq!(*h.sizes.lock().unwrap(), vec![2, 2, 1]);

    let done: Vec<Value> = payloads(&state, "after").iter().map(|p| p["n"].clone()).collect();
    assert_eq!(done, vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);
    assert_eq!(state.record("batch").unwrap().invocations, 4);
    assert_eq!(state.record("work").unwrap().invocations, 3);
    assert_eq!(state.record("work").unwrap().skip_reason, Some(SkipReason::NoInputData));
    assert!(state.step_state.get("batch").is_none());
}

#[tokio::test]
async fn steps_after_loop_exit_run_once_on_final_output() {
    let h = harness();
    let graph = Graph::new("loop-exit")
        .with_step(step("start", "manual_trigger"))
        .with_step(step("batch", "split_in_batches").with_param("batch_size", json!(1)))
        .with_step(step("work", "no_op"))
        .with_step(step("m", "merge"))
        .with_step(step("sink", "record"))
        .connect("start", "batch")
        .connect_ports("batch", "loop", "work", "main")
        .connect_ports("work", "main", "batch", "continue")
        .connect_ports("batch", "done", "m", "input1")
        .connect_ports("start", "main", "m", "input2")
        .connect("m", "sink");
    let items = seeds((1..=3).map(|n| json!({"n": n})).collect());

    let state = run(&h, graph, items).await;

    assert_eq!(state.status, RunStatus::Succeeded);
    assert_eq!(state.record("batch").unwrap().invocations, 4);
    assert_eq!(state.record("m").unwrap().invocations, 1);
    assert_eq!(state.record("sink").unwrap().invocations, 1);
    assert_eq!(*h.sizes.lock().unwrap(), vec![6]);

    let checkpoints = h.scheduler.checkpoints().list(state.run_id).await.unwrap();
    let merged = checkpoints.iter().find(|c| c.step_id == "m").unwrap();
    assert_eq!(merged.state["output"]["main"].as_array().unwrap().len(), 6);
}

#[tokio::test]
async fn loop_ceiling_fails_with_iteration_limit() {
    let h = harness_with(SchedulerLimits {
        max_loop_iterations: 2,
        ..SchedulerLimits::default()
    });
    let items = seeds((1..=5).map(|n| json!({"n": n})).collect());
    let state = run(&h, batch_loop(2), items).await;

    assert_eq!(state.status, RunStatus::Failed);
    let failure = state.failure.as_ref().unwrap();
    assert_eq!(failure.step_id, "batch");
    assert_eq!(failure.error.kind, StepErrorKind::IterationLimitExceeded);
    assert!(!failure.error.retryable);
}

// ---------------------------------------------------------------------------
// Optional inputs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn optional_port_does_not_hold_a_step_back() {
    let h = harness();
    let graph = Graph::new("optional")
        .with_step(step("a", "manual_trigger"))
        .with_step(step("slow", "wait").with_param("ms", json!(300)))
        .with_step(step("note", "annotate"))
        .connect("a", "slow")
        .connect_ports("a", "main", "note", "main")
        .connect_ports("slow", "main", "note", "extra");

    let state = run(&h, graph, seeds(vec![json!(1)])).await;

    assert_eq!(state.status, RunStatus::Succeeded);
    assert_eq!(payloads(&state, "note"), vec![json!({"main": 1, "extra": 0})]);
    let note = state.record("note").unwrap();
    let slow = state.record("slow").unwrap();
    assert_eq!(note.invocations, 1);
    assert!(note.finished_at.unwrap() < slow.finished_at.unwrap());
}

#[tokio::test]
async fn required_port_still_gates_a_step_with_optional_inputs() {
    let h = harness();
    let graph = Graph::new("optional")
        .with_step(step("a", "manual_trigger"))
        .with_step(step("slow", "wait").with_param("ms", json!(50)))
        .with_step(step("note", "annotate"))
        .connect("a", "slow")
        .connect_ports("slow", "main", "note", "main")
        .connect_ports("a", "main", "note", "extra");

    let state = run(&h, graph, seeds(vec![json!(1)])).await;

    assert_eq!(state.status, RunStatus::Succeeded);
    assert_eq!(payloads(&state, "note"), vec![json!({"main": 1, "extra": 1})]);
    let note = state.record("note").unwrap();
    let slow = state.record("slow").unwrap();
    assert!(note.started_at.unwrap() >= slow.finished_at.unwrap());
}

// ---------------------------------------------------------------------------
// Pass-through and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn non_waiting_merge_runs_once_per_arrival() {
    let h = harness();
    let graph = Graph::new("pass")
        .with_step(step("a", "manual_trigger"))
        .with_step(step("slow", "wait").with_param("ms", json!(30)))
        .with_step(step("fast", "no_op"))
        .with_step(step("m", "merge").with_param("wait_for_all", json!(false)))
        .with_step(step("after", "no_op"))
        .connect("a", "slow")
        .connect("a", "fast")
        .connect_ports("slow", "main", "m", "input1")
        .connect_ports("fast", "main", "m", "input2")
        .connect("m", "after");

    let state = run(&h, graph, seeds(vec![json!(1)])).await;

    assert_eq!(state.status, RunStatus::Succeeded);
    assert_eq!(state.record("m").unwrap().invocations, 2);
    assert_eq!(payloads(&state, "after").len(), 2);
}

#[tokio::test]
async fn cancellation_stops_running_and_pending_steps() {
    let h = harness();
    let graph = Graph::new("g")
        .with_step(step("a", "manual_trigger"))
        .with_step(step("slow", "wait").with_param("ms", json!(10_000)))
        .with_step(step("c", "no_op"))
        .connect("a", "slow")
        .connect("slow", "c");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let state = h
        .scheduler
        .run(graph, TriggerEvent::manual(seeds(vec![json!(1)])), cancel)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(state.status, RunStatus::Cancelled);
    assert_eq!(state.status_of("a"), Some(StepStatus::Succeeded));
    let slow = state.record("slow").unwrap();
    assert_eq!(slow.status, StepStatus::Failed);
    assert_eq!(slow.error.as_ref().unwrap().kind, StepErrorKind::Cancelled);
    assert_eq!(state.record("c").unwrap().skip_reason, Some(SkipReason::Cancelled));
}

#[tokio::test]
async fn invalid_graph_is_never_executed() {
    let h = harness();
    let graph = Graph::new("bad")
        .with_step(step("a", "manual_trigger"))
        .connect("a", "ghost");
    let err = h
        .scheduler
        .run(graph, TriggerEvent::manual(vec![]), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(!err.is_valid());
}
