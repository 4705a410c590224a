//! One step invocation as a spawned unit of work.
//!
//! The task owns everything it needs (handler, parameters, inputs,
//! context), applies the per-attempt deadline through [`run_with_deadline`]
//! and retries retryable failures according to the step's policy. It never
//! touches run state; the driver applies the [`TaskOutcome`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;

use switchyard_types::error::StepError;
use switchyard_types::graph::RetryPolicy;
use switchyard_types::item::{ParamBag, PortBundle};

use crate::deadline::{DeadlineError, run_with_deadline};
use crate::retry::{RetryAction, RetryHandler};
use crate::step::{ExecutionContext, StepHandlerDyn};

/// How the driver should apply a finished invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InvocationKind {
    /// Regular invocation with all inputs gathered.
    Full,
    /// One arrival of a step that does not wait for all inputs.
    PassThrough,
}

pub(crate) struct StepJob {
    pub step_id: String,
    pub kind: InvocationKind,
    pub handler: Arc<dyn StepHandlerDyn>,
    pub params: ParamBag,
    pub inputs: PortBundle,
    pub ctx: ExecutionContext,
    pub timeout: Duration,
    pub retry: Option<RetryPolicy>,
    pub permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub(crate) struct TaskOutcome {
    pub step_id: String,
    pub kind: InvocationKind,
    pub inputs: PortBundle,
    pub result: Result<PortBundle, StepError>,
    pub attempts: u32,
    pub logs: Vec<String>,
}

/// Aborts the wrapped task when dropped, so aborting the supervisor also
/// stops the step.
struct AbortOnDrop(JoinHandle<TaskOutcome>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run `job` on its own task and turn a panic into a failed outcome that
/// still names the step.
pub(crate) async fn supervise(job: StepJob) -> TaskOutcome {
    let step_id = job.step_id.clone();
    let kind = job.kind;
    let inputs = job.inputs.clone();

    let mut guard = AbortOnDrop(tokio::spawn(run_job(job)));
    match (&mut guard.0).await {
        Ok(outcome) => outcome,
        Err(join_err) => TaskOutcome {
            step_id,
            kind,
            inputs,
            result: Err(StepError::execution(format!("step task failed: {join_err}"))),
            attempts: 1,
            logs: Vec::new(),
        },
    }
}

async fn run_job(job: StepJob) -> TaskOutcome {
    let StepJob {
        step_id,
        kind,
        handler,
        params,
        inputs,
        ctx,
        timeout,
        retry,
        permit,
    } = job;
    let cancel = ctx.cancellation().clone();

    let mut attempt = 0u32;
    let result = loop {
        attempt += 1;
        tracing::debug!(run_id = %ctx.run_id(), step_id = %step_id, attempt, "step attempt");

        let outcome = run_with_deadline(timeout, &cancel, |_abort| {
            handler.execute_boxed(inputs.clone(), &params, &ctx)
        })
        .await;

        let err = match outcome {
            Ok(Ok(output)) => break Ok(output),
            Ok(Err(err)) => err,
            Err(DeadlineError::TimedOut(limit)) => {
                StepError::timeout(format!("step exceeded its {}ms deadline", limit.as_millis()))
            }
            Err(DeadlineError::Cancelled) => break Err(StepError::cancelled()),
        };

        match RetryHandler::next_action(retry.as_ref(), attempt, &err) {
            RetryAction::GiveUp => break Err(err),
            RetryAction::RetryAfter(delay) => {
                tracing::warn!(
                    run_id = %ctx.run_id(),
                    step_id = %step_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "step attempt failed, retrying"
                );
                ctx.logger().warn(&format!("attempt {attempt} failed: {err}"));
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Err(StepError::cancelled()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    };
    drop(permit);

    TaskOutcome {
        logs: ctx.logger().take_lines(),
        step_id,
        kind,
        inputs,
        result,
        attempts: attempt,
    }
}
