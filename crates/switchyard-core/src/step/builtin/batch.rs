//! `split_in_batches`: the iterative loop step.
//!
//! Items arriving on `main` are queued in the step's state blob. Each
//! invocation emits the next `batch_size` items on `loop`; the loop body
//! feeds its results back through the `continue` back-edge, which re-enters
//! this step. Once the queue is drained, everything collected from the body
//! is emitted on `done` and the state is cleared.

use serde::{Deserialize, Serialize};
use switchyard_types::error::StepError;
use switchyard_types::item::{Item, MAIN_PORT, ParamBag, PortBundle};

use super::param_u64;
use crate::step::{ExecutionContext, PortSpec, StepDescriptor, StepHandler};

pub const LOOP_PORT: &str = "loop";
pub const DONE_PORT: &str = "done";
pub const CONTINUE_PORT: &str = "continue";

const DEFAULT_BATCH_SIZE: u64 = 10;

#[derive(Debug, Default, Serialize, Deserialize)]
struct BatchState {
    queue: Vec<Item>,
    processed: Vec<Item>,
    emitted: u32,
}

pub struct SplitInBatchesStep {
    descriptor: StepDescriptor,
}

impl SplitInBatchesStep {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor {
                type_name: "split_in_batches".to_string(),
                display_name: "Split In Batches".to_string(),
                inputs: vec![
                    PortSpec::required(MAIN_PORT),
                    PortSpec::back_edge(CONTINUE_PORT),
                ],
                outputs: vec![LOOP_PORT.to_string(), DONE_PORT.to_string()],
                iterative: true,
                standalone: false,
            },
        }
    }

    fn load_state(ctx: &ExecutionContext) -> Result<BatchState, StepError> {
        match ctx.state() {
            Some(raw) => serde_json::from_value(raw)
                .map_err(|e| StepError::execution(format!("corrupt batch state: {e}"))),
            None => Ok(BatchState::default()),
        }
    }
}

impl Default for SplitInBatchesStep {
    fn default() -> Self {
        Self::new()
    }
}

impl StepHandler for SplitInBatchesStep {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        mut inputs: PortBundle,
        params: &ParamBag,
        ctx: &ExecutionContext,
    ) -> Result<PortBundle, StepError> {
        let batch_size = param_u64(params, "batch_size")?.unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(StepError::validation("batch_size must be at least 1"));
        }

        let fresh = inputs.take(MAIN_PORT);
        let mut state = if fresh.is_empty() {
            Self::load_state(ctx)?
        } else {
            BatchState {
                queue: fresh,
                ..BatchState::default()
            }
        };
        state.processed.extend(inputs.take(CONTINUE_PORT));

        let take = usize::try_from(batch_size)
            .unwrap_or(usize::MAX)
            .min(state.queue.len());
        let batch: Vec<Item> = state.queue.drain(..take).collect();

        let mut out = PortBundle::new();
        if batch.is_empty() {
            ctx.logger().debug(&format!(
                "loop finished after {} batch(es), {} item(s) collected",
                state.emitted,
                state.processed.len()
            ));
            ctx.clear_state();
            out.insert(LOOP_PORT, Vec::new());
            out.insert(DONE_PORT, state.processed);
        } else {
            state.emitted += 1;
            ctx.logger().debug(&format!(
                "batch {} with {} item(s), {} queued",
                state.emitted,
                batch.len(),
                state.queue.len()
            ));
            let raw = serde_json::to_value(&state)
                .map_err(|e| StepError::execution(format!("batch state not serializable: {e}")))?;
            ctx.set_state(raw);
            out.insert(LOOP_PORT, batch);
            out.insert(DONE_PORT, Vec::new());
        }
        Ok(out)
    }
}
