//! Steps that forward their `main` items, optionally reshaped or delayed.

use std::time::Duration;

use serde_json::{Map, Value};
use switchyard_types::error::StepError;
use switchyard_types::item::{MAIN_PORT, ParamBag, PortBundle};

use super::{param_bool, param_u64};
use crate::step::{ExecutionContext, StepDescriptor, StepHandler};

// ---------------------------------------------------------------------------
// no_op
// ---------------------------------------------------------------------------

pub struct NoOpStep {
    descriptor: StepDescriptor,
}

impl NoOpStep {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor::simple("no_op", "No Operation"),
        }
    }
}

impl Default for NoOpStep {
    fn default() -> Self {
        Self::new()
    }
}

impl StepHandler for NoOpStep {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        mut inputs: PortBundle,
        _params: &ParamBag,
        _ctx: &ExecutionContext,
    ) -> Result<PortBundle, StepError> {
        Ok(PortBundle::single(MAIN_PORT, inputs.take(MAIN_PORT)))
    }
}

// ---------------------------------------------------------------------------
// set
// ---------------------------------------------------------------------------

/// Assigns the fields of the `values` parameter onto every item payload.
///
/// Templates in `values` are resolved once per invocation. With
/// `keep_only_set` the payload is replaced by `values` alone. Non-object
/// payloads are replaced.
pub struct SetStep {
    descriptor: StepDescriptor,
}

impl SetStep {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor::simple("set", "Set Fields"),
        }
    }
}

impl Default for SetStep {
    fn default() -> Self {
        Self::new()
    }
}

impl StepHandler for SetStep {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        mut inputs: PortBundle,
        params: &ParamBag,
        ctx: &ExecutionContext,
    ) -> Result<PortBundle, StepError> {
        let values = match ctx.resolve_parameter(params, "values").await? {
            Some(Value::Object(map)) => map,
            None => Map::new(),
            Some(other) => {
                return Err(StepError::validation(format!(
                    "parameter 'values' must be an object, got {other}"
                )));
            }
        };
        let keep_only_set = param_bool(params, "keep_only_set", false)?;

        let items = inputs
            .take(MAIN_PORT)
            .into_iter()
            .map(|mut item| {
                let mut payload = match item.payload {
                    Value::Object(map) if !keep_only_set => map,
                    _ => Map::new(),
                };
                payload.extend(values.clone());
                item.payload = Value::Object(payload);
                item
            })
            .collect();

        Ok(PortBundle::single(MAIN_PORT, items))
    }
}

// ---------------------------------------------------------------------------
// wait
// ---------------------------------------------------------------------------

/// Holds items for `ms` milliseconds, then forwards them.
pub struct WaitStep {
    descriptor: StepDescriptor,
}

impl WaitStep {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor::simple("wait", "Wait"),
        }
    }
}

impl Default for WaitStep {
    fn default() -> Self {
        Self::new()
    }
}

impl StepHandler for WaitStep {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        mut inputs: PortBundle,
        params: &ParamBag,
        ctx: &ExecutionContext,
    ) -> Result<PortBundle, StepError> {
        let ms = param_u64(params, "ms")?.unwrap_or(0);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
            _ = ctx.cancellation().cancelled() => return Err(StepError::cancelled()),
        }
        Ok(PortBundle::single(MAIN_PORT, inputs.take(MAIN_PORT)))
    }
}
