//! Built-in step types.

mod batch;
mod branch;
mod merge;
mod passthrough;
mod stop;
mod trigger;

pub use batch::SplitInBatchesStep;
pub use branch::{IfStep, SwitchStep};
pub use merge::{MergeMode, MergeStep};
pub use passthrough::{NoOpStep, SetStep, WaitStep};
pub use stop::StopAndErrorStep;
pub use trigger::ManualTriggerStep;

use serde_json::Value;
use switchyard_types::error::StepError;
use switchyard_types::item::ParamBag;

use super::StepRegistry;

pub fn register_builtins(registry: &mut StepRegistry) {
    registry.register(ManualTriggerStep::new());
    registry.register(NoOpStep::new());
    registry.register(SetStep::new());
    registry.register(WaitStep::new());
    registry.register(IfStep::new());
    registry.register(SwitchStep::new());
    registry.register(MergeStep::new());
    registry.register(SplitInBatchesStep::new());
    registry.register(StopAndErrorStep::new());
}

// ---------------------------------------------------------------------------
// Parameter helpers
// ---------------------------------------------------------------------------

pub(crate) fn param_str<'a>(params: &'a ParamBag, name: &str) -> Result<Option<&'a str>, StepError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(StepError::validation(format!(
            "parameter '{name}' must be a string, got {other}"
        ))),
    }
}

pub(crate) fn require_str<'a>(params: &'a ParamBag, name: &str) -> Result<&'a str, StepError> {
    param_str(params, name)?
        .ok_or_else(|| StepError::validation(format!("missing required parameter '{name}'")))
}

pub(crate) fn param_u64(params: &ParamBag, name: &str) -> Result<Option<u64>, StepError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_u64().map(Some).ok_or_else(|| {
            StepError::validation(format!(
                "parameter '{name}' must be a non-negative integer, got {v}"
            ))
        }),
    }
}

pub(crate) fn param_bool(params: &ParamBag, name: &str, default: bool) -> Result<bool, StepError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(StepError::validation(format!(
            "parameter '{name}' must be a boolean, got {other}"
        ))),
    }
}
