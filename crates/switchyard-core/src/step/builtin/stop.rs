use serde_json::Value;
use switchyard_types::error::{StepError, StepErrorKind};
use switchyard_types::item::{MAIN_PORT, ParamBag, PortBundle};

use super::{param_bool, param_str, param_u64};
use crate::step::{ExecutionContext, PortSpec, StepDescriptor, StepHandler};

/// Fails with a configured error whenever it receives items.
///
/// Parameters: `message`, `kind` (a `StepErrorKind` name, default
/// `execution`), `retryable`, `retry_after_ms`.
pub struct StopAndErrorStep {
    descriptor: StepDescriptor,
}

impl StopAndErrorStep {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor {
                type_name: "stop_and_error".to_string(),
                display_name: "Stop and Error".to_string(),
                inputs: vec![PortSpec::required(MAIN_PORT)],
                outputs: Vec::new(),
                iterative: false,
                standalone: true,
            },
        }
    }
}

impl Default for StopAndErrorStep {
    fn default() -> Self {
        Self::new()
    }
}

impl StepHandler for StopAndErrorStep {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        _inputs: PortBundle,
        params: &ParamBag,
        ctx: &ExecutionContext,
    ) -> Result<PortBundle, StepError> {
        let message = ctx
            .resolve_template(param_str(params, "message")?.unwrap_or("stopped by graph"))
            .await?;
        let kind = match param_str(params, "kind")? {
            None => StepErrorKind::Execution,
            Some(raw) => serde_json::from_value(Value::String(raw.to_string()))
                .map_err(|_| StepError::validation(format!("unknown error kind '{raw}'")))?,
        };
        let retryable = param_bool(params, "retryable", false)?;

        let mut err = StepError::new(kind, message, retryable);
        if let Some(ms) = param_u64(params, "retry_after_ms")? {
            err = err.with_retry_after(std::time::Duration::from_millis(ms));
        }
        Err(err)
    }
}
