use switchyard_types::error::StepError;
use switchyard_types::item::{Item, MAIN_PORT, ParamBag, PortBundle};

use crate::step::{ExecutionContext, StepDescriptor, StepHandler};

/// Entry step for manually started runs.
///
/// Emits the trigger's seed items unchanged, or a single empty item when the
/// run was started without seeds.
pub struct ManualTriggerStep {
    descriptor: StepDescriptor,
}

impl ManualTriggerStep {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor {
                inputs: Vec::new(),
                ..StepDescriptor::simple("manual_trigger", "Manual Trigger")
            },
        }
    }
}

impl Default for ManualTriggerStep {
    fn default() -> Self {
        Self::new()
    }
}

impl StepHandler for ManualTriggerStep {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        mut inputs: PortBundle,
        _params: &ParamBag,
        ctx: &ExecutionContext,
    ) -> Result<PortBundle, StepError> {
        let mut items = inputs.take(MAIN_PORT);
        if items.is_empty() {
            items.push(Item::empty());
        }
        ctx.logger().debug(&format!("emitting {} seed item(s)", items.len()));
        Ok(PortBundle::single(MAIN_PORT, items))
    }
}
