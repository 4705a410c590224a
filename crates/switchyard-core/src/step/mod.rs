//! Step runtime protocol.
//!
//! Every step type implements [`StepHandler`]: a static [`StepDescriptor`]
//! (ports, iterative flag, standalone flag) plus a single `execute`
//! capability taking a [`PortBundle`] and returning one. The scheduler only
//! ever talks to steps through this contract, via the object-safe
//! [`StepHandlerDyn`] stored in the [`StepRegistry`].

pub mod builtin;
pub mod context;
pub mod registry;

use std::future::Future;
use std::pin::Pin;

use switchyard_types::error::StepError;
use switchyard_types::item::{MAIN_PORT, ParamBag, PortBundle};

pub use context::{ExecutionContext, StepLogger};
pub use registry::StepRegistry;

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// A declared input port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub name: String,
    /// The step does not wait for connections into an optional port.
    pub optional: bool,
    /// The port accepts a loop back-edge (only meaningful on iterative steps).
    pub back_edge: bool,
}

impl PortSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: false,
            back_edge: false,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            optional: true,
            ..Self::required(name)
        }
    }

    /// Back-edge ports are always optional.
    pub fn back_edge(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: true,
            back_edge: true,
        }
    }
}

/// Static facts about a step type.
#[derive(Debug, Clone)]
pub struct StepDescriptor {
    /// Registry key, matched against `StepNode::step_type`.
    pub type_name: String,
    pub display_name: String,
    pub inputs: Vec<PortSpec>,
    pub outputs: Vec<String>,
    /// Stateful loop step: may be re-entered through a back-edge.
    pub iterative: bool,
    /// May be executed on its own, outside a full run.
    pub standalone: bool,
}

impl StepDescriptor {
    /// One required `main` input, one `main` output.
    pub fn simple(type_name: &str, display_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            display_name: display_name.to_string(),
            inputs: vec![PortSpec::required(MAIN_PORT)],
            outputs: vec![MAIN_PORT.to_string()],
            iterative: false,
            standalone: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Handler traits
// ---------------------------------------------------------------------------

/// Implementation of one step type.
pub trait StepHandler: Send + Sync {
    fn descriptor(&self) -> &StepDescriptor;

    /// Input ports for a configured instance. Defaults to the descriptor's.
    fn input_ports(&self, _params: &ParamBag) -> Vec<PortSpec> {
        self.descriptor().inputs.clone()
    }

    /// Output ports for a configured instance. Defaults to the descriptor's.
    fn output_ports(&self, _params: &ParamBag) -> Vec<String> {
        self.descriptor().outputs.clone()
    }

    /// When false the step runs once per arriving input instead of waiting
    /// for every incoming connection.
    fn waits_for_all_inputs(&self, _params: &ParamBag) -> bool {
        true
    }

    fn execute(
        &self,
        inputs: PortBundle,
        params: &ParamBag,
        ctx: &ExecutionContext,
    ) -> impl Future<Output = Result<PortBundle, StepError>> + Send;
}

/// Object-safe version of [`StepHandler`] with a boxed `execute`.
///
/// Blanket-implemented for every `StepHandler`.
pub trait StepHandlerDyn: Send + Sync {
    fn descriptor(&self) -> &StepDescriptor;

    fn input_ports(&self, params: &ParamBag) -> Vec<PortSpec>;

    fn output_ports(&self, params: &ParamBag) -> Vec<String>;

    fn waits_for_all_inputs(&self, params: &ParamBag) -> bool;

    fn execute_boxed<'a>(
        &'a self,
        inputs: PortBundle,
        params: &'a ParamBag,
        ctx: &'a ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<PortBundle, StepError>> + Send + 'a>>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn descriptor(&self) -> &StepDescriptor {
        StepHandler::descriptor(self)
    }

    fn input_ports(&self, params: &ParamBag) -> Vec<PortSpec> {
        StepHandler::input_ports(self, params)
    }

    fn output_ports(&self, params: &ParamBag) -> Vec<String> {
        StepHandler::output_ports(self, params)
    }

    fn waits_for_all_inputs(&self, params: &ParamBag) -> bool {
        StepHandler::waits_for_all_inputs(self, params)
    }

    fn execute_boxed<'a>(
        &'a self,
        inputs: PortBundle,
        params: &'a ParamBag,
        ctx: &'a ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<PortBundle, StepError>> + Send + 'a>> {
        Box::pin(self.execute(inputs, params, ctx))
    }
}
