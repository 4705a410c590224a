//! Sandboxed code execution and the `code` step.
//!
//! Two isolation strategies share one timeout and cancellation path
//! ([`switchyard_core::deadline::run_with_deadline`]):
//!
//! - [`wasm`] -- core WASM modules run in-process under Wasmtime
//! - [`script`] -- Python snippets run in a child interpreter process

pub mod output;
pub mod script;
pub mod wasm;

use std::time::Duration;

use serde_json::Value;
use switchyard_core::step::{ExecutionContext, StepDescriptor, StepHandler, StepRegistry};
use switchyard_types::config::SandboxConfig;
use switchyard_types::error::StepError;
use switchyard_types::item::{MAIN_PORT, ParamBag, PortBundle};

pub use output::CodeOutput;
pub use script::ScriptSandbox;
pub use wasm::WasmSandbox;

/// Registry key of the code step.
pub const CODE_STEP_TYPE: &str = "code";

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to create wasm engine: {0}")]
    Engine(String),
}

/// Language of a code step's `source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Wasm,
    Python,
}

impl std::str::FromStr for Language {
    type Err = StepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wasm" | "wat" => Ok(Self::Wasm),
            "python" | "py" => Ok(Self::Python),
            other => Err(StepError::validation(format!(
                "unsupported code language '{other}' (expected wasm or python)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// CodeStep
// ---------------------------------------------------------------------------

/// Runs user-authored code over the `main` input items.
///
/// Parameters: `language` (`wasm` | `python`), `source`, optional
/// `timeout_ms` (falls back to the sandbox default). The result JSON becomes
/// the `main` output: an array yields one item per element.
pub struct CodeStep {
    descriptor: StepDescriptor,
    wasm: WasmSandbox,
    script: ScriptSandbox,
    default_timeout: Duration,
}

impl CodeStep {
    pub fn new(config: &SandboxConfig) -> Result<Self, SandboxError> {
        Ok(Self {
            descriptor: StepDescriptor::simple(CODE_STEP_TYPE, "Code"),
            wasm: WasmSandbox::new(config)?,
            script: ScriptSandbox::new(config.interpreter.clone(), config.max_output_bytes),
            default_timeout: Duration::from_millis(config.timeout_ms),
        })
    }
}

/// Register the `code` step on `registry`.
pub fn register_code_step(
    registry: &mut StepRegistry,
    config: &SandboxConfig,
) -> Result<(), SandboxError> {
    registry.register(CodeStep::new(config)?);
    Ok(())
}

fn string_param<'a>(params: &'a ParamBag, name: &str) -> Result<&'a str, StepError> {
    match params.get(name) {
        Some(Value::String(s)) => Ok(s.as_str()),
        None | Some(Value::Null) => Err(StepError::validation(format!(
            "missing required parameter '{name}'"
        ))),
        Some(other) => Err(StepError::validation(format!(
            "parameter '{name}' must be a string, got {other}"
        ))),
    }
}

impl StepHandler for CodeStep {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        mut inputs: PortBundle,
        params: &ParamBag,
        ctx: &ExecutionContext,
    ) -> Result<PortBundle, StepError> {
        let language: Language = string_param(params, "language")?.parse()?;
        let source = string_param(params, "source")?;
        let timeout = match params.get("timeout_ms") {
            None | Some(Value::Null) => self.default_timeout,
            Some(v) => v.as_u64().map(Duration::from_millis).ok_or_else(|| {
                StepError::validation(format!(
                    "parameter 'timeout_ms' must be a non-negative integer, got {v}"
                ))
            })?,
        };

        let items = inputs.take(MAIN_PORT);
        ctx.logger().debug(&format!(
            "running {language:?} code over {} item(s)",
            items.len()
        ));

        let out = match language {
            Language::Wasm => {
                self.wasm
                    .run(source.as_bytes(), &items, timeout, ctx.cancellation())
                    .await?
            }
            Language::Python => {
                self.script
                    .run(source, &items, timeout, ctx.cancellation())
                    .await?
            }
        };

        for line in &out.logs {
            ctx.logger().info(line);
        }
        Ok(PortBundle::single(
            MAIN_PORT,
            output::into_items(out.value),
        ))
    }
}
