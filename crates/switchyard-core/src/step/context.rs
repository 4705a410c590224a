//! Execution context handed to a step for one invocation.
//!
//! Gives the step its identity within the run, parameter resolution through
//! the injected variable resolver, a logger sink, the run's cancellation
//! token and a per-step state blob that survives repeated invocations
//! within the same run.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use switchyard_types::error::StepError;
use switchyard_types::item::ParamBag;

use crate::variables::{DynVariableResolver, StaticVariables, VariableResolverDyn};

/// Per-step state blobs for one run, keyed by step id.
pub type StepStateMap = Arc<DashMap<String, Value>>;

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

/// Log sink for step implementations.
///
/// Lines go to `tracing` with the run and step ids attached and are also
/// captured so the scheduler can store them on the step's record.
#[derive(Debug, Clone)]
pub struct StepLogger {
    run_id: Uuid,
    step_id: String,
    lines: Arc<Mutex<Vec<String>>>,
}

impl StepLogger {
    fn new(run_id: Uuid, step_id: String) -> Self {
        Self {
            run_id,
            step_id,
            lines: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn capture(&self, level: &str, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(format!("[{level}] {message}"));
        }
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(run_id = %self.run_id, step_id = %self.step_id, "{message}");
        self.capture("debug", message);
    }

    pub fn info(&self, message: &str) {
        tracing::info!(run_id = %self.run_id, step_id = %self.step_id, "{message}");
        self.capture("info", message);
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(run_id = %self.run_id, step_id = %self.step_id, "{message}");
        self.capture("warn", message);
    }

    pub fn error(&self, message: &str) {
        tracing::error!(run_id = %self.run_id, step_id = %self.step_id, "{message}");
        self.capture("error", message);
    }

    /// Drain captured lines.
    pub fn take_lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|mut lines| std::mem::take(&mut *lines))
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ExecutionContext {
    run_id: Uuid,
    step_id: String,
    iteration: u32,
    cancel: CancellationToken,
    variables: DynVariableResolver,
    state: StepStateMap,
    logger: StepLogger,
}

impl ExecutionContext {
    pub fn new(
        run_id: Uuid,
        step_id: impl Into<String>,
        cancel: CancellationToken,
        variables: DynVariableResolver,
        state: StepStateMap,
    ) -> Self {
        let step_id = step_id.into();
        Self {
            logger: StepLogger::new(run_id, step_id.clone()),
            run_id,
            step_id,
            iteration: 0,
            cancel,
            variables,
            state,
        }
    }

    /// A context for running one step on its own, outside a full run.
    pub fn standalone(step_id: impl Into<String>) -> Self {
        Self::new(
            Uuid::now_v7(),
            step_id,
            CancellationToken::new(),
            Arc::new(StaticVariables::new()),
            Arc::new(DashMap::new()),
        )
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn with_variables(mut self, variables: DynVariableResolver) -> Self {
        self.variables = variables;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// Loop re-entry count for this step (0 on first entry).
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn logger(&self) -> &StepLogger {
        &self.logger
    }

    // -- state blob ---------------------------------------------------------

    pub fn state(&self) -> Option<Value> {
        self.state.get(&self.step_id).map(|v| v.value().clone())
    }

    pub fn set_state(&self, value: Value) {
        self.state.insert(self.step_id.clone(), value);
    }

    pub fn clear_state(&self) {
        self.state.remove(&self.step_id);
    }

    // -- parameter resolution -----------------------------------------------

    /// Resolve templates in every string of the parameter bag, recursively.
    pub async fn resolve_parameters(&self, params: &ParamBag) -> Result<ParamBag, StepError> {
        let mut out = Map::with_capacity(params.len());
        for (key, value) in params {
            out.insert(key.clone(), self.resolve_value(value).await?);
        }
        Ok(out)
    }

    /// Resolve a single parameter, `None` when absent.
    pub async fn resolve_parameter(
        &self,
        params: &ParamBag,
        name: &str,
    ) -> Result<Option<Value>, StepError> {
        match params.get(name) {
            Some(value) => Ok(Some(self.resolve_value(value).await?)),
            None => Ok(None),
        }
    }

    async fn resolve_value(&self, value: &Value) -> Result<Value, StepError> {
        // Iterative: async recursion would need boxing at every level.
        match value {
            Value::String(s) => Ok(Value::String(self.resolve_template(s).await?)),
            Value::Array(_) | Value::Object(_) => {
                let mut root = value.clone();
                let mut stack: Vec<&mut Value> = vec![&mut root];
                while let Some(node) = stack.pop() {
                    match node {
                        Value::String(s) if s.contains("{{") => {
                            *s = self.resolve_template(s).await?;
                        }
                        Value::Array(items) => stack.extend(items.iter_mut()),
                        Value::Object(map) => stack.extend(map.values_mut()),
                        _ => {}
                    }
                }
                Ok(root)
            }
            other => Ok(other.clone()),
        }
    }

    /// Substitute `{{ ... }}` references in a string.
    ///
    /// - `{{ vars.KEY }}` -- looked up through the variable resolver; an
    ///   unknown key is a validation error
    /// - `{{ run.id }}`, `{{ step.id }}`, `{{ step.iteration }}`
    ///
    /// Any other reference is left as-is.
    pub async fn resolve_template(&self, template: &str) -> Result<String, StepError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start..].find("}}") else {
                break;
            };
            let end = start + len + 2;
            let reference = rest[start + 2..end - 2].trim();
            out.push_str(&rest[..start]);

            match self.lookup(reference).await? {
                Some(replacement) => out.push_str(&replacement),
                None => out.push_str(&rest[start..end]),
            }
            rest = &rest[end..];
        }
        out.push_str(rest);
        Ok(out)
    }

    async fn lookup(&self, reference: &str) -> Result<Option<String>, StepError> {
        if let Some(key) = reference.strip_prefix("vars.") {
            let value = self
                .variables
                .resolve_boxed(key)
                .await
                .map_err(|e| StepError::dependency(e.to_string()))?;
            return match value {
                Some(v) => Ok(Some(v)),
                None => Err(StepError::validation(format!("unknown variable '{key}'"))),
            };
        }
        Ok(match reference {
            "run.id" => Some(self.run_id.to_string()),
            "step.id" => Some(self.step_id.clone()),
            "step.iteration" => Some(self.iteration.to_string()),
            _ => None,
        })
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.run_id)
            .field("step_id", &self.step_id)
            .field("iteration", &self.iteration)
            .finish()
    }
}
