//! Graph model: steps and the connections wiring their ports together.
//!
//! A [`Graph`] is supplied fresh per run and is read-only to the engine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::item::{MAIN_PORT, ParamBag};

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// A directed graph of typed steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    /// Graph identifier. Generated when absent from the source document.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    pub name: String,
    pub steps: Vec<StepNode>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            steps: Vec::new(),
            connections: Vec::new(),
        }
    }

    /// Builder-style step insertion, mostly for tests and embedding.
    pub fn with_step(mut self, step: StepNode) -> Self {
        self.steps.push(step);
        self
    }

    /// Builder-style connection on the `main` ports of both ends.
    pub fn connect(mut self, source: &str, target: &str) -> Self {
        self.connections.push(Connection::main(source, target));
        self
    }

    /// Builder-style connection between named ports.
    pub fn connect_ports(
        mut self,
        source: &str,
        source_port: &str,
        target: &str,
        target_port: &str,
    ) -> Self {
        self.connections.push(Connection {
            source: source.to_string(),
            source_port: source_port.to_string(),
            target: target.to_string(),
            target_port: target_port.to_string(),
        });
        self
    }

    pub fn step(&self, id: &str) -> Option<&StepNode> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Connections ending at `step_id`, in declaration order.
    pub fn incoming<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.iter().filter(move |c| c.target == step_id)
    }

    /// Connections starting at `step_id`, in declaration order.
    pub fn outgoing<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.iter().filter(move |c| c.source == step_id)
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// A single typed operation in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepNode {
    /// Unique identifier within the graph.
    pub id: String,
    /// Registered step type (e.g. "merge", "code", "split_in_batches").
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub parameters: ParamBag,
    /// Disabled steps are skipped and deliver empty sequences downstream.
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub settings: StepSettings,
}

impl StepNode {
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step_type: step_type.into(),
            parameters: ParamBag::new(),
            disabled: false,
            settings: StepSettings::default(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_settings(mut self, settings: StepSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }
}

/// Per-step failure handling and timing options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSettings {
    /// Convert a failure into an error-shaped output item and carry on.
    #[serde(default)]
    pub continue_on_fail: bool,
    /// On failure, skip every not-yet-started downstream step.
    #[serde(default = "default_true")]
    pub abort_downstream: bool,
    /// Automatic in-run retry of retryable failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Step timeout; the engine default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl Default for StepSettings {
    fn default() -> Self {
        Self {
            continue_on_fail: false,
            abort_downstream: true,
            retry: None,
            timeout_ms: None,
        }
    }
}

/// Retry policy for retryable step errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts (default: 1000 ms).
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Double the delay after every failed attempt.
    #[serde(default)]
    pub exponential: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            exponential: false,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> std::time::Duration {
        let factor = if self.exponential {
            2u64.saturating_pow(attempt.saturating_sub(1))
        } else {
            1
        };
        std::time::Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// A directed wire from one step's output port to another step's input port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    pub source: String,
    #[serde(default = "default_port")]
    pub source_port: String,
    pub target: String,
    #[serde(default = "default_port")]
    pub target_port: String,
}

fn default_port() -> String {
    MAIN_PORT.to_string()
}

impl Connection {
    pub fn main(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            source_port: default_port(),
            target: target.to_string(),
            target_port: default_port(),
        }
    }
}
