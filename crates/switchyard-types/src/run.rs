//! Run state: the scheduler's record of one end-to-end execution.
//!
//! A [`RunState`] is created at trigger time, mutated only by the scheduler
//! while the run is active, and treated as an immutable snapshot once the
//! run reaches a terminal status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::StepError;
use crate::graph::Graph;
use crate::item::PortBundle;
use crate::trigger::TriggerEvent;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Per-step lifecycle: `Pending -> Running -> {Succeeded | Failed | Skipped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// Why a step was skipped rather than executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// An upstream step failed with abort-downstream set.
    UpstreamFailed,
    /// Every incoming connection delivered an empty sequence.
    NoInputData,
    /// The step is disabled in the graph.
    Disabled,
    /// Not reachable from the trigger's start step.
    Unreachable,
    /// Skipped by an operator through recovery.
    Manual,
    /// The run was cancelled before the step started.
    Cancelled,
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Everything the run knows about one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PortBundle>,
    /// Inputs of the last invocation, kept for failed steps so recovery can
    /// show what the step saw.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<PortBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Attempts made by the last invocation (1-based, increments on retry).
    #[serde(default)]
    pub attempts: u32,
    /// How many times `execute` was entered across loop iterations and
    /// pass-through arrivals.
    #[serde(default)]
    pub invocations: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            output: None,
            input: None,
            error: None,
            skip_reason: None,
            attempts: 0,
            invocations: 0,
            logs: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }
}

impl Default for StepRecord {
    fn default() -> Self {
        Self::pending()
    }
}

/// The step that brought the run down, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub step_id: String,
    pub error: StepError,
}

/// Snapshot of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Uuid,
    pub graph: Graph,
    pub trigger: TriggerEvent,
    pub status: RunStatus,
    pub steps: BTreeMap<String, StepRecord>,
    /// Step ids in the order they were launched.
    #[serde(default)]
    pub execution_order: Vec<String>,
    /// Opaque per-step state blobs kept by stateful steps.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub step_state: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    /// Set when recovery handed the failure to a human.
    #[serde(default)]
    pub awaiting_manual: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunState {
    /// Fresh state with every step Pending.
    pub fn new(graph: Graph, trigger: TriggerEvent) -> Self {
        let steps = graph
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepRecord::pending()))
            .collect();
        Self {
            run_id: trigger.run_id,
            graph,
            trigger,
            status: RunStatus::Pending,
            steps,
            execution_order: Vec::new(),
            step_state: BTreeMap::new(),
            failure: None,
            awaiting_manual: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn record(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.get(step_id)
    }

    pub fn status_of(&self, step_id: &str) -> Option<StepStatus> {
        self.steps.get(step_id).map(|r| r.status)
    }

    pub fn output_of(&self, step_id: &str) -> Option<&PortBundle> {
        self.steps.get(step_id).and_then(|r| r.output.as_ref())
    }

    /// Ids of steps with the given status, in step-id order.
    pub fn steps_with_status(&self, status: StepStatus) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|(_, r)| r.status == status)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
