//! Checkpoints and recovery vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Immutable record of a step's successful completion within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: String,
    /// `{"output": <PortBundle>, "state": <step state blob or null>}`.
    pub state: Value,
    pub created_at: DateTime<Utc>,
}

/// Coarse failure classification used to pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Network,
    Timeout,
    Validation,
    Permission,
    Unknown,
}

/// How to bring a failed run back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Re-invoke the failed step with identical inputs.
    Retry,
    /// Mark the failed step Skipped and let downstream run on empty inputs.
    Skip,
    /// Resume from the checkpoints, re-running only steps after them.
    RestartFromCheckpoint,
    /// Leave the run for a human.
    Manual,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Skip => "skip",
            Self::RestartFromCheckpoint => "restart_from_checkpoint",
            Self::Manual => "manual",
        }
    }
}

impl std::str::FromStr for RecoveryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retry" => Ok(Self::Retry),
            "skip" => Ok(Self::Skip),
            "restart" | "restart_from_checkpoint" => Ok(Self::RestartFromCheckpoint),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown recovery strategy '{other}'")),
        }
    }
}

/// Result of analyzing a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRecommendation {
    pub category: FailureCategory,
    pub strategy: RecoveryStrategy,
    /// Human-readable explanation of the classification.
    pub reason: String,
    /// Earliest delay before a retry is allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// Most recent checkpoint of the run, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_checkpoint: Option<Uuid>,
}
