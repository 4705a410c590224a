use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Step errors
// ---------------------------------------------------------------------------

/// Classification of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// Bad graph or parameters. Never retryable.
    Validation,
    /// Step or sandbox exceeded its deadline.
    Timeout,
    /// I/O failure talking to an external system.
    Network,
    /// A collaborator the step depends on failed.
    Dependency,
    /// Disallowed construct or resource overreach in user code. Never retryable.
    SandboxViolation,
    /// Loop re-entry ceiling exceeded. Never retryable.
    IterationLimitExceeded,
    /// Access denied by an external system.
    Permission,
    /// The run was cancelled while the step was in flight.
    Cancelled,
    /// Anything else raised by the step itself.
    Execution,
}

impl StepErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Dependency => "dependency",
            Self::SandboxViolation => "sandbox_violation",
            Self::IterationLimitExceeded => "iteration_limit_exceeded",
            Self::Permission => "permission",
            Self::Cancelled => "cancelled",
            Self::Execution => "execution",
        }
    }
}

impl fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure returned by a step's `execute`.
///
/// Serializable so that it can be stored in run snapshots and surfaced
/// through the recovery API unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
    pub retryable: bool,
    /// Minimum delay before the step may be invoked again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl StepError {
    pub fn new(kind: StepErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
            retry_after_ms: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Validation, message, false)
    }

    /// Timeouts are retryable unless the caller turns it off.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Timeout, message, true)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Network, message, true)
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Dependency, message, true)
    }

    pub fn sandbox_violation(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::SandboxViolation, message, false)
    }

    pub fn iteration_limit(limit: u32) -> Self {
        Self::new(
            StepErrorKind::IterationLimitExceeded,
            format!("loop re-entered more than {limit} times"),
            false,
        )
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Permission, message, false)
    }

    pub fn cancelled() -> Self {
        Self::new(StepErrorKind::Cancelled, "run cancelled", false)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Execution, message, false)
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after_ms = Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// One problem found while validating a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Offending step, when the problem is attributable to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub reason: String,
}

impl ValidationIssue {
    pub fn step(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            step_id: Some(step_id.into()),
            reason: reason.into(),
        }
    }

    pub fn graph(reason: impl Into<String>) -> Self {
        Self {
            step_id: None,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step_id {
            Some(id) => write!(f, "step '{id}': {}", self.reason),
            None => f.write_str(&self.reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Errors from run and checkpoint storage backends.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}
