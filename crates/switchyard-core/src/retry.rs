//! In-run retry decisions for failed step attempts.

use std::time::Duration;

use switchyard_types::error::StepError;
use switchyard_types::graph::RetryPolicy;

/// The action the scheduler takes after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// Invoke the step again with the same inputs after `delay`.
    RetryAfter(Duration),
    /// Stop retrying; the error is final for this invocation.
    GiveUp,
}

/// Stateless retry logic. All configuration comes in as parameters.
pub struct RetryHandler;

impl RetryHandler {
    /// `attempt` is 1-based (first execution is attempt 1).
    pub fn should_retry(policy: Option<&RetryPolicy>, attempt: u32, error: &StepError) -> bool {
        match policy {
            Some(policy) => error.retryable && attempt < policy.max_attempts,
            None => false,
        }
    }

    /// The delay never undercuts the error's own `retry_after`.
    pub fn next_action(policy: Option<&RetryPolicy>, attempt: u32, error: &StepError) -> RetryAction {
        let Some(policy) = policy else {
            return RetryAction::GiveUp;
        };
        if !Self::should_retry(Some(policy), attempt, error) {
            return RetryAction::GiveUp;
        }
        let backoff = policy.backoff_for(attempt);
        let delay = error.retry_after().map_or(backoff, |after| after.max(backoff));
        RetryAction::RetryAfter(delay)
    }
}
