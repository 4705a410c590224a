//! Uniform wall-clock deadline and cancellation for step work.
//!
//! Both code-execution strategies (in-process and subprocess) run through
//! [`run_with_deadline`]. The closure receives an abort token that fires on
//! timeout or on run cancellation, so work that cannot be dropped (a
//! blocking interpreter thread) still gets told to stop.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeadlineError {
    #[error("deadline of {0:?} exceeded")]
    TimedOut(Duration),

    #[error("cancelled before completion")]
    Cancelled,
}

/// Run `work` until it completes, `duration` elapses, or `cancel` fires.
///
/// On timeout or cancellation the abort token handed to `work` is cancelled
/// and the future is dropped before this returns.
pub async fn run_with_deadline<F, Fut, T>(
    duration: Duration,
    cancel: &CancellationToken,
    work: F,
) -> Result<T, DeadlineError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = T>,
{
    let abort = cancel.child_token();
    let fut = work(abort.clone());
    tokio::pin!(fut);

    let outcome = tokio::select! {
        biased;
        out = &mut fut => Ok(out),
        _ = cancel.cancelled() => Err(DeadlineError::Cancelled),
        _ = tokio::time::sleep(duration) => Err(DeadlineError::TimedOut(duration)),
    };

    if outcome.is_err() {
        abort.cancel();
    }
    outcome
}
