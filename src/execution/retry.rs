//! Retry wrapper for network-sensitive steps

use crate::core::{RetryPolicy, StepOutcome, StepResult};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Run `attempt` until it succeeds or the policy is exhausted.
///
/// `attempt` receives the 1-based attempt number. Failed and timed-out
/// attempts are retried after the policy's backoff; a cancelled attempt is
/// returned immediately, as is the last attempt when cancellation arrives
/// during a backoff delay. The returned result carries the number of calls
/// made in `attempts`.
pub async fn with_retry<F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut attempt: F,
) -> StepResult
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = StepResult>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut number = 1;

    loop {
        let mut result = attempt(number).await;
        result.attempts = number;

        if result.outcome == StepOutcome::Succeeded {
            if number > 1 {
                info!("Succeeded on attempt {}/{}", number, max_attempts);
            }
            return result;
        }

        if !result.outcome.is_retryable() {
            return result;
        }

        if number >= max_attempts {
            warn!("Retries exhausted after {} attempts", number);
            return result;
        }

        let delay = policy.backoff.delay(number);
        warn!(
            "Attempt {}/{} ended {:?}, retrying in {:?}",
            number, max_attempts, result.outcome, delay
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return result,
            _ = tokio::time::sleep(delay) => {}
        }

        number += 1;
    }
}
