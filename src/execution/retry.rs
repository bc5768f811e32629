//! Retry Wrapper
//!
//! Runs a step's executor under its retry policy. Each attempt is bounded
//! by the step timeout; waits between attempts follow the policy's backoff
//! and are raced against a cancellation token so a fail-fast abort never
//! waits out a pending timer.

use std::time::{Duration, Instant};

use log::{debug, warn};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::executor::{Executor, ExecutorError, StepContext};
use crate::workflow::Step;

/// Result of running a step through all of its attempts.
#[derive(Debug)]
pub struct StepOutcome {
    pub result: Result<Value, ExecutorError>,
    /// Number of attempts actually started
    pub attempts: u32,
    /// When the first attempt started
    pub started: Instant,
    pub duration: Duration,
}

/// Executes `step` with retries, timeouts and cancellation.
///
/// Ordinary failures and timeouts are retried until the policy's
/// `max_attempts` total attempts are used up. Budget rejections and
/// cancellation end the step immediately.
pub async fn execute_with_retry(
    executor: &dyn Executor,
    step: &Step,
    mut ctx: StepContext,
    cancel: &CancellationToken,
) -> StepOutcome {
    let policy = &step.retry_policy;
    let max_attempts = policy.max_attempts.max(1);
    let timeout = step.timeout_duration();
    let started = Instant::now();

    let mut attempts = 0;
    let result = loop {
        if cancel.is_cancelled() {
            break Err(ExecutorError::Cancelled);
        }

        attempts += 1;
        ctx.attempt = attempts;
        debug!("Step '{}' attempt {}/{}", step.id, attempts, max_attempts);

        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecutorError::Cancelled),
            outcome = tokio::time::timeout(timeout, executor.execute(step, &ctx)) => match outcome {
                Ok(result) => result,
                Err(_) => Err(ExecutorError::Timeout(step.timeout)),
            },
        };

        let error = match attempt {
            Ok(output) => break Ok(output),
            Err(e) if !e.is_retryable() || attempts >= max_attempts => break Err(e),
            Err(e) => e,
        };

        let delay = policy.delay_after(attempts);
        warn!(
            "Step '{}' attempt {}/{} failed: {}; retrying in {:?}",
            step.id, attempts, max_attempts, error, delay
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Err(ExecutorError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    };

    StepOutcome {
        result,
        attempts,
        started,
        duration: started.elapsed(),
    }
}
