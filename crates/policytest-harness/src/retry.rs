use std::future::Future;
use std::time::Duration;

use policytest_config::RetryBudget;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

/// Result of one attempt of a retried operation.
#[derive(Debug)]
pub enum Attempt<T> {
    /// The success condition holds; stop retrying.
    Ready(T),
    /// Not yet; the string describes what was observed.
    Pending(String),
}

/// A retry budget ran out before the success condition held.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} on {target} gave up after {attempts} attempt(s); last outcome: {last_outcome}")]
pub struct RetryExhausted {
    pub operation: String,
    pub target: String,
    pub attempts: u32,
    pub last_outcome: String,
}

#[derive(Debug)]
pub enum RetryError<E> {
    Exhausted(RetryExhausted),
    /// The operation failed in a way that retrying cannot fix.
    Fatal(E),
}

/// Bounded retry: at most `max_retries + 1` attempts, `wait` between attempts
/// (never before the first), optionally capped by a wall-clock `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub wait: Duration,
    pub ceiling: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(budget: RetryBudget, ceiling: Option<Duration>) -> Self {
        Self { max_retries: budget.max_retries, wait: budget.wait, ceiling }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Run `op` until it returns [`Attempt::Ready`], an error, or the budget runs out.
    ///
    /// `op` receives the 1-based attempt number. An `Err` from `op` is fatal and
    /// returned immediately without further attempts.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        target: &str,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Attempt<T>, E>>,
    {
        let deadline = self.ceiling.map(|c| Instant::now() + c);
        let max_attempts = self.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let last_outcome = match op(attempt).await.map_err(RetryError::Fatal)? {
                Attempt::Ready(value) => {
                    if attempt > 1 {
                        info!(operation, target, attempt, "succeeded after retrying");
                    }
                    return Ok(value);
                }
                Attempt::Pending(outcome) => outcome,
            };

            let out_of_time = deadline.is_some_and(|d| Instant::now() + self.wait > d);
            if attempt >= max_attempts || out_of_time {
                return Err(RetryError::Exhausted(RetryExhausted {
                    operation: operation.to_string(),
                    target: target.to_string(),
                    attempts: attempt,
                    last_outcome,
                }));
            }

            debug!(
                operation,
                target,
                attempt,
                max_attempts,
                wait_secs = self.wait.as_secs(),
                outcome = %last_outcome,
                "not ready, retrying"
            );
            if !self.wait.is_zero() {
                tokio::time::sleep(self.wait).await;
            }
        }
    }
}
