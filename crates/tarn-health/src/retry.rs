//! Bounded retry with exponential backoff.
//!
//! Wraps any fallible async operation. Between attempts the executor
//! sleeps, multiplying the delay up to a ceiling; a shutdown signal
//! observed during that sleep ends the retry immediately.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `max_retries + 1` attempts total.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay that follows `delay`, capped at `max_delay`.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        let next = delay.as_secs_f64() * self.multiplier;
        Duration::from_secs_f64(next.min(self.max_delay.as_secs_f64()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("non-retryable failure: {0}")]
    NonRetryable(E),
    #[error("retry cancelled by shutdown")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// The underlying operation error, if one was recorded.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::NonRetryable(e) => Some(e),
            RetryError::Cancelled => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    cancel: Option<watch::Receiver<bool>>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            cancel: None,
        }
    }

    /// Abort backoff sleeps once `cancel` turns `true`.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails non-retryably, or the attempt
    /// budget is spent. `operation` names the call in log lines.
    pub async fn execute<T, E, F, Fut, P>(
        &self,
        operation: &str,
        mut op: F,
        is_retryable: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let attempts = self.policy.max_retries.saturating_add(1);
        let mut delay = self.policy.initial_delay;
        let mut cancel = self.cancel.clone();

        for attempt in 1..=attempts {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !is_retryable(&err) {
                warn!(operation, attempt, error = %err, "operation failed, not retryable");
                return Err(RetryError::NonRetryable(err));
            }
            if attempt == attempts {
                warn!(operation, attempt, error = %err, "operation failed, retries exhausted");
                return Err(RetryError::Exhausted {
                    attempts,
                    last: err,
                });
            }

            warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "operation failed, retrying"
            );

            match cancel.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        biased;
                        _ = cancelled(rx) => return Err(RetryError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
            delay = self.policy.next_delay(delay);
        }

        // `attempts` is at least one, so the loop always returns.
        Err(RetryError::Cancelled)
    }
}

/// Resolves once the signal reads `true`. A dropped sender never cancels.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
