//! Retry with exponential backoff and jitter.
//!
//! Every control-plane call site wraps its operation in `RetryPolicy::run`
//! instead of hand-rolling loops. The caller supplies the classifier that
//! decides which failures are worth another attempt; precondition and fatal
//! failures must never be classified retryable, and the default classifier
//! retries transient failures only.

use crate::config::RetryConfig;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;
use vmharness_proto::ControlPlaneError;

/// Callback invoked before each backoff sleep, for progress reporting.
pub type RetryObserver = Arc<dyn Fn(&str, u32, Duration) + Send + Sync>;

/// Retry executor shared across the orchestration pipeline.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    observer: Option<RetryObserver>,
}

impl RetryPolicy {
    /// Creates a policy with an explicit budget.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            observer: None,
        }
    }

    /// Creates a policy from configuration.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Attaches an observer called as `(operation, attempt, delay)` before
    /// each backoff sleep.
    pub fn with_observer(mut self, observer: RetryObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Runs `op` until it succeeds, the classifier rejects its failure, or
    /// the attempt budget is exhausted.
    ///
    /// The returned error is annotated with the attempt count and cumulative
    /// elapsed time so the operator can tell a long transient outage from an
    /// immediate refusal.
    pub async fn run<T, E, C, F, Fut>(
        &self,
        operation: &str,
        classifier: C,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::error::Error,
        C: Fn(&E) -> bool,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.max_attempts || !classifier(&err) {
                        return Err(RetryError {
                            operation: operation.to_string(),
                            attempts: attempt,
                            elapsed: started.elapsed(),
                            source: err,
                        });
                    }

                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off before retry"
                    );
                    if let Some(observer) = &self.observer {
                        observer(operation, attempt, delay);
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Convenience wrapper for control-plane calls: retries transient
    /// failures only.
    pub async fn run_transient<T, F, Fut>(
        &self,
        operation: &str,
        op: F,
    ) -> Result<T, RetryError<ControlPlaneError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ControlPlaneError>>,
    {
        self.run(operation, ControlPlaneError::is_transient, op).await
    }

    /// Backoff for the given 1-indexed attempt: `base * 2^(n-1)` capped at
    /// `max_delay`, plus uniform jitter up to half the delay to spread out
    /// retry storms.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.base_delay.saturating_mul(1 << exp);
        let capped = base.min(self.max_delay);
        let jitter_cap = (capped.as_millis() as u64 / 2).max(1);
        let jitter = rand::thread_rng().gen_range(0..jitter_cap);
        capped + Duration::from_millis(jitter)
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

/// A failure that survived the retry budget, annotated for diagnostics.
#[derive(Debug, thiserror::Error)]
#[error("{operation} failed after {attempts} attempt(s) in {elapsed:?}: {source}")]
pub struct RetryError<E: std::error::Error> {
    /// The operation label given to `run`.
    pub operation: String,
    /// Attempts actually made (1 for non-retryable failures).
    pub attempts: u32,
    /// Wall-clock time spent including backoff sleeps.
    pub elapsed: Duration,
    /// The last underlying failure.
    #[source]
    pub source: E,
}
