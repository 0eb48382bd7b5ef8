//! Retry driver with exponential backoff
//!
//! One driver serves both retry consumers in this service: judgment calls
//! (transient network/timeout/5xx failures, long delays, cancellation-aware)
//! and SQLite writes (lock contention, short delays). Callers supply a
//! policy, a transience predicate, and optionally a cancellation token that
//! can interrupt the backoff sleep between attempts.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Backoff parameters: total attempt ceiling and the delay curve.
///
/// The delay after failed attempt `n` is `base_delay * 2^(n-1)`, capped at
/// `max_delay`. With the default judgment policy of 4 attempts, 500ms base
/// and 8s cap, the schedule is 500ms, 1s, 2s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// Policy for SQLite writes contending on the database lock.
pub const DB_WRITE_POLICY: RetryPolicy = RetryPolicy::new(
    5,
    Duration::from_millis(10),
    Duration::from_millis(1000),
);

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay to wait after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// The full backoff table: one delay per retriable failure. An attempt
    /// ceiling of N allows N-1 delays.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts)
            .map(|attempt| self.delay_after(attempt))
            .collect()
    }
}

/// Why a retried operation ultimately did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::error::Error> {
    /// The cancellation token fired before or between attempts
    #[error("operation cancelled before completion")]
    Cancelled,
    /// Every allowed attempt failed with a transient error
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: E },
    /// A non-transient error occurred; retrying would not help
    #[error(transparent)]
    Fatal(E),
}

/// Runs `operation` until it succeeds, fails fatally, exhausts the policy's
/// attempt ceiling, or is cancelled. The operation receives the 1-based
/// attempt number. Cancellation is checked before each attempt and during
/// each backoff sleep, never mid-attempt; the operation itself is
/// responsible for its own timeout.
pub async fn retry_with_policy<T, E, F, Fut, P>(
    operation_name: &str,
    policy: &RetryPolicy,
    cancel: Option<&CancellationToken>,
    is_transient: P,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    E: std::error::Error,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    loop {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
        }
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        operation = operation_name,
                        attempt, "operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(e) if !is_transient(&e) => {
                return Err(RetryError::Fatal(e));
            }
            Err(e) if attempt >= policy.max_attempts => {
                warn!(
                    operation = operation_name,
                    attempts = attempt,
                    error = %e,
                    "operation failed, attempt ceiling reached"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    source: e,
                });
            }
            Err(e) => {
                let delay = policy.delay_after(attempt);
                if attempt == 1 {
                    debug!(
                        operation = operation_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, will retry"
                    );
                } else {
                    warn!(
                        operation = operation_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure persists, retrying"
                    );
                }
                match cancel {
                    Some(token) => {
                        tokio::select! {
                            _ = token.cancelled() => return Err(RetryError::Cancelled),
                            _ = sleep(delay) => {}
                        }
                    }
                    None => sleep(delay).await,
                }
            }
        }
    }
}

/// SQLite reports lock contention as a database-level error message rather
/// than a dedicated error code through sqlx.
pub fn is_database_locked(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message();
            message.contains("database is locked") || message.contains("database table is locked")
        }
        _ => false,
    }
}

/// Retries a SQLite write through the lock-contention policy. Non-lock
/// errors propagate unchanged on the first occurrence.
pub async fn retry_db_write<T, F, Fut>(operation_name: &str, operation: F) -> Result<T, sqlx::Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    match retry_with_policy(
        operation_name,
        &DB_WRITE_POLICY,
        None,
        is_database_locked,
        operation,
    )
    .await
    {
        Ok(value) => Ok(value),
        Err(RetryError::Fatal(e)) | Err(RetryError::Exhausted { source: e, .. }) => Err(e),
        // No cancellation token is supplied above, so this arm cannot fire.
        Err(RetryError::Cancelled) => Err(sqlx::Error::PoolClosed),
    }
}
