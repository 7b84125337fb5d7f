//! Retry with configurable backoff for link establishment.
//!
//! Only the handshake retries; individual calls never do. The growth of the
//! wait between attempts follows the link's [`RetryCurve`], capped at the
//! configured maximum.

use std::future::Future;
use std::time::Duration;
use tether_types::{LinkSettings, RetryCurve};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Retry behaviour for one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first try).
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    pub initial_wait_ms: u64,
    /// Upper bound for any single delay in milliseconds.
    pub max_wait_ms: u64,
    /// How the delay grows between attempts.
    pub curve: RetryCurve,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&LinkSettings::default())
    }
}

impl RetryPolicy {
    /// The handshake policy described by a link's settings.
    pub fn from_settings(settings: &LinkSettings) -> Self {
        Self {
            max_attempts: settings.create_retry,
            initial_wait_ms: settings.create_wait_ms,
            max_wait_ms: settings.create_max_wait_ms,
            curve: settings.create_retry_curve,
        }
    }
}

/// Result of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded.
    Success {
        result: T,
        /// Total number of attempts made (1 = first try succeeded).
        attempts: u32,
    },
    /// All attempts failed, or the error was not retryable.
    Exhausted { last_error: E, attempts: u32 },
}

// ---------------------------------------------------------------------------
// Backoff computation
// ---------------------------------------------------------------------------

/// Delay after failed attempt number `attempt` (0-indexed).
pub fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    policy
        .curve
        .delay_ms(policy.initial_wait_ms, attempt, policy.max_wait_ms)
}

// ---------------------------------------------------------------------------
// Core retry function
// ---------------------------------------------------------------------------

/// Run `operation` until it succeeds, the error is not retryable, or the
/// attempts are used up. `operation` receives the 0-indexed attempt number.
pub async fn retry_async<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: P,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Debug,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        attempt = attempt + 1,
                        "retry succeeded after {} previous failures", attempt
                    );
                }
                return RetryOutcome::Success {
                    result,
                    attempts: attempt + 1,
                };
            }
            Err(err) => {
                let retryable = should_retry(&err);
                if !retryable || attempt + 1 >= max {
                    if retryable {
                        warn!(
                            attempt = attempt + 1,
                            max_attempts = max,
                            "all retry attempts exhausted: {:?}",
                            err
                        );
                    } else {
                        debug!(attempt = attempt + 1, "error is not retryable: {:?}", err);
                    }
                    return RetryOutcome::Exhausted {
                        last_error: err,
                        attempts: attempt + 1,
                    };
                }

                let delay_ms = compute_backoff(policy, attempt);
                debug!(attempt = attempt + 1, delay_ms, "retrying after error: {:?}", err);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(curve: RetryCurve, max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_wait_ms: 1,
            max_wait_ms: 10,
            curve,
        }
    }

    #[test]
    fn test_policy_from_default_settings() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_wait_ms, 100);
        assert_eq!(policy.max_wait_ms, 5_000);
        assert_eq!(policy.curve, RetryCurve::Exponential);
    }

    #[test]
    fn test_compute_backoff_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_wait_ms: 1_000,
            max_wait_ms: 5_000,
            curve: RetryCurve::Exponential,
        };
        assert_eq!(compute_backoff(&policy, 0), 1_000);
        assert_eq!(compute_backoff(&policy, 2), 4_000);
        assert_eq!(compute_backoff(&policy, 3), 5_000);
        assert_eq!(compute_backoff(&policy, 10), 5_000);

        let linear = RetryPolicy {
            curve: RetryCurve::Linear,
            ..policy
        };
        assert_eq!(compute_backoff(&linear, 1), 2_000);
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let outcome = retry_async(
            &fast(RetryCurve::Exponential, 5),
            move |attempt| {
                let c = counter_clone.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err("not yet")
                    } else {
                        Ok("finally")
                    }
                }
            },
            |_| true,
        )
        .await;

        match outcome {
            RetryOutcome::Success { result, attempts } => {
                assert_eq!(result, "finally");
                assert_eq!(attempts, 3);
            }
            _ => panic!("expected success"),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let outcome = retry_async(
            &fast(RetryCurve::Constant, 3),
            |_| async { Err::<(), &str>("always fails") },
            |_| true,
        )
        .await;

        match outcome {
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => {
                assert_eq!(last_error, "always fails");
                assert_eq!(attempts, 3);
            }
            _ => panic!("expected exhausted"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let outcome = retry_async(
            &fast(RetryCurve::Linear, 5),
            |_| async { Err::<(), &str>("fatal") },
            |_| false,
        )
        .await;
        assert!(matches!(
            outcome,
            RetryOutcome::Exhausted { attempts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let outcome = retry_async(
            &fast(RetryCurve::Constant, 0),
            |_| async { Ok::<u8, &str>(7) },
            |_| true,
        )
        .await;
        assert!(matches!(
            outcome,
            RetryOutcome::Success { result: 7, attempts: 1 }
        ));
    }
}
