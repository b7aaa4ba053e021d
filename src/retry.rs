//! Bounded linear retry around a single outbound call.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

/// Configuration for retry behavior: a fixed backoff and a fixed attempt cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(1000),
        }
    }
}

/// Outcome of a gated call.
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
    /// Wall-clock time spent on the call once it had failed at least once.
    pub retry_time: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RetryGate {
    policy: RetryPolicy,
}

impl RetryGate {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Run `op`, retrying transient failures with a fixed backoff.
    ///
    /// An attempt already in flight is never abandoned; cancellation only cuts
    /// the backoff short and stops further attempts.
    pub async fn call<T, E, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Attempted<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let started = Instant::now();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut failed_once = false;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = op().await;
            let err = match result {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                        retry_time: if failed_once { started.elapsed() } else { Duration::ZERO },
                    };
                }
                Err(err) => err,
            };
            failed_once = true;

            if !err.is_transient() || attempt >= max_attempts || cancel.is_cancelled() {
                if err.is_transient() {
                    tracing::warn!(operation, attempts = attempt, error = %err, "giving up after transient failures");
                }
                return Attempted {
                    result: Err(err),
                    attempts: attempt,
                    retry_time: started.elapsed(),
                };
            }

            tracing::debug!(
                operation,
                attempt,
                max_attempts,
                backoff_ms = self.policy.backoff.as_millis() as u64,
                error = %err,
                "transient failure, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Attempted {
                        result: Err(err),
                        attempts: attempt,
                        retry_time: started.elapsed(),
                    };
                }
                _ = sleep(self.policy.backoff) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Timeout,
        Fatal,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, TestError::Timeout)
        }
    }

    fn gate(max_attempts: u32) -> RetryGate {
        RetryGate::new(RetryPolicy {
            max_attempts,
            backoff: Duration::from_millis(5),
        })
    }

    #[tokio::test]
    async fn success_on_first_attempt_reports_no_retry_time() {
        let out: Attempted<u32, TestError> = gate(3)
            .call("op", &CancellationToken::new(), || async { Ok(7) })
            .await;
        assert_eq!(out.result.unwrap(), 7);
        assert_eq!(out.attempts, 1);
        assert_eq!(out.retry_time, Duration::ZERO);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let out = gate(3)
            .call("op", &CancellationToken::new(), move || {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TestError::Timeout)
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(out.result.unwrap(), "done");
        assert_eq!(out.attempts, 3);
        assert!(out.retry_time >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn attempt_cap_is_respected() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let out: Attempted<(), TestError> = gate(2)
            .call("op", &CancellationToken::new(), move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Timeout) }
            })
            .await;
        assert_eq!(out.attempts, 2);
        assert!(out.retry_time > Duration::ZERO);
        assert_eq!(out.result.unwrap_err(), TestError::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let out: Attempted<(), TestError> = gate(5)
            .call("op", &CancellationToken::new(), move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Fatal) }
            })
            .await;
        assert_eq!(out.result.unwrap_err(), TestError::Fatal);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_further_attempts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let out: Attempted<(), TestError> = gate(5)
            .call("op", &cancel, move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Timeout) }
            })
            .await;
        assert!(out.result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
