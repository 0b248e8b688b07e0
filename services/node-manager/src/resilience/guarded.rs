//! Retrying, breaker-protected remote calls.
//!
//! [`GuardedCall::call`] runs the operation through the circuit breaker and
//! asks the retry policy about every failure. `Retry` re-issues the whole
//! guarded call, so once the breaker opens the next attempt fails fast with
//! [`CallError::CircuitOpen`], which ends the chain. There is no attempt cap
//! at this layer; callers that want one use [`GuardedCall::with_retry_budget`].

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use super::backoff::BackoffPolicy;
use super::circuit_breaker::CircuitBreaker;
use super::retry::{RetryBudget, RetryDecision, RetryPolicy};
use crate::error::CallError;

/// A breaker plus a retry policy, applied to one remote operation at a time.
#[derive(Debug, Clone)]
pub struct GuardedCall<P> {
    breaker: Arc<CircuitBreaker>,
    policy: P,
    backoff: Option<BackoffPolicy>,
}

impl<P> GuardedCall<P> {
    pub fn new(breaker: Arc<CircuitBreaker>, policy: P) -> Self {
        Self {
            breaker,
            policy,
            backoff: None,
        }
    }

    /// Pause between retries instead of re-issuing immediately.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Same breaker and backoff, with at most `max_retries` retries for one
    /// call chain.
    pub fn with_retry_budget(&self, max_retries: u32) -> GuardedCall<RetryBudget<P>>
    where
        P: Clone,
    {
        GuardedCall {
            breaker: Arc::clone(&self.breaker),
            policy: RetryBudget::new(self.policy.clone(), max_retries),
            backoff: self.backoff.clone(),
        }
    }

    /// Run `op` until it succeeds, the policy gives up, or the circuit opens.
    ///
    /// `op` is invoked once per attempt that the breaker admits.
    pub async fn call<T, E, F, Fut>(&self, mut op: F) -> Result<T, CallError<E>>
    where
        P: RetryPolicy<E>,
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut retries: u32 = 0;

        loop {
            let error = match self.breaker.execute(&mut op).await {
                Ok(value) => return Ok(value),
                Err(CallError::Failed(error)) => error,
                Err(open) => {
                    debug!(
                        dependency = %self.breaker.name(),
                        retries,
                        "Guarded call short-circuited"
                    );
                    return Err(open);
                }
            };

            match self.policy.should_retry(&error) {
                RetryDecision::Retry => {
                    debug!(
                        dependency = %self.breaker.name(),
                        attempt = retries + 1,
                        error = %error,
                        "Retrying guarded call"
                    );

                    if let Some(backoff) = &self.backoff {
                        tokio::time::sleep(backoff.delay(retries)).await;
                    }
                    retries = retries.saturating_add(1);
                }
                RetryDecision::GiveUp => {
                    warn!(
                        dependency = %self.breaker.name(),
                        retries,
                        error = %error,
                        "Guarded call gave up"
                    );
                    return Err(CallError::Failed(error));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::resilience::{CircuitBreakerConfig, CircuitState, ProviderRetryPolicy};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, Copy)]
    struct AlwaysRetry;

    impl<E> RetryPolicy<E> for AlwaysRetry {
        fn should_retry(&self, _error: &E) -> RetryDecision {
            RetryDecision::Retry
        }
    }

    fn breaker(threshold: u32) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "ec2",
            CircuitBreakerConfig::default().with_failure_threshold(threshold),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_succeeds() {
        let guarded = GuardedCall::new(breaker(5), AlwaysRetry);
        let calls = AtomicU32::new(0);

        let result = guarded
            .call(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ProviderError::unavailable("try again"))
                } else {
                    Ok("i-0abc")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "i-0abc");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_give_up_returns_original_error() {
        let guarded = GuardedCall::new(breaker(5), ProviderRetryPolicy);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = guarded
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::invalid_request("unknown image").with_code("InvalidAMIID"))
            })
            .await;

        match result {
            Err(CallError::Failed(error)) => assert_eq!(error.code.as_deref(), Some("InvalidAMIID")),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_ends_retry_chain() {
        let cb = breaker(3);
        let guarded = GuardedCall::new(Arc::clone(&cb), AlwaysRetry);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = guarded
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::throttled("slow down"))
            })
            .await;

        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_caps_attempts() {
        let guarded = GuardedCall::new(breaker(100), ProviderRetryPolicy).with_retry_budget(2);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = guarded
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::throttled("slow down"))
            })
            .await;

        assert!(matches!(result, Err(CallError::Failed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_waits_between_attempts() {
        let guarded = GuardedCall::new(breaker(5), AlwaysRetry).with_backoff(BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(10),
            jitter: 0.0,
        });
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = guarded
            .call(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::unavailable("try again"))
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        // 1s after the first failure, 2s after the second.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }
}
