//! Retry classification.
//!
//! A [`RetryPolicy`] only decides; it never sleeps or re-invokes anything.
//! [`super::GuardedCall`] owns the loop.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{ProviderError, ProviderErrorKind};

/// Outcome of classifying a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    GiveUp,
}

/// Decides whether an error warrants another attempt.
pub trait RetryPolicy<E>: Send + Sync {
    fn should_retry(&self, error: &E) -> RetryDecision;
}

/// Classifies [`ProviderError`]s by kind.
///
/// Transient conditions (throttling, unavailability, timeouts, network
/// faults) are retried. Everything else, including errors the provider
/// integration could not classify, gives up.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderRetryPolicy;

impl RetryPolicy<ProviderError> for ProviderRetryPolicy {
    fn should_retry(&self, error: &ProviderError) -> RetryDecision {
        match error.kind {
            ProviderErrorKind::Throttled
            | ProviderErrorKind::ServiceUnavailable
            | ProviderErrorKind::Timeout
            | ProviderErrorKind::Network => RetryDecision::Retry,
            ProviderErrorKind::InvalidRequest
            | ProviderErrorKind::Unauthorized
            | ProviderErrorKind::NotFound
            | ProviderErrorKind::QuotaExceeded
            | ProviderErrorKind::Other => RetryDecision::GiveUp,
        }
    }
}

/// Caps the number of retries granted by an inner policy.
///
/// Holds a counter, so one budget covers exactly one call chain. Build a
/// fresh one per call via [`super::GuardedCall::with_retry_budget`].
#[derive(Debug)]
pub struct RetryBudget<P> {
    inner: P,
    remaining: AtomicU32,
}

impl<P> RetryBudget<P> {
    pub fn new(inner: P, max_retries: u32) -> Self {
        Self {
            inner,
            remaining: AtomicU32::new(max_retries),
        }
    }

    /// Retries still available.
    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::SeqCst)
    }
}

impl<E, P: RetryPolicy<E>> RetryPolicy<E> for RetryBudget<P> {
    fn should_retry(&self, error: &E) -> RetryDecision {
        if self.inner.should_retry(error) == RetryDecision::GiveUp {
            return RetryDecision::GiveUp;
        }

        let granted = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if granted {
            RetryDecision::Retry
        } else {
            RetryDecision::GiveUp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ProviderErrorKind::Throttled, RetryDecision::Retry)]
    #[case(ProviderErrorKind::ServiceUnavailable, RetryDecision::Retry)]
    #[case(ProviderErrorKind::Timeout, RetryDecision::Retry)]
    #[case(ProviderErrorKind::Network, RetryDecision::Retry)]
    #[case(ProviderErrorKind::InvalidRequest, RetryDecision::GiveUp)]
    #[case(ProviderErrorKind::Unauthorized, RetryDecision::GiveUp)]
    #[case(ProviderErrorKind::NotFound, RetryDecision::GiveUp)]
    #[case(ProviderErrorKind::QuotaExceeded, RetryDecision::GiveUp)]
    #[case(ProviderErrorKind::Other, RetryDecision::GiveUp)]
    fn test_provider_classification(#[case] kind: ProviderErrorKind, #[case] expected: RetryDecision) {
        let error = ProviderError::new(kind, "boom");
        assert_eq!(ProviderRetryPolicy.should_retry(&error), expected);
    }

    #[test]
    fn test_status_code_does_not_change_classification() {
        let error = ProviderError::invalid_request("bad ami").with_code("RequestLimitExceeded");
        assert_eq!(ProviderRetryPolicy.should_retry(&error), RetryDecision::GiveUp);
    }

    #[test]
    fn test_budget_exhausts() {
        let budget = RetryBudget::new(ProviderRetryPolicy, 2);
        let transient = ProviderError::throttled("slow down");

        assert_eq!(budget.should_retry(&transient), RetryDecision::Retry);
        assert_eq!(budget.should_retry(&transient), RetryDecision::Retry);
        assert_eq!(budget.should_retry(&transient), RetryDecision::GiveUp);
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn test_budget_not_spent_on_permanent_errors() {
        let budget = RetryBudget::new(ProviderRetryPolicy, 1);
        let permanent = ProviderError::unauthorized("expired credentials");

        assert_eq!(budget.should_retry(&permanent), RetryDecision::GiveUp);
        assert_eq!(budget.remaining(), 1);
    }
}
