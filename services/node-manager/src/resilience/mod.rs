//! Resilience layer for remote provider calls.
//!
//! - [`RetryPolicy`]: classifies an error as worth retrying or not
//! - [`CircuitBreaker`]: fails fast while a dependency is unhealthy
//! - [`GuardedCall`]: composes the two around one remote operation
//! - [`BackoffPolicy`]: optional pause between retries

mod backoff;
mod circuit_breaker;
mod guarded;
mod retry;

pub use backoff::BackoffPolicy;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use guarded::GuardedCall;
pub use retry::{ProviderRetryPolicy, RetryBudget, RetryDecision, RetryPolicy};
