//! Circuit breaker for a named remote dependency.
//!
//! ```text
//!            failures >= threshold (within window)
//!   Closed ─────────────────────────────────────────► Open
//!     ▲                                                │ cooldown elapsed
//!     │ trial succeeds                                 ▼
//!     └──────────────────────────────────────────── HalfOpen
//!                        trial fails ──► Open (cooldown restarts)
//! ```
//!
//! While Open, [`CircuitBreaker::execute`] returns
//! [`CallError::CircuitOpen`] without invoking the operation. HalfOpen lets
//! exactly one trial through; concurrent callers are rejected until the trial
//! has recorded its outcome.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::CallError;

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Failures within `window` that open the circuit.
    pub failure_threshold: u32,

    /// Rolling window for counting failures.
    pub window: Duration,

    /// How long the circuit stays open before allowing a trial call.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are rejected until the cooldown elapses.
    Open,
    /// One trial call is allowed through.
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Circuit breaker guarding one remote dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Dependency name, used in logs and `CircuitOpen` errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Recorded state. An Open circuit whose cooldown has elapsed still
    /// reports Open until the next call moves it to HalfOpen.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Failures currently inside the rolling window.
    pub fn failure_count(&self) -> usize {
        let mut inner = self.lock();
        self.prune(&mut inner, Instant::now());
        inner.failures.len()
    }

    /// Run `op` under the breaker.
    ///
    /// The operation is only invoked if a permit is granted; its outcome is
    /// recorded before this returns.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire()?;

        match op().await {
            Ok(value) => {
                permit.record(true);
                Ok(value)
            }
            Err(error) => {
                permit.record(false);
                Err(CallError::Failed(error))
            }
        }
    }

    fn acquire<E>(&self) -> Result<Permit<'_>, CallError<E>> {
        let mut inner = self.lock();
        let now = Instant::now();

        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);

                if elapsed >= self.config.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(dependency = %self.name, "Circuit half-open, allowing trial call");
                    Ok(Permit::new(self, true))
                } else {
                    Err(self.rejected(self.config.cooldown - elapsed))
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    debug!(dependency = %self.name, "Trial call in flight, rejecting");
                    Err(self.rejected(self.config.cooldown))
                } else {
                    inner.trial_in_flight = true;
                    Ok(Permit::new(self, true))
                }
            }
        }
    }

    fn rejected<E>(&self, retry_after: Duration) -> CallError<E> {
        CallError::CircuitOpen {
            dependency: self.name.clone(),
            retry_after,
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();

        if trial {
            inner.trial_in_flight = false;
        }

        match inner.state {
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Closed;
                inner.failures.clear();
                inner.opened_at = None;
                info!(dependency = %self.name, "Circuit closed after successful trial");
            }
            CircuitState::Closed => inner.failures.clear(),
            // Only the trial decides HalfOpen; a call admitted while Closed
            // may finish after the circuit opened.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        let now = Instant::now();

        if trial {
            inner.trial_in_flight = false;
        }

        match inner.state {
            CircuitState::Closed => {
                inner.failures.push_back(now);
                self.prune(&mut inner, now);

                if inner.failures.len() >= self.config.failure_threshold as usize {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    warn!(
                        dependency = %self.name,
                        failures = inner.failures.len(),
                        cooldown_ms = self.config.cooldown.as_millis() as u64,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                warn!(dependency = %self.name, "Trial call failed, circuit re-opened");
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn prune(&self, inner: &mut Inner, now: Instant) {
        while let Some(oldest) = inner.failures.front() {
            if now.saturating_duration_since(*oldest) >= self.config.window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission for one call. Dropping it unrecorded (the caller's future was
/// cancelled) counts as a failure so a HalfOpen trial cannot wedge the breaker.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    recorded: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            recorded: false,
        }
    }

    fn record(mut self, success: bool) {
        self.recorded = true;
        if success {
            self.breaker.on_success(self.trial);
        } else {
            self.breaker.on_failure(self.trial);
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.recorded && self.trial {
            self.breaker.on_failure(true);
        }
    }
}
