//! Error taxonomy for the node manager.
//!
//! - [`ProviderError`]: what the cloud provider reports. Classified as
//!   transient or permanent by [`crate::resilience::ProviderRetryPolicy`].
//! - [`CallError`]: the terminal outcome of a guarded call. `CircuitOpen` is
//!   a local fast-fail, not a provider error.
//! - [`WorkerCommandFailed`]: the reply a requester receives when its command
//!   will never reach the worker.

use std::fmt;
use std::time::Duration;

use fleet_id::CommandId;
use serde::Serialize;
use thiserror::Error;

// =============================================================================
// Provider Errors
// =============================================================================

/// Coarse classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Request rate exceeded (HTTP 429, `RequestLimitExceeded`).
    Throttled,
    /// Provider endpoint temporarily unavailable (HTTP 503).
    ServiceUnavailable,
    /// The request timed out before the provider answered.
    Timeout,
    /// Connection-level failure.
    Network,
    /// The request was malformed or referenced invalid parameters.
    InvalidRequest,
    /// Credentials were rejected or lack permission.
    Unauthorized,
    /// The referenced resource does not exist.
    NotFound,
    /// Account limits prevent the request.
    QuotaExceeded,
    /// Anything the provider integration could not classify.
    Other,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Throttled => "throttled",
            Self::ServiceUnavailable => "service unavailable",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::InvalidRequest => "invalid request",
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not found",
            Self::QuotaExceeded => "quota exceeded",
            Self::Other => "unclassified",
        };
        f.write_str(s)
    }
}

/// An error reported by the cloud provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("provider error ({kind}): {message}")]
pub struct ProviderError {
    /// Classification used by retry policies.
    pub kind: ProviderErrorKind,

    /// Provider-specific status code, if any (e.g. `InsufficientInstanceCapacity`).
    pub code: Option<String>,

    /// Human-readable message.
    pub message: String,
}

impl ProviderError {
    /// Create a new provider error.
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    /// Attach a provider status code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn throttled(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Throttled, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::ServiceUnavailable, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::InvalidRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Unauthorized, message)
    }

    /// A completion handler was dropped without ever being resolved.
    pub fn abandoned() -> Self {
        Self::new(
            ProviderErrorKind::Other,
            "provider dropped the completion handler without a result",
        )
    }
}

// =============================================================================
// Guarded Call Errors
// =============================================================================

/// Terminal failure of a guarded call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError<E> {
    /// The circuit breaker rejected the call without invoking the operation.
    #[error("circuit '{dependency}' is open, retry after {retry_after:?}")]
    CircuitOpen {
        dependency: String,
        retry_after: Duration,
    },

    /// The operation failed and the retry policy gave up.
    #[error("{0}")]
    Failed(E),
}

impl<E> CallError<E> {
    /// Returns true if the breaker short-circuited the call.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Cooldown remaining when the circuit rejected the call.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            Self::Failed(_) => None,
        }
    }
}

/// Why tearing down a resource did not complete cleanly.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TeardownError {
    #[error("destroy call failed: {0}")]
    Call(#[from] CallError<ProviderError>),

    #[error("destroy call did not finish within {0:?}")]
    TimedOut(Duration),
}

// =============================================================================
// Worker Transport Errors
// =============================================================================

/// Failure delivering a command to a ready worker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("worker unreachable: {0}")]
    Unreachable(String),

    #[error("worker rejected command: {0}")]
    Rejected(String),
}

// =============================================================================
// Command Failures
// =============================================================================

/// Why a command was failed instead of delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The node is shutting down.
    ShuttingDown,
    /// Provisioning the backing resource failed for good.
    ProvisioningFailed(String),
    /// The worker never reported ready within the configured timeout.
    ReadyTimeout,
    /// Consecutive health checks failed.
    Unhealthy,
    /// The worker could not be reached or refused the command.
    Undeliverable(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShuttingDown => f.write_str("shutting down"),
            Self::ProvisioningFailed(detail) => write!(f, "provisioning failed: {detail}"),
            Self::ReadyTimeout => f.write_str("worker never became ready"),
            Self::Unhealthy => f.write_str("worker failed health checks"),
            Self::Undeliverable(detail) => write!(f, "undeliverable: {detail}"),
        }
    }
}

/// Reply sent to a requester whose command was not executed.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[error("command {id} failed: {reason}")]
pub struct WorkerCommandFailed {
    pub id: CommandId,
    pub reason: FailureReason,
}

impl WorkerCommandFailed {
    pub fn new(id: CommandId, reason: FailureReason) -> Self {
        Self { id, reason }
    }
}
