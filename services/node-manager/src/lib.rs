//! Fleet Node Manager Library
//!
//! Supervises cloud-backed worker nodes. Each node provisions exactly one
//! resource, buffers commands until its worker reports ready, forwards them
//! in order, runs periodic health checks and always tears its resource down
//! when it shuts down.
//!
//! ## Architecture
//!
//! ```text
//! ActorSystem
//! └── WorkerNode(id)   (per-node lifecycle)
//!     ├── provisioning task  ──► Provider (GuardedCall: retry + circuit breaker)
//!     ├── HealthCheckTimer   ──► HealthCheck ticks
//!     └── forwarder task     ──► WorkerTransport
//! ```
//!
//! ## Modules
//!
//! - `actors`: Actor framework and the worker node supervisor
//! - `resilience`: Retry policies, circuit breaker, guarded calls
//! - `provider`: Cloud provider seam, callback bridge and mock
//! - `transport`: Command delivery to ready workers

pub mod actors;
pub mod config;
pub mod error;
pub mod provider;
pub mod resilience;
pub mod timer;
pub mod transport;

pub use actors::{NodeStatus, SupervisorState, WorkerNode, WorkerNodeHandle};
pub use config::{Config, WorkerNodeConfig};
pub use error::{CallError, FailureReason, ProviderError, ProviderErrorKind, WorkerCommandFailed};
