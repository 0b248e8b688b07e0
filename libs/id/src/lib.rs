//! # fleet-id
//!
//! Typed identifiers shared by the node manager and its callers.
//!
//! Every ID renders as `{prefix}_{ulid}`:
//!
//! - `wn_01HV4Z2WQXKJNM8GPQY6VBKC3D` - a supervised worker node
//! - `cmd_01HV4Z3MXNKPQR9HSTZ7WCLD4E` - a command routed to a worker node
//!
//! The prefix keeps a command ID from being passed where a node ID is
//! expected, and ULIDs sort by creation time, so logs of buffered commands
//! read in arrival order.

mod error;
mod macros;
mod types;

pub use error::IdError;
#[doc(hidden)]
pub use macros::parse_prefixed;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
