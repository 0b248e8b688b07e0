//! Actors for the node manager.
//!
//! A small mailbox-based actor framework plus the worker node supervisor
//! built on it.
//!
//! ## Design Principles
//!
//! - **One actor per worker node**: each actor owns the state and side effects
//!   for a single provisioned resource
//! - **Results return as messages**: provider calls run in spawned tasks and
//!   report back through the mailbox, so state changes stay serialized
//! - **Crash isolation**: a failing node never takes its siblings down

mod framework;
mod worker_node;

pub use framework::{
    Actor, ActorContext, ActorError, ActorHandle, ActorRef, ActorState, ActorSystem, Message,
};
pub use worker_node::{
    CommandReply, NodeStatus, PendingCommand, ReplyTo, SupervisorState, WorkerNode,
    WorkerNodeHandle, WorkerNodeMessage,
};
