//! Mailbox actors on tokio.
//!
//! Each actor runs on its own task and drains a bounded mailbox one message
//! at a time. The [`ActorSystem`] owns the tasks and their stop signals;
//! callers only ever hold an [`ActorHandle`].

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

// =============================================================================
// Core Traits
// =============================================================================

/// Anything that can sit in a mailbox.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// Behavior of a single actor.
///
/// `handle` is never called concurrently with itself, so the actor can keep
/// plain mutable state. Slow work belongs in a spawned task that reports back
/// through [`ActorContext::myself`].
#[async_trait]
pub trait Actor: Send + 'static {
    type Message: Message;

    /// Short type name, used as the actor ID prefix.
    fn name(&self) -> &str;

    /// Process one message. `Ok(false)` stops the actor.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext<Self::Message>,
    ) -> Result<bool, ActorError>;

    /// Runs before the first message. An error stops the actor.
    async fn on_start(&mut self, _ctx: &mut ActorContext<Self::Message>) -> Result<(), ActorError> {
        Ok(())
    }

    /// Receives each message still queued when the actor stops, before
    /// `on_stop`.
    fn on_unhandled(&mut self, _msg: Self::Message) {}

    /// Runs once on the way out, whatever ended the loop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext<Self::Message>) {}
}

/// Per-actor bookkeeping handed to every callback.
pub struct ActorContext<M: Message> {
    pub actor_id: String,

    /// This actor's own mailbox.
    pub myself: ActorHandle<M>,

    pub messages_processed: u64,
    pub last_message_at: Option<Instant>,
    pub state: ActorState,
}

impl<M: Message> ActorContext<M> {
    fn new(actor_id: String, myself: ActorHandle<M>) -> Self {
        Self {
            actor_id,
            myself,
            messages_processed: 0,
            last_message_at: None,
            state: ActorState::Starting,
        }
    }
}

/// Where an actor is in its run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum ActorError {
    /// Stops the actor.
    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("mailbox full")]
    MailboxFull,

    #[error("actor stopped")]
    ActorStopped,
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Cloneable sender side of an actor's mailbox.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
    actor_id: String,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}

impl<M: Message> Debug for ActorHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorHandle")
            .field("actor_id", &self.actor_id)
            .finish_non_exhaustive()
    }
}

impl<M: Message> ActorHandle<M> {
    /// Enqueue a message, waiting for mailbox space.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ActorError::ActorStopped)
    }

    /// Like [`send`](Self::send), but hands the message back if the actor
    /// has stopped.
    pub async fn send_or_return(&self, msg: M) -> Result<(), M> {
        self.tx.send(msg).await.map_err(|mpsc::error::SendError(msg)| msg)
    }

    /// Enqueue without waiting.
    pub fn try_send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ActorError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => ActorError::ActorStopped,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }
}

/// The system's record of one spawned actor.
pub struct ActorRef {
    pub actor_id: String,
    pub actor_type: String,
    task: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl ActorRef {
    /// Ask the actor to leave its loop after the current message.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

// =============================================================================
// Actor System
// =============================================================================

/// Owns every spawned actor task.
#[derive(Default)]
pub struct ActorSystem {
    children: HashMap<String, ActorRef>,
}

impl ActorSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `actor` on its own task with room for `mailbox_size` messages.
    pub fn spawn<A: Actor>(&mut self, actor: A, mailbox_size: usize) -> ActorHandle<A::Message> {
        let actor_type = actor.name().to_string();
        let actor_id = format!("{}_{}", actor_type, next_actor_seq());
        let (tx, rx) = mpsc::channel(mailbox_size.max(1));
        let (stop, stopped) = watch::channel(false);

        let handle = ActorHandle {
            tx,
            actor_id: actor_id.clone(),
        };
        let ctx = ActorContext::new(actor_id.clone(), handle.clone());
        let task = tokio::spawn(run_actor_loop(actor, rx, stopped, ctx));

        info!(actor_id = %actor_id, actor_type = %actor_type, "Spawned actor");
        self.children.insert(
            actor_id.clone(),
            ActorRef {
                actor_id,
                actor_type,
                task,
                stop,
            },
        );

        handle
    }

    /// Signal every actor to stop, wait up to `grace`, then abort stragglers.
    pub async fn stop_all(&mut self, grace: Duration) {
        info!(count = self.children.len(), "Stopping all actors");

        for child in self.children.values() {
            child.stop();
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && self.running_count() > 0 {
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        for child in self.children.values().filter(|c| c.is_running()) {
            warn!(actor_id = %child.actor_id, "Actor did not stop in time, aborting");
            child.abort();
        }

        self.children.clear();
    }

    pub fn running_count(&self) -> usize {
        self.children.values().filter(|c| c.is_running()).count()
    }
}

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Actor Loop
// =============================================================================

async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut stopped: watch::Receiver<bool>,
    mut ctx: ActorContext<A::Message>,
) {
    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %ctx.actor_id, error = %e, "Actor failed to start");
        ctx.state = ActorState::Failed;
    } else {
        ctx.state = ActorState::Running;
        debug!(actor_id = %ctx.actor_id, "Actor started");
        process_mailbox(&mut actor, &mut rx, &mut stopped, &mut ctx).await;
    }

    drain_mailbox(&mut actor, &mut rx);

    if ctx.state != ActorState::Failed {
        ctx.state = ActorState::Stopping;
    }
    actor.on_stop(&mut ctx).await;
    if ctx.state != ActorState::Failed {
        ctx.state = ActorState::Stopped;
    }

    info!(
        actor_id = %ctx.actor_id,
        messages_processed = ctx.messages_processed,
        "Actor stopped"
    );
}

async fn process_mailbox<A: Actor>(
    actor: &mut A,
    rx: &mut mpsc::Receiver<A::Message>,
    stopped: &mut watch::Receiver<bool>,
    ctx: &mut ActorContext<A::Message>,
) {
    loop {
        tokio::select! {
            biased;

            // A dropped stop sender means the system itself is gone.
            changed = stopped.changed() => {
                if changed.is_err() || *stopped.borrow() {
                    info!(actor_id = %ctx.actor_id, "Actor received stop signal");
                    return;
                }
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(actor_id = %ctx.actor_id, "Actor mailbox closed");
                    return;
                };

                ctx.messages_processed += 1;
                ctx.last_message_at = Some(Instant::now());

                match actor.handle(msg, ctx).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(actor_id = %ctx.actor_id, "Actor requested stop");
                        return;
                    }
                    Err(ActorError::Permanent(reason)) => {
                        error!(actor_id = %ctx.actor_id, reason = %reason, "Actor failed");
                        ctx.state = ActorState::Failed;
                        return;
                    }
                    Err(e) => warn!(actor_id = %ctx.actor_id, error = %e, "Actor error"),
                }
            }
        }
    }
}

/// Refuse new messages and hand anything already queued back to the actor.
fn drain_mailbox<A: Actor>(actor: &mut A, rx: &mut mpsc::Receiver<A::Message>) {
    rx.close();
    while let Ok(msg) = rx.try_recv() {
        actor.on_unhandled(msg);
    }
}

static ACTOR_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_actor_seq() -> u64 {
    ACTOR_SEQ.fetch_add(1, Ordering::Relaxed)
}

// =============================================================================
// Tests
// =============================================================================
