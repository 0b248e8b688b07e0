//! Recurring health-check ticks delivered into an actor's mailbox.
//!
//! The timer never touches actor state; it only enqueues a tick message.
//! `cancel()` flips a `watch` flag that the ticking task checks before each
//! delivery and aborts the task, so no delivery starts after `cancel()`
//! returns. A tick already sitting in the mailbox is the actor's to discard
//! (see the epoch check in the worker node).

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::actors::{ActorError, ActorHandle, Message};

/// Cancellable fixed-interval tick source.
#[derive(Debug)]
pub struct HealthCheckTimer {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HealthCheckTimer {
    /// Start ticking. The first tick fires one `interval` from now.
    pub fn start<M, F>(interval: Duration, target: ActorHandle<M>, make_tick: F) -> Self
    where
        M: Message,
        F: Fn() -> M + Send + 'static,
    {
        let (cancel, mut cancelled) = watch::channel(false);
        let period = interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = cancelled.changed() => break,

                    _ = ticker.tick() => {
                        if *cancelled.borrow() {
                            break;
                        }

                        match target.try_send(make_tick()) {
                            Ok(()) => {}
                            Err(ActorError::MailboxFull) => {
                                debug!(actor_id = %target.actor_id(), "Mailbox full, skipping health-check tick");
                            }
                            Err(_) => break,
                        }
                    }
                }
            }

            debug!(actor_id = %target.actor_id(), "Health-check timer stopped");
        });

        Self { cancel, task }
    }

    /// Stop delivering ticks.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
        self.task.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

impl Drop for HealthCheckTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
