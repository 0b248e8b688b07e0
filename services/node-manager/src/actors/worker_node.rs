//! Worker node actor - supervises one cloud-backed worker for its whole life.
//!
//! The WorkerNode:
//! - Provisions its resource through a [`GuardedCall`] on start
//! - Buffers commands until the worker reports ready, then forwards them in
//!   arrival order and routes each response back to its requester
//! - Runs out-of-band health checks on a cancellable timer
//! - On shutdown, fails every buffered or in-flight command with an explicit
//!   reply and tears the resource down, best effort
//!
//! ## State Machine
//!
//! ```text
//! Provisioning ──ready──► Initialized
//!      │                       │
//!      └──────shutdown/fatal───┴──► ShuttingDown ──destroyed/failed──► Terminated
//! ```
//!
//! Provider calls, health probes and deliveries run in spawned tasks; their
//! results come back through the mailbox, so all state changes happen on the
//! actor task.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_id::{CommandId, WorkerNodeId};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::framework::{Actor, ActorContext, ActorError, ActorHandle, ActorSystem};
use crate::config::WorkerNodeConfig;
use crate::error::{
    CallError, FailureReason, ProviderError, TeardownError, TransportError, WorkerCommandFailed,
};
use crate::provider::{Provider, ResourceHandle, ResourceSpec};
use crate::resilience::{
    BackoffPolicy, CircuitBreaker, GuardedCall, ProviderRetryPolicy, RetryBudget, RetryPolicy,
};
use crate::timer::HealthCheckTimer;
use crate::transport::WorkerTransport;

/// Shortest wait between re-issues while a circuit is open.
const MIN_PATIENCE_STEP: Duration = Duration::from_millis(10);

// =============================================================================
// Commands
// =============================================================================

/// What a requester eventually receives for its command.
pub type CommandReply = Result<Value, WorkerCommandFailed>;

/// Where the reply for a command goes. Consumed by the single reply.
pub type ReplyTo = oneshot::Sender<CommandReply>;

/// A command addressed to the worker.
#[derive(Debug)]
pub struct PendingCommand {
    pub id: CommandId,
    pub payload: Value,
    pub reply_to: ReplyTo,
}

impl PendingCommand {
    /// Create a command with a fresh ID and the receiver for its reply.
    pub fn new(payload: Value) -> (Self, oneshot::Receiver<CommandReply>) {
        let (reply_to, rx) = oneshot::channel();
        let command = Self {
            id: CommandId::new(),
            payload,
            reply_to,
        };
        (command, rx)
    }

    fn fail(self, reason: FailureReason) {
        let _ = self
            .reply_to
            .send(Err(WorkerCommandFailed::new(self.id, reason)));
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Messages handled by WorkerNode.
#[derive(Debug)]
pub enum WorkerNodeMessage {
    /// Route a command to the worker.
    Command(PendingCommand),

    /// The worker reported it is ready to accept commands.
    Ready,

    /// Tear the node down.
    Shutdown,

    /// Health-check timer tick.
    HealthCheck { epoch: u64 },

    /// Outcome of the provisioning call.
    Provisioned(Result<ResourceHandle, CallError<ProviderError>>),

    /// Outcome of a provider health probe.
    HealthChecked {
        epoch: u64,
        result: Result<bool, ProviderError>,
    },

    /// The worker answered (or failed to answer) a forwarded command.
    Delivered {
        id: CommandId,
        result: Result<Value, TransportError>,
    },

    /// Outcome of the destroy call.
    Destroyed(Result<(), TeardownError>),

    /// Shutdown has waited `teardown_timeout` for provisioning to return.
    ProvisioningOverdue,
}

// =============================================================================
// State
// =============================================================================

/// Lifecycle phase of a worker node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    /// Resource requested or booting; commands are buffered.
    Provisioning,
    /// Worker ready; commands are forwarded.
    Initialized,
    /// Teardown in progress; commands are refused.
    ShuttingDown,
    /// Nothing left to do.
    Terminated,
}

/// Snapshot published after every message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub node_id: WorkerNodeId,
    pub state: SupervisorState,
    pub instance_id: Option<String>,
    pub address: Option<IpAddr>,
    /// Commands waiting for readiness.
    pub buffered: usize,
    /// Commands handed to the worker and not yet answered.
    pub in_flight: usize,
    /// Commands handed to the worker.
    pub forwarded: u64,
    /// Commands the worker answered.
    pub completed: u64,
    /// Failure replies sent.
    pub failed: u64,
    /// Health-check ticks processed.
    pub health_checks: u64,
    pub last_error: Option<String>,
}

impl NodeStatus {
    fn new(node_id: WorkerNodeId) -> Self {
        Self {
            node_id,
            state: SupervisorState::Provisioning,
            instance_id: None,
            address: None,
            buffered: 0,
            in_flight: 0,
            forwarded: 0,
            completed: 0,
            failed: 0,
            health_checks: 0,
            last_error: None,
        }
    }

    /// Still provisioning or serving commands.
    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            SupervisorState::Provisioning | SupervisorState::Initialized
        )
    }
}

// =============================================================================
// Forwarder
// =============================================================================

/// Delivers commands to the worker one at a time, in the order queued.
struct Forwarder {
    tx: mpsc::UnboundedSender<(CommandId, Value)>,
    task: JoinHandle<()>,
}

impl Forwarder {
    fn spawn<T: WorkerTransport>(
        transport: Arc<T>,
        handle: Arc<ResourceHandle>,
        node: ActorHandle<WorkerNodeMessage>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(CommandId, Value)>();

        let task = tokio::spawn(async move {
            while let Some((id, payload)) = rx.recv().await {
                let result = transport.deliver(&handle, id, payload).await;
                if node
                    .send(WorkerNodeMessage::Delivered { id, result })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        Self { tx, task }
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// =============================================================================
// Worker Node Actor
// =============================================================================

/// Actor supervising a single worker node.
pub struct WorkerNode<P: Provider, T: WorkerTransport> {
    node_id: WorkerNodeId,
    spec: ResourceSpec,
    config: WorkerNodeConfig,
    provider: Arc<P>,
    transport: Arc<T>,
    breaker: Arc<CircuitBreaker>,
    backoff: Option<BackoffPolicy>,

    state: SupervisorState,
    handle: Option<Arc<ResourceHandle>>,
    pending: VecDeque<PendingCommand>,
    in_flight: HashMap<CommandId, ReplyTo>,
    forwarder: Option<Forwarder>,

    health_timer: Option<HealthCheckTimer>,
    /// Bumped whenever the timer is cancelled; ticks and probe results from
    /// an older epoch are dropped.
    timer_epoch: u64,
    health_check_in_flight: bool,
    consecutive_unhealthy: u32,

    /// Present while the provisioning task runs; `true` ends its patience wait.
    provisioning: Option<watch::Sender<bool>>,
    ready_early: bool,
    started_at: Instant,

    status: watch::Sender<NodeStatus>,
    snapshot: NodeStatus,
}

impl<P: Provider, T: WorkerTransport> WorkerNode<P, T> {
    /// Create a worker node with its own circuit breaker for `provider`.
    pub fn new(
        spec: ResourceSpec,
        config: WorkerNodeConfig,
        provider: Arc<P>,
        transport: Arc<T>,
    ) -> Self {
        let node_id = WorkerNodeId::new();
        let breaker = Arc::new(CircuitBreaker::new(provider.name(), config.breaker));
        let snapshot = NodeStatus::new(node_id);
        let (status, _) = watch::channel(snapshot.clone());

        Self {
            node_id,
            spec,
            config,
            provider,
            transport,
            breaker,
            backoff: None,
            state: SupervisorState::Provisioning,
            handle: None,
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
            forwarder: None,
            health_timer: None,
            timer_epoch: 0,
            health_check_in_flight: false,
            consecutive_unhealthy: 0,
            provisioning: None,
            ready_early: false,
            started_at: Instant::now(),
            status,
            snapshot,
        }
    }

    /// Share a breaker with other nodes calling the same provider.
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    /// Pause between provider retries.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn node_id(&self) -> WorkerNodeId {
        self.node_id
    }

    /// Spawn the node on `system` and return its handle.
    pub fn spawn(self, system: &mut ActorSystem) -> WorkerNodeHandle {
        let node_id = self.node_id;
        let status = self.status.subscribe();
        let mailbox_size = self.config.mailbox_size;
        let actor = system.spawn(self, mailbox_size);

        WorkerNodeHandle {
            node_id,
            actor,
            status,
        }
    }

    fn guarded(&self) -> GuardedCall<ProviderRetryPolicy> {
        let guarded = GuardedCall::new(Arc::clone(&self.breaker), ProviderRetryPolicy);
        match &self.backoff {
            Some(backoff) => guarded.with_backoff(backoff.clone()),
            None => guarded,
        }
    }

    fn is_live(&self) -> bool {
        matches!(
            self.state,
            SupervisorState::Provisioning | SupervisorState::Initialized
        )
    }

    // -------------------------------------------------------------------------
    // Message Handlers
    // -------------------------------------------------------------------------

    fn handle_command(&mut self, command: PendingCommand) {
        match self.state {
            SupervisorState::Provisioning => {
                debug!(
                    node_id = %self.node_id,
                    command_id = %command.id,
                    buffered = self.pending.len() + 1,
                    "Buffering command until worker is ready"
                );
                self.pending.push_back(command);
            }
            SupervisorState::Initialized => self.forward(command),
            SupervisorState::ShuttingDown | SupervisorState::Terminated => {
                debug!(
                    node_id = %self.node_id,
                    command_id = %command.id,
                    "Refusing command during shutdown"
                );
                self.reject(command, FailureReason::ShuttingDown);
            }
        }
    }

    fn handle_ready(&mut self, ctx: &ActorContext<WorkerNodeMessage>) {
        match self.state {
            SupervisorState::Provisioning if self.handle.is_some() => self.become_initialized(ctx),
            SupervisorState::Provisioning => {
                debug!(
                    node_id = %self.node_id,
                    "Readiness reported before provisioning completed"
                );
                self.ready_early = true;
            }
            SupervisorState::Initialized => {
                debug!(node_id = %self.node_id, "Duplicate readiness ignored");
            }
            SupervisorState::ShuttingDown | SupervisorState::Terminated => {
                debug!(node_id = %self.node_id, "Readiness ignored during shutdown");
            }
        }
    }

    fn handle_provisioned(
        &mut self,
        result: Result<ResourceHandle, CallError<ProviderError>>,
        ctx: &ActorContext<WorkerNodeMessage>,
    ) {
        self.provisioning = None;

        match (self.state, result) {
            (SupervisorState::Provisioning, Ok(handle)) => {
                info!(
                    node_id = %self.node_id,
                    instance_id = %handle.provider_instance_id,
                    address = %handle.address,
                    elapsed_ms = self.started_at.elapsed().as_millis() as u64,
                    "Resource provisioned"
                );
                self.adopt(handle);
                if self.ready_early {
                    self.become_initialized(ctx);
                }
            }
            (SupervisorState::Provisioning, Err(e)) => {
                error!(node_id = %self.node_id, error = %e, "Provisioning failed");
                self.snapshot.last_error = Some(e.to_string());
                self.begin_shutdown(FailureReason::ProvisioningFailed(e.to_string()), ctx);
            }
            (SupervisorState::ShuttingDown, Ok(handle)) => {
                info!(
                    node_id = %self.node_id,
                    instance_id = %handle.provider_instance_id,
                    "Provisioning finished after shutdown began, destroying resource"
                );
                self.adopt(handle);
                self.start_teardown(ctx);
            }
            (SupervisorState::ShuttingDown, Err(e)) => {
                debug!(
                    node_id = %self.node_id,
                    error = %e,
                    "Provisioning ended without a resource during shutdown"
                );
                self.finish();
            }
            (state, result) => {
                warn!(
                    node_id = %self.node_id,
                    state = ?state,
                    succeeded = result.is_ok(),
                    "Ignoring unexpected provisioning result"
                );
            }
        }
    }

    fn handle_health_check(&mut self, epoch: u64, ctx: &ActorContext<WorkerNodeMessage>) {
        if epoch != self.timer_epoch || !self.is_live() {
            debug!(
                node_id = %self.node_id,
                epoch,
                current_epoch = self.timer_epoch,
                "Ignoring stale health-check tick"
            );
            return;
        }

        self.snapshot.health_checks += 1;

        if self.state == SupervisorState::Provisioning {
            if let Some(timeout) = self.config.ready_timeout {
                if self.started_at.elapsed() >= timeout {
                    warn!(
                        node_id = %self.node_id,
                        timeout_secs = timeout.as_secs(),
                        "Worker did not become ready in time"
                    );
                    self.snapshot.last_error = Some("ready timeout".to_string());
                    self.begin_shutdown(FailureReason::ReadyTimeout, ctx);
                    return;
                }
            }
        }

        let Some(handle) = self.handle.clone() else {
            debug!(node_id = %self.node_id, "No resource yet, skipping health probe");
            return;
        };

        if self.health_check_in_flight {
            debug!(node_id = %self.node_id, "Previous health probe still running");
            return;
        }
        self.health_check_in_flight = true;

        let provider = Arc::clone(&self.provider);
        let node = ctx.myself.clone();
        tokio::spawn(async move {
            let result = provider.check_health(&handle).await;
            let _ = node
                .send(WorkerNodeMessage::HealthChecked { epoch, result })
                .await;
        });
    }

    fn handle_health_checked(
        &mut self,
        epoch: u64,
        result: Result<bool, ProviderError>,
        ctx: &ActorContext<WorkerNodeMessage>,
    ) {
        if epoch != self.timer_epoch || !self.is_live() {
            debug!(node_id = %self.node_id, epoch, "Ignoring stale health probe result");
            return;
        }
        self.health_check_in_flight = false;

        let problem = match result {
            Ok(true) => {
                if self.consecutive_unhealthy > 0 {
                    info!(node_id = %self.node_id, "Worker healthy again");
                }
                self.consecutive_unhealthy = 0;
                return;
            }
            Ok(false) => "instance reported unhealthy".to_string(),
            Err(e) => e.to_string(),
        };

        self.consecutive_unhealthy += 1;
        warn!(
            node_id = %self.node_id,
            consecutive = self.consecutive_unhealthy,
            threshold = self.config.unhealthy_threshold,
            problem = %problem,
            "Health check failed"
        );

        if self.consecutive_unhealthy >= self.config.unhealthy_threshold {
            self.snapshot.last_error = Some(problem);
            self.begin_shutdown(FailureReason::Unhealthy, ctx);
        }
    }

    fn handle_delivered(&mut self, id: CommandId, result: Result<Value, TransportError>) {
        let Some(reply_to) = self.in_flight.remove(&id) else {
            debug!(
                node_id = %self.node_id,
                command_id = %id,
                "Dropping response for command already answered"
            );
            return;
        };

        match result {
            Ok(response) => {
                let _ = reply_to.send(Ok(response));
                self.snapshot.completed += 1;
            }
            Err(e) => {
                warn!(node_id = %self.node_id, command_id = %id, error = %e, "Delivery failed");
                let reason = FailureReason::Undeliverable(e.to_string());
                let _ = reply_to.send(Err(WorkerCommandFailed::new(id, reason)));
                self.snapshot.failed += 1;
            }
        }
    }

    fn handle_shutdown(&mut self, ctx: &ActorContext<WorkerNodeMessage>) {
        if self.is_live() {
            self.begin_shutdown(FailureReason::ShuttingDown, ctx);
        } else {
            debug!(node_id = %self.node_id, state = ?self.state, "Shutdown already in progress");
        }
    }

    fn handle_destroyed(&mut self, result: Result<(), TeardownError>) {
        if self.state != SupervisorState::ShuttingDown {
            warn!(node_id = %self.node_id, state = ?self.state, "Ignoring unexpected teardown result");
            return;
        }

        match result {
            Ok(()) => info!(node_id = %self.node_id, "Resource destroyed"),
            Err(e) => {
                error!(
                    node_id = %self.node_id,
                    instance_id = ?self.snapshot.instance_id,
                    error = %e,
                    "Teardown failed, resource may still be running"
                );
                self.snapshot.last_error = Some(e.to_string());
            }
        }

        self.finish();
    }

    fn handle_provisioning_overdue(&mut self) {
        if self.state != SupervisorState::ShuttingDown || self.provisioning.is_none() {
            return;
        }

        // The provisioning task still owns the call and destroys whatever
        // it returns once the node is gone.
        warn!(
            node_id = %self.node_id,
            timeout = ?self.config.teardown_timeout,
            "Provisioning did not return after shutdown, leaving late resource to the provisioning task"
        );
        self.snapshot.last_error = Some(format!(
            "provisioning still running {:?} after shutdown",
            self.config.teardown_timeout
        ));
        self.finish();
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    fn start_provisioning(&mut self, ctx: &ActorContext<WorkerNodeMessage>) {
        let (cancel, cancelled) = watch::channel(false);
        self.provisioning = Some(cancel);

        let guarded = self.guarded();
        let provider = Arc::clone(&self.provider);
        let spec = self.spec.clone();
        let node = ctx.myself.clone();
        let deadline = Instant::now() + self.config.provision_patience;
        let teardown_guarded = self.guarded().with_retry_budget(self.config.destroy_max_retries);
        let teardown_timeout = self.config.teardown_timeout;
        let node_id = self.node_id;

        info!(
            node_id = %node_id,
            image_id = %spec.image_id,
            instance_type = %spec.instance_type,
            "Provisioning resource"
        );

        tokio::spawn(async move {
            let result = call_patiently(&guarded, deadline, Some(cancelled), || {
                provider.create_resource(&spec)
            })
            .await;

            // The node stopped while the call was out; nobody else will
            // destroy this instance.
            if let Err(WorkerNodeMessage::Provisioned(Ok(handle))) =
                node.send_or_return(WorkerNodeMessage::Provisioned(result)).await
            {
                warn!(
                    node_id = %node_id,
                    instance_id = %handle.provider_instance_id,
                    "Node gone before provisioning finished, destroying orphan"
                );
                if let Err(e) =
                    teardown(&teardown_guarded, provider.as_ref(), &handle, teardown_timeout).await
                {
                    error!(node_id = %node_id, error = %e, "Failed to destroy orphaned resource");
                }
            }
        });
    }

    fn adopt(&mut self, handle: ResourceHandle) {
        self.snapshot.instance_id = Some(handle.provider_instance_id.clone());
        self.snapshot.address = Some(handle.address);
        self.handle = Some(Arc::new(handle));
    }

    fn become_initialized(&mut self, ctx: &ActorContext<WorkerNodeMessage>) {
        let Some(handle) = self.handle.clone() else {
            return;
        };

        self.forwarder = Some(Forwarder::spawn(
            Arc::clone(&self.transport),
            handle,
            ctx.myself.clone(),
        ));
        self.state = SupervisorState::Initialized;
        self.ready_early = false;

        let flushed = self.pending.len();
        while let Some(command) = self.pending.pop_front() {
            self.forward(command);
        }

        info!(node_id = %self.node_id, flushed, "Worker ready, forwarding commands");
    }

    fn forward(&mut self, command: PendingCommand) {
        let PendingCommand {
            id,
            payload,
            reply_to,
        } = command;

        let Some(forwarder) = &self.forwarder else {
            self.reject_parts(id, reply_to, FailureReason::Undeliverable("no forwarder".into()));
            return;
        };

        match forwarder.tx.send((id, payload)) {
            Ok(()) => {
                self.in_flight.insert(id, reply_to);
                self.snapshot.forwarded += 1;
            }
            Err(_) => {
                self.reject_parts(
                    id,
                    reply_to,
                    FailureReason::Undeliverable("forwarder stopped".into()),
                );
            }
        }
    }

    fn begin_shutdown(&mut self, reason: FailureReason, ctx: &ActorContext<WorkerNodeMessage>) {
        if !self.is_live() {
            return;
        }

        info!(
            node_id = %self.node_id,
            reason = %reason,
            buffered = self.pending.len(),
            in_flight = self.in_flight.len(),
            "Shutting down worker node"
        );

        // Timer goes first: no tick is processed once ShuttingDown is visible.
        self.cancel_health_timer();
        self.state = SupervisorState::ShuttingDown;
        self.forwarder = None;
        self.fail_all(&reason);

        if let Some(cancel) = &self.provisioning {
            let _ = cancel.send(true);
        }

        if self.handle.is_some() {
            self.start_teardown(ctx);
        } else if self.provisioning.is_some() {
            debug!(node_id = %self.node_id, "Waiting for in-flight provisioning");
            let node = ctx.myself.clone();
            let wait = self.config.teardown_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                let _ = node.send(WorkerNodeMessage::ProvisioningOverdue).await;
            });
        } else {
            self.finish();
        }
    }

    fn start_teardown(&mut self, ctx: &ActorContext<WorkerNodeMessage>) {
        let Some(handle) = self.handle.take() else {
            self.finish();
            return;
        };

        info!(
            node_id = %self.node_id,
            instance_id = %handle.provider_instance_id,
            "Destroying resource"
        );

        let guarded = self.guarded().with_retry_budget(self.config.destroy_max_retries);
        let provider = Arc::clone(&self.provider);
        let timeout = self.config.teardown_timeout;
        let node = ctx.myself.clone();

        tokio::spawn(async move {
            let result = teardown(&guarded, provider.as_ref(), &handle, timeout).await;
            let _ = node.send(WorkerNodeMessage::Destroyed(result)).await;
        });
    }

    fn finish(&mut self) {
        self.cancel_health_timer();
        self.forwarder = None;
        self.state = SupervisorState::Terminated;
        info!(node_id = %self.node_id, "Worker node terminated");
    }

    fn cancel_health_timer(&mut self) {
        if let Some(timer) = self.health_timer.take() {
            timer.cancel();
            self.timer_epoch += 1;
        }
        self.health_check_in_flight = false;
    }

    fn fail_all(&mut self, reason: &FailureReason) {
        let buffered: Vec<_> = self.pending.drain(..).collect();
        for command in buffered {
            self.reject(command, reason.clone());
        }

        let in_flight: Vec<_> = self.in_flight.drain().collect();
        for (id, reply_to) in in_flight {
            self.reject_parts(id, reply_to, reason.clone());
        }
    }

    fn reject(&mut self, command: PendingCommand, reason: FailureReason) {
        command.fail(reason);
        self.snapshot.failed += 1;
    }

    fn reject_parts(&mut self, id: CommandId, reply_to: ReplyTo, reason: FailureReason) {
        let _ = reply_to.send(Err(WorkerCommandFailed::new(id, reason)));
        self.snapshot.failed += 1;
    }

    fn publish(&mut self) {
        self.snapshot.state = self.state;
        self.snapshot.buffered = self.pending.len();
        self.snapshot.in_flight = self.in_flight.len();
        self.status.send_replace(self.snapshot.clone());
    }
}

#[async_trait]
impl<P: Provider, T: WorkerTransport> Actor for WorkerNode<P, T> {
    type Message = WorkerNodeMessage;

    fn name(&self) -> &str {
        "worker_node"
    }

    async fn on_start(
        &mut self,
        ctx: &mut ActorContext<WorkerNodeMessage>,
    ) -> Result<(), ActorError> {
        info!(node_id = %self.node_id, actor_id = %ctx.actor_id, "WorkerNode starting");

        self.started_at = Instant::now();
        let epoch = self.timer_epoch;
        self.health_timer = Some(HealthCheckTimer::start(
            self.config.health_check_interval,
            ctx.myself.clone(),
            move || WorkerNodeMessage::HealthCheck { epoch },
        ));
        self.start_provisioning(ctx);
        self.publish();

        Ok(())
    }

    async fn handle(
        &mut self,
        msg: WorkerNodeMessage,
        ctx: &mut ActorContext<WorkerNodeMessage>,
    ) -> Result<bool, ActorError> {
        match msg {
            WorkerNodeMessage::Command(command) => self.handle_command(command),
            WorkerNodeMessage::Ready => self.handle_ready(ctx),
            WorkerNodeMessage::Shutdown => self.handle_shutdown(ctx),
            WorkerNodeMessage::HealthCheck { epoch } => self.handle_health_check(epoch, ctx),
            WorkerNodeMessage::Provisioned(result) => self.handle_provisioned(result, ctx),
            WorkerNodeMessage::HealthChecked { epoch, result } => {
                self.handle_health_checked(epoch, result, ctx)
            }
            WorkerNodeMessage::Delivered { id, result } => self.handle_delivered(id, result),
            WorkerNodeMessage::Destroyed(result) => self.handle_destroyed(result),
            WorkerNodeMessage::ProvisioningOverdue => self.handle_provisioning_overdue(),
        }

        self.publish();
        Ok(self.state != SupervisorState::Terminated)
    }

    fn on_unhandled(&mut self, msg: WorkerNodeMessage) {
        match msg {
            WorkerNodeMessage::Command(command) => {
                self.reject(command, FailureReason::ShuttingDown);
            }
            WorkerNodeMessage::Provisioned(Ok(handle)) if self.handle.is_none() => {
                self.adopt(handle);
            }
            other => debug!(node_id = %self.node_id, message = ?other, "Dropping queued message"),
        }
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext<WorkerNodeMessage>) {
        if self.state == SupervisorState::Terminated && self.handle.is_none() {
            self.publish();
            return;
        }

        warn!(
            node_id = %self.node_id,
            state = ?self.state,
            "WorkerNode stopped without completing shutdown, cleaning up"
        );

        self.cancel_health_timer();
        self.state = SupervisorState::ShuttingDown;
        self.forwarder = None;
        self.fail_all(&FailureReason::ShuttingDown);

        if let Some(cancel) = self.provisioning.take() {
            let _ = cancel.send(true);
        }

        if let Some(handle) = self.handle.take() {
            let guarded = self.guarded().with_retry_budget(self.config.destroy_max_retries);
            let result = teardown(
                &guarded,
                self.provider.as_ref(),
                &handle,
                self.config.teardown_timeout,
            )
            .await;

            if let Err(e) = result {
                error!(node_id = %self.node_id, error = %e, "Teardown failed during stop");
                self.snapshot.last_error = Some(e.to_string());
            }
        }

        self.finish();
        self.publish();
    }
}

// =============================================================================
// Provider Call Helpers
// =============================================================================

/// Run a guarded call, waiting out an open circuit while `deadline` allows.
///
/// Returns the last result once the call succeeds, fails for good, the next
/// wait would pass `deadline`, or `cancel` fires.
async fn call_patiently<T, R, F, Fut>(
    guarded: &GuardedCall<R>,
    deadline: Instant,
    mut cancel: Option<watch::Receiver<bool>>,
    mut op: F,
) -> Result<T, CallError<ProviderError>>
where
    R: RetryPolicy<ProviderError>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    loop {
        let result = guarded.call(&mut op).await;

        let wait = match result.as_ref().err().and_then(CallError::retry_after) {
            Some(wait) if Instant::now() + wait < deadline => wait.max(MIN_PATIENCE_STEP),
            _ => return result,
        };

        debug!(
            dependency = %guarded.breaker().name(),
            retry_after_ms = wait.as_millis() as u64,
            "Circuit open, waiting before re-issuing call"
        );

        match cancel.as_mut() {
            Some(cancelled) => {
                if *cancelled.borrow() {
                    return result;
                }
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancelled.changed() => return result,
                }
            }
            None => tokio::time::sleep(wait).await,
        }
    }
}

/// Destroy `handle`, bounded by `timeout` overall.
async fn teardown<P: Provider + ?Sized>(
    guarded: &GuardedCall<RetryBudget<ProviderRetryPolicy>>,
    provider: &P,
    handle: &ResourceHandle,
    timeout: Duration,
) -> Result<(), TeardownError> {
    let deadline = Instant::now() + timeout;
    let destroy = call_patiently(guarded, deadline, None, move || {
        provider.destroy_resource(handle)
    });

    match tokio::time::timeout_at(deadline, destroy).await {
        Ok(result) => result.map_err(TeardownError::from),
        Err(_) => Err(TeardownError::TimedOut(timeout)),
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Client-side handle to a running worker node.
#[derive(Debug, Clone)]
pub struct WorkerNodeHandle {
    node_id: WorkerNodeId,
    actor: ActorHandle<WorkerNodeMessage>,
    status: watch::Receiver<NodeStatus>,
}

impl WorkerNodeHandle {
    pub fn node_id(&self) -> WorkerNodeId {
        self.node_id
    }

    /// Send a command; the receiver yields exactly one reply.
    pub async fn submit(
        &self,
        payload: Value,
    ) -> Result<(CommandId, oneshot::Receiver<CommandReply>), ActorError> {
        let (command, reply) = PendingCommand::new(payload);
        let id = command.id;
        self.send_command(command).await?;
        Ok((id, reply))
    }

    /// Send a command and wait for its reply.
    pub async fn request(&self, payload: Value) -> Result<CommandReply, ActorError> {
        let (_, reply) = self.submit(payload).await?;
        reply.await.map_err(|_| ActorError::ActorStopped)
    }

    pub async fn send_command(&self, command: PendingCommand) -> Result<(), ActorError> {
        self.actor.send(WorkerNodeMessage::Command(command)).await
    }

    /// Signal that the worker finished initializing.
    pub async fn notify_ready(&self) -> Result<(), ActorError> {
        self.actor.send(WorkerNodeMessage::Ready).await
    }

    /// Request a graceful shutdown.
    pub async fn shutdown(&self) -> Result<(), ActorError> {
        self.actor.send(WorkerNodeMessage::Shutdown).await
    }

    /// Latest published status.
    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    /// Wait until the published status satisfies `predicate`. Returns the
    /// final status if the node stops first.
    pub async fn wait_for(&self, predicate: impl FnMut(&NodeStatus) -> bool) -> NodeStatus {
        let mut status = self.status.clone();
        if let Ok(matched) = status.wait_for(predicate).await {
            return matched.clone();
        }
        let last = status.borrow().clone();
        last
    }

    pub async fn wait_terminated(&self) -> NodeStatus {
        self.wait_for(|s| s.state == SupervisorState::Terminated)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_command_fail_replies_once() {
        let (command, mut reply) = PendingCommand::new(serde_json::json!({"op": "run"}));
        let id = command.id;
        command.fail(FailureReason::ShuttingDown);

        let failed = reply.try_recv().unwrap().unwrap_err();
        assert_eq!(failed.id, id);
        assert_eq!(failed.reason, FailureReason::ShuttingDown);
    }

    #[test]
    fn test_initial_status() {
        let status = NodeStatus::new(WorkerNodeId::new());
        assert_eq!(status.state, SupervisorState::Provisioning);
        assert_eq!(status.buffered, 0);
        assert!(status.instance_id.is_none());
    }

    #[test]
    fn test_status_serialization() {
        let status = NodeStatus::new(WorkerNodeId::new());
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "provisioning");
        assert!(json["node_id"].as_str().unwrap().starts_with("wn_"));
    }
}
