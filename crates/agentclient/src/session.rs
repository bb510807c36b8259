//! Per-agent command session
//!
//! This module owns the dispatch protocol for one remote agent.
//!
//! ## Design
//!
//! - Sequence numbers come from a per-session [`SequenceAllocator`].
//! - A single `tokio::sync::Mutex` guards the ordering state: the sequence of
//!   the ordered request currently in flight and the [`PendingQueue`] of
//!   ordered requests waiting behind it. `send`, `send_next`, `cancel` and
//!   `disconnect` all take it for their queue manipulations.
//! - Listeners live in a separate [`ListenerRegistry`], so answer delivery is
//!   never serialised behind queue operations.
//! - Listener callbacks always run with no session lock held.
//! - Timeout alarms run on the shared [`TimeoutScheduler`]; the alarm and a
//!   real answer race to remove the listener, and only the winner notifies.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::SessionConfig;
use crate::error::{AgentError, Result};
use crate::listener::{Listener, ListenerRegistry};
use crate::observer::AnswerBus;
use crate::pending::PendingQueue;
use crate::sequence::SequenceAllocator;
use crate::state::{AdmissionPolicy, SessionState};
use crate::store::CommandStateStore;
use crate::timer::TimeoutScheduler;
use crate::transport::Transport;
use crate::types::{
    AgentId, Answer, Command, DisconnectReason, Request, Sequence, SessionStatus,
};

/// Ordering state guarded by the session mutex
#[derive(Debug, Default)]
struct OrderState {
    /// Ordered request dispatched but not yet answered
    current: Option<Sequence>,
    pending: PendingQueue,
}

/// Command channel to one remote agent
pub struct AgentSession {
    id: AgentId,
    name: String,
    kind: String,
    sequence: SequenceAllocator,
    state: SessionState,
    order: Mutex<OrderState>,
    pub(crate) listeners: ListenerRegistry,
    scheduler: Arc<TimeoutScheduler>,
    transport: Arc<dyn Transport>,
    answer_bus: Arc<AnswerBus>,
    pub(crate) store: Option<Arc<dyn CommandStateStore>>,
    pub(crate) config: SessionConfig,
    self_weak: Weak<AgentSession>,
}

/// Builder for [`AgentSession`]
pub struct SessionBuilder {
    id: AgentId,
    name: Option<String>,
    kind: String,
    transport: Arc<dyn Transport>,
    scheduler: Option<Arc<TimeoutScheduler>>,
    answer_bus: Option<Arc<AnswerBus>>,
    store: Option<Arc<dyn CommandStateStore>>,
    config: SessionConfig,
    policy: Option<Arc<AdmissionPolicy>>,
    seed: Option<u16>,
}

impl SessionBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Endpoint kind (e.g. `kvm`), used to resolve reconcile settings
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<TimeoutScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn answer_bus(mut self, bus: Arc<AnswerBus>) -> Self {
        self.answer_bus = Some(bus);
        self
    }

    pub fn store(mut self, store: Arc<dyn CommandStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn policy(mut self, policy: Arc<AdmissionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Fix the sequence seed instead of drawing a random one
    pub fn sequence_seed(mut self, seed: u16) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Arc<AgentSession> {
        let policy = self.policy.unwrap_or_default();
        let sequence = match self.seed {
            Some(seed) => SequenceAllocator::with_seed(seed),
            None => SequenceAllocator::new(),
        };
        let name = self.name.unwrap_or_else(|| format!("agent-{}", self.id));

        debug!(
            "Creating session for agent {} ({}, kind={:?}, reconcile={})",
            self.id, name, self.kind, self.config.reconcile_enabled
        );

        Arc::new_cyclic(|weak| AgentSession {
            id: self.id,
            name,
            kind: self.kind,
            sequence,
            state: SessionState::new(self.id, policy),
            order: Mutex::new(OrderState::default()),
            listeners: ListenerRegistry::new(),
            scheduler: self.scheduler.unwrap_or_default(),
            transport: self.transport,
            answer_bus: self.answer_bus.unwrap_or_default(),
            store: self.store,
            config: self.config,
            self_weak: weak.clone(),
        })
    }
}

impl AgentSession {
    pub fn builder(id: AgentId, transport: Arc<dyn Transport>) -> SessionBuilder {
        SessionBuilder {
            id,
            name: None,
            kind: String::new(),
            transport,
            scheduler: None,
            answer_bus: None,
            store: None,
            config: SessionConfig::default(),
            policy: None,
            seed: None,
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn next_sequence(&self) -> Sequence {
        self.sequence.next_sequence()
    }

    /// Bind `commands` to a freshly allocated sequence number
    pub fn new_request(&self, commands: Vec<Command>, execute_in_sequence: bool) -> Request {
        Request::new(self.id, self.next_sequence(), commands, execute_in_sequence)
    }

    // ===========================================================================
    // Lifecycle
    // ===========================================================================

    pub fn status(&self) -> SessionStatus {
        self.state.status()
    }

    /// The agent finished its startup handshake
    pub fn ready(&self) {
        if self.state.ready() {
            info!("Agent {} ({}) is up", self.id, self.name);
        }
    }

    pub fn set_maintenance(&self, on: bool) {
        info!("Agent {}: maintenance {}", self.id, if on { "on" } else { "off" });
        self.state.set_maintenance(on);
    }

    pub fn in_maintenance(&self) -> bool {
        self.state.in_maintenance()
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected() && !self.transport.is_closed()
    }

    /// Closed sessions refuse every send
    pub fn is_closed(&self) -> bool {
        self.state.status() == SessionStatus::Disconnected || self.transport.is_closed()
    }

    pub fn check_availability(&self, commands: &[Command]) -> Result<()> {
        self.state.check_availability(commands)
    }

    pub async fn current_sequence(&self) -> Option<Sequence> {
        self.order.lock().await.current
    }

    pub async fn pending_len(&self) -> usize {
        self.order.lock().await.pending.len()
    }

    pub async fn is_pending(&self, seq: Sequence) -> bool {
        self.order.lock().await.pending.contains(seq)
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.len().await
    }

    pub async fn get_listener(&self, seq: Sequence) -> Option<Arc<dyn Listener>> {
        self.listeners.get(seq).await
    }

    // ===========================================================================
    // Dispatch
    // ===========================================================================

    /// Dispatch `request`, or defer it behind the ordered request in flight
    ///
    /// Only admission and dispatch failures are reported here; everything
    /// else reaches the caller through `listener`.
    pub async fn send(&self, request: Request, listener: Option<Arc<dyn Listener>>) -> Result<()> {
        let alarm = listener
            .as_ref()
            .and_then(|l| l.timeout().resolve(self.config.listener_timeout));
        self.send_inner(request, listener, alarm).await
    }

    pub(crate) async fn send_inner(
        &self,
        request: Request,
        listener: Option<Arc<dyn Listener>>,
        alarm: Option<Duration>,
    ) -> Result<()> {
        self.state.check_availability(request.commands())?;

        let seq = request.seq();
        if let Some(listener) = listener {
            self.register_listener(seq, listener, alarm).await;
        }

        let mut order = self.order.lock().await;

        if self.is_closed() {
            drop(order);
            debug!("Agent {}: session closed, rejecting seq {}", self.id, seq);
            self.cancel(seq).await;
            return Err(AgentError::unavailable(self.id, "session is closed"));
        }

        if request.execute_in_sequence()
            && (order.current.is_some() || !order.pending.is_empty())
        {
            debug!("Agent {}: deferring {}", self.id, request);
            if let Err(dup) = order.pending.insert(request) {
                drop(order);
                self.cancel(dup.seq()).await;
                return Err(AgentError::Internal(format!(
                    "seq {} already queued on agent {}",
                    dup.seq(),
                    self.id
                )));
            }
            // Queue left behind by a failed dispatch with nothing in flight
            let failed = if order.current.is_none() {
                self.dispatch_next_locked(&mut order).await
            } else {
                None
            };
            drop(order);
            if let Some(failed) = failed {
                self.cancel(failed).await;
            }
            return Ok(());
        }

        trace!("Agent {}: sending {}", self.id, request);
        match self.transport.send(&request).await {
            Ok(()) => {
                if request.execute_in_sequence() {
                    order.current = Some(seq);
                }
                Ok(())
            }
            Err(e) => {
                drop(order);
                warn!("Agent {}: failed to send seq {}: {}", self.id, seq, e);
                self.cancel(seq).await;
                Err(AgentError::unavailable(self.id, e.to_string()))
            }
        }
    }

    /// Pop the lowest pending request and dispatch it
    ///
    /// Returns the sequence that failed to dispatch, for the caller to cancel
    /// once the lock is released. A failure does not try the next entry.
    async fn dispatch_next_locked(&self, order: &mut OrderState) -> Option<Sequence> {
        let request = order.pending.pop_front()?;
        let seq = request.seq();

        trace!("Agent {}: sending queued {}", self.id, request);
        match self.transport.send(&request).await {
            Ok(()) => {
                order.current = Some(seq);
                None
            }
            Err(e) => {
                warn!("Agent {}: failed to send queued seq {}: {}", self.id, seq, e);
                Some(seq)
            }
        }
    }

    /// The ordered request `seq` completed; dispatch the next queued one
    ///
    /// Does nothing if a different ordered request is in flight.
    pub async fn send_next(&self, seq: Sequence) {
        let failed = {
            let mut order = self.order.lock().await;
            match order.current {
                Some(current) if current == seq => order.current = None,
                Some(current) => {
                    trace!(
                        "Agent {}: seq {} finished but seq {} is current",
                        self.id,
                        seq,
                        current
                    );
                    return;
                }
                None => {}
            }
            if order.pending.is_empty() {
                return;
            }
            self.dispatch_next_locked(&mut order).await
        };

        if let Some(failed) = failed {
            self.cancel(failed).await;
        }
    }

    /// Drop `seq` from the queue and notify its listener, if any
    ///
    /// Safe to call repeatedly or for unknown sequences.
    pub async fn cancel(&self, seq: Sequence) {
        let dequeued = self.order.lock().await.pending.remove(seq).is_some();
        let listener = self.listeners.unregister(seq).await;

        if dequeued || listener.is_some() {
            debug!(
                "Agent {}: cancelled seq {} (queued={}, listener={})",
                self.id,
                seq,
                dequeued,
                listener.is_some()
            );
        }

        if let Some(listener) = listener {
            let reason = DisconnectReason::Cancelled;
            self.guarded(seq, "disconnect", listener.process_disconnect(self.id, seq, reason))
                .await;
        }
    }

    // ===========================================================================
    // Answer delivery
    // ===========================================================================

    /// Deliver an answer received from the transport
    pub async fn process_answer(&self, answer: Answer) {
        let seq = answer.seq;

        let listener = match self.listeners.get(seq).await {
            Some(listener) if listener.is_recurring() => Some(listener),
            // Whoever removes the entry first owns the notification
            Some(_) => self.listeners.unregister(seq).await,
            None => None,
        };

        match listener {
            Some(listener) => {
                trace!("Agent {}: delivering answer for seq {}", self.id, seq);
                self.guarded(seq, "answer", listener.process_answers(self.id, seq, &answer))
                    .await;
            }
            None => {
                debug!(
                    "Agent {}: no listener for seq {} (success={})",
                    self.id,
                    seq,
                    answer.is_success()
                );
            }
        }

        self.answer_bus.notify(self.id, &answer).await;

        if answer.execute_in_sequence {
            self.send_next(seq).await;
        }
    }

    /// Feed answers from `rx` into [`AgentSession::process_answer`]
    ///
    /// When the channel closes the session is disconnected.
    pub fn spawn_answer_pump(self: Arc<Self>, mut rx: mpsc::Receiver<Answer>) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!("Answer pump started for agent {}", self.id);
            while let Some(answer) = rx.recv().await {
                if answer.agent_id != self.id {
                    warn!(
                        "Agent {}: dropping answer seq {} addressed to agent {}",
                        self.id, answer.seq, answer.agent_id
                    );
                    continue;
                }
                self.process_answer(answer).await;
            }
            info!("Answer channel for agent {} closed", self.id);
            self.disconnect(DisconnectReason::Disconnected).await;
        })
    }

    // ===========================================================================
    // Listeners and timeouts
    // ===========================================================================

    async fn register_listener(
        &self,
        seq: Sequence,
        listener: Arc<dyn Listener>,
        alarm: Option<Duration>,
    ) {
        self.listeners.register(seq, listener).await;

        if let Some(delay) = alarm {
            let session = self.self_weak.clone();
            let handle = self.scheduler.schedule(delay, async move {
                if let Some(session) = session.upgrade() {
                    session.on_alarm(seq).await;
                }
            });
            self.listeners.arm(seq, handle).await;
        }
    }

    async fn on_alarm(&self, seq: Sequence) {
        let Some(listener) = self.listeners.take_expired(seq).await else {
            return;
        };

        warn!("Agent {}: seq {} timed out waiting for an answer", self.id, seq);
        self.cancel(seq).await;
        self.send_next(seq).await;
        self.guarded(seq, "timeout", listener.process_timeout(self.id, seq))
            .await;
    }

    async fn guarded<F>(&self, seq: Sequence, callback: &str, fut: F)
    where
        F: Future<Output = ()>,
    {
        if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
            error!(
                "Agent {}: {} callback for seq {} panicked",
                self.id, callback, seq
            );
        }
    }

    // ===========================================================================
    // Teardown
    // ===========================================================================

    /// Tear the session down, notifying every outstanding listener
    ///
    /// Returns the number of listeners notified. Repeated calls are no-ops.
    pub async fn disconnect(&self, reason: DisconnectReason) -> usize {
        let previous = self.state.mark_disconnected();

        let (dropped, listeners) = {
            let mut order = self.order.lock().await;
            order.current = None;
            let dropped = order.pending.clear();
            let listeners = self.listeners.drain().await;
            (dropped, listeners)
        };

        if previous != SessionStatus::Disconnected {
            info!(
                "Agent {} disconnected ({}): {} listeners, {} queued requests dropped",
                self.id,
                reason,
                listeners.len(),
                dropped.len()
            );
        }

        let notified = listeners.len();
        for (seq, listener) in listeners {
            self.guarded(seq, "disconnect", listener.process_disconnect(self.id, seq, reason))
                .await;
        }

        self.transport.disconnect(reason).await;
        notified
    }
}

impl fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSession")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("status", &self.state.status())
            .field("maintenance", &self.state.in_maintenance())
            .field("transport", &self.transport)
            .finish()
    }
}
