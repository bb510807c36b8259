//! Synchronous send with out-of-band recovery
//!
//! `send_sync` installs a one-shot listener and waits for its answer. For a
//! request carrying exactly one reconcilable command on a connected agent of
//! a kind with reconciliation enabled, the wait is split into poll-interval
//! slices; after each slice the durable command-state store is consulted in
//! case the live answer was lost (e.g. the agent restarted mid-command).
//!
//! Each request gets at most two wait passes. A pass that ends without an
//! answer gets one more pass only while another request is the session's
//! current ordered request, since this one may be queued behind it. With
//! nothing else in flight the request fails after a single pass.
//!
//! An answer recovered from the store never reaches `process_answer`, so a
//! successful `send_sync` releases the ordered queue itself when its request
//! is still current.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{AgentError, Result};
use crate::listener::Listener;
use crate::session::AgentSession;
use crate::store::CommandState;
use crate::types::{AgentId, Answer, Command, DisconnectReason, Request, Sequence};

/// Passes through the basic/extended wait before the final timeout
const WAIT_PASSES: u32 = 2;

/// Floor for the store poll slice
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One-shot listener backing `send_sync`
#[derive(Default)]
struct SyncListener {
    answer: Mutex<Option<Answer>>,
    disconnected: AtomicBool,
    notify: Notify,
}

impl SyncListener {
    fn take_answer(&self) -> Option<Answer> {
        self.answer.lock().ok().and_then(|mut a| a.take())
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Listener for SyncListener {
    async fn process_answers(&self, _agent_id: AgentId, _seq: Sequence, answer: &Answer) {
        if let Ok(mut slot) = self.answer.lock() {
            *slot = Some(answer.clone());
        }
        self.notify.notify_one();
    }

    async fn process_disconnect(&self, _agent_id: AgentId, _seq: Sequence, _reason: DisconnectReason) {
        self.disconnected.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    async fn process_timeout(&self, _agent_id: AgentId, _seq: Sequence) {
        self.notify.notify_one();
    }
}

impl AgentSession {
    /// Send `request` and wait for its answer
    ///
    /// `timeout` is the budget for each wait pass; `None` uses the
    /// configured `sync_wait_timeout`.
    pub async fn send_sync(&self, request: Request, timeout: Option<Duration>) -> Result<Answer> {
        let budget = timeout.unwrap_or(self.config.sync_wait_timeout);
        let seq = request.seq();
        let listener = Arc::new(SyncListener::default());

        let reconcile_cmd = request.reconcilable_command().cloned();
        let bookkeeping = reconcile_cmd.is_some() && self.config.reconcile_enabled;
        if bookkeeping {
            self.record_state(&request, CommandState::Pending).await;
        }

        let result = match self
            .send_inner(request.clone(), Some(listener.clone()), None)
            .await
        {
            Ok(()) => {
                self.wait_for_answer(&request, &listener, budget, reconcile_cmd.as_ref())
                    .await
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(_) => {
                if request.execute_in_sequence() && self.current_sequence().await == Some(seq) {
                    debug!(
                        "Agent {}: seq {} answered out of band, advancing queue",
                        self.id(),
                        seq
                    );
                    self.send_next(seq).await;
                }
            }
            Err(e) => {
                debug!("Agent {}: send_sync seq {} failed: {}", self.id(), seq, e);
                self.cancel(seq).await;
                if request.execute_in_sequence() && self.current_sequence().await == Some(seq) {
                    self.send_next(seq).await;
                }
                if bookkeeping && e.is_timeout() {
                    self.record_state(&request, CommandState::TimedOut).await;
                }
            }
        }

        self.listeners.unregister(seq).await;
        result
    }

    async fn wait_for_answer(
        &self,
        request: &Request,
        listener: &SyncListener,
        budget: Duration,
        reconcile_cmd: Option<&Command>,
    ) -> Result<Answer> {
        let seq = request.seq();

        for pass in 1..=WAIT_PASSES {
            let extended = reconcile_cmd.is_some()
                && self.config.reconcile_enabled
                && self.store.is_some()
                && self.is_connected();

            let answer = match reconcile_cmd {
                Some(cmd) if extended => self.reconcile_wait(seq, listener, cmd, budget).await?,
                _ => self.basic_wait(seq, listener, budget).await?,
            };
            if let Some(answer) = answer {
                return Ok(answer);
            }

            match self.current_sequence().await {
                Some(current) if current != seq => {
                    debug!(
                        "Agent {}: seq {} behind current seq {} after pass {}, waiting again",
                        self.id(),
                        seq,
                        current,
                        pass
                    );
                    continue;
                }
                _ => {}
            }

            return Err(AgentError::Timeout {
                agent_id: self.id(),
                seq,
                waited: budget * pass,
                is_final: false,
            });
        }

        Err(AgentError::Timeout {
            agent_id: self.id(),
            seq,
            waited: budget * WAIT_PASSES,
            is_final: true,
        })
    }

    async fn basic_wait(
        &self,
        seq: Sequence,
        listener: &SyncListener,
        budget: Duration,
    ) -> Result<Option<Answer>> {
        let deadline = Instant::now() + budget;
        loop {
            if let Some(answer) = listener.take_answer() {
                return Ok(Some(answer));
            }
            if listener.is_disconnected() {
                return Err(AgentError::Disconnected {
                    agent_id: self.id(),
                    seq,
                });
            }
            tokio::select! {
                _ = listener.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(listener.take_answer()),
            }
        }
    }

    /// Wait in poll-interval slices, consulting the store after each one
    ///
    /// A disconnect does not end this wait; the store may still learn the
    /// outcome.
    async fn reconcile_wait(
        &self,
        seq: Sequence,
        listener: &SyncListener,
        cmd: &Command,
        budget: Duration,
    ) -> Result<Option<Answer>> {
        let deadline = Instant::now() + budget;
        let poll = self.config.reconcile_poll_interval.max(MIN_POLL_INTERVAL);

        loop {
            if let Some(answer) = listener.take_answer() {
                return Ok(Some(answer));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let slice = poll.min(deadline - now);
            tokio::select! {
                _ = listener.notify.notified() => {}
                _ = tokio::time::sleep(slice) => {}
            }

            if let Some(answer) = listener.take_answer() {
                return Ok(Some(answer));
            }

            let Some(store) = &self.store else {
                continue;
            };
            match store.get_state_and_answer(seq, cmd).await {
                Ok((CommandState::Interrupted, _)) => {
                    return Err(AgentError::Interrupted {
                        agent_id: self.id(),
                        seq,
                    })
                }
                Ok((CommandState::Dangling, _)) => {
                    return Err(AgentError::Dangling {
                        agent_id: self.id(),
                        seq,
                    })
                }
                Ok((CommandState::Answered, Some(answer))) if !answer.is_placeholder() => {
                    debug!(
                        "Agent {}: recovered answer for seq {} from the command store",
                        self.id(),
                        seq
                    );
                    return Ok(Some(answer));
                }
                Ok((state, _)) => {
                    trace!("Agent {}: seq {} is {:?}, still waiting", self.id(), seq, state);
                }
                Err(e) => {
                    warn!("Agent {}: command store lookup for seq {} failed: {}", self.id(), seq, e);
                }
            }
        }
    }

    async fn record_state(&self, request: &Request, state: CommandState) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store
            .update_state(request.seq(), request.commands(), state)
            .await
        {
            warn!(
                "Agent {}: failed to record {:?} for seq {}: {}",
                self.id(),
                state,
                request.seq(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::error::{StoreError, TransportError};
    use crate::store::{CommandStateStore, MemoryCommandStateStore};
    use std::sync::atomic::AtomicUsize;
    use crate::transport::Transport;
    use crate::types::CommandResult;

    #[derive(Debug, Default)]
    struct Sink;

    #[async_trait]
    impl Transport for Sink {
        async fn send(&self, _request: &Request) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        fn is_closed(&self) -> bool {
            false
        }
    }

    fn reconciling(store: Arc<MemoryCommandStateStore>) -> Arc<AgentSession> {
        let session = AgentSession::builder(2, Arc::new(Sink))
            .kind("kvm")
            .config(SessionConfig {
                reconcile_enabled: true,
                reconcile_poll_interval: Duration::from_millis(100),
                sync_wait_timeout: Duration::from_secs(5),
                listener_timeout: None,
            })
            .store(store)
            .build();
        session.ready();
        session
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_before_timeout() {
        let session = AgentSession::builder(2, Arc::new(Sink)).build();
        session.ready();
        let req = session.new_request(vec![Command::new("PingCommand")], false);

        let responder = Arc::clone(&session);
        let answer = Answer::new(&req, vec![CommandResult::ok("PingCommand", "pong")]);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            responder.process_answer(answer).await;
        });

        let got = session
            .send_sync(req, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(got.is_success());
        assert_eq!(session.listener_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_ordered_request_times_out() {
        let session = AgentSession::builder(2, Arc::new(Sink)).build();
        session.ready();
        let req = session.new_request(vec![Command::new("CopyCommand")], true);
        let seq = req.seq();

        let err = session
            .send_sync(req, Some(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout { is_final: false, seq: s, .. } if s == seq));
        assert_eq!(session.current_sequence().await, None);
        assert_eq!(session.listener_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unordered_request_times_out_after_one_pass() {
        let session = AgentSession::builder(2, Arc::new(Sink)).build();
        session.ready();
        let req = session.new_request(vec![Command::new("PingCommand")], false);

        let started = Instant::now();
        let err = session
            .send_sync(req, Some(Duration::from_millis(200)))
            .await
            .unwrap_err();
        match err {
            AgentError::Timeout {
                waited, is_final, ..
            } => {
                assert!(!is_final);
                assert_eq!(waited, Duration::from_millis(200));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_behind_current_gets_second_pass() {
        let session = AgentSession::builder(2, Arc::new(Sink)).build();
        session.ready();
        let blocker = session.new_request(vec![Command::new("CopyCommand")], true);
        session.send(blocker.clone(), None).await.unwrap();

        let req = session.new_request(vec![Command::new("PingCommand")], false);
        let err = session
            .send_sync(req, Some(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AgentError::Timeout {
                is_final: true,
                waited,
                ..
            } if waited == Duration::from_millis(400)
        ));
        assert_eq!(session.current_sequence().await, Some(blocker.seq()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_basic_wait() {
        let session = AgentSession::builder(2, Arc::new(Sink)).build();
        session.ready();
        let req = session.new_request(vec![Command::new("CopyCommand")], true);

        let dropper = Arc::clone(&session);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            dropper.disconnect(DisconnectReason::Down).await;
        });

        let err = session
            .send_sync(req, Some(Duration::from_secs(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Disconnected { agent_id: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_and_dangling_from_store() {
        let store = Arc::new(MemoryCommandStateStore::new());
        let session = reconciling(Arc::clone(&store));

        let req = session.new_request(vec![Command::new("MigrateCommand").reconcilable()], true);
        let seq = req.seq();
        let marker = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            marker.set_state(seq, CommandState::Interrupted).await;
        });
        let err = session.send_sync(req, None).await.unwrap_err();
        assert!(matches!(err, AgentError::Interrupted { .. }));

        let req = session.new_request(vec![Command::new("MigrateCommand").reconcilable()], true);
        let seq = req.seq();
        let marker = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            marker.set_state(seq, CommandState::Dangling).await;
        });
        let err = session.send_sync(req, None).await.unwrap_err();
        assert!(matches!(err, AgentError::Dangling { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_placeholder_answer_keeps_polling() {
        let store = Arc::new(MemoryCommandStateStore::new());
        let session = reconciling(Arc::clone(&store));

        let req = session.new_request(vec![Command::new("StopCommand").reconcilable()], true);
        let seq = req.seq();

        let placeholder = Answer::new(&req, vec![CommandResult::placeholder("StopCommand")]);
        let real = Answer::new(&req, vec![CommandResult::ok("StopCommand", "stopped")]);
        let writer = Arc::clone(&store);
        tokio::spawn(async move {
            writer.record_answer(placeholder).await;
            tokio::time::sleep(Duration::from_millis(450)).await;
            writer.record_answer(real).await;
        });

        let got = session.send_sync(req, None).await.unwrap();
        assert_eq!(got.seq, seq);
        assert!(!got.is_placeholder());
    }

    /// Counts lookups against a memory store
    struct CountingStore {
        inner: MemoryCommandStateStore,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl CommandStateStore for CountingStore {
        async fn get_state_and_answer(
            &self,
            seq: Sequence,
            command: &Command,
        ) -> std::result::Result<(CommandState, Option<Answer>), StoreError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.get_state_and_answer(seq, command).await
        }

        async fn update_state(
            &self,
            seq: Sequence,
            commands: &[Command],
            state: CommandState,
        ) -> std::result::Result<(), StoreError> {
            self.inner.update_state(seq, commands, state).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_poll_interval_is_clamped() {
        let store = Arc::new(CountingStore {
            inner: MemoryCommandStateStore::new(),
            lookups: AtomicUsize::new(0),
        });
        let session = AgentSession::builder(2, Arc::new(Sink))
            .kind("kvm")
            .config(SessionConfig {
                reconcile_enabled: true,
                reconcile_poll_interval: Duration::ZERO,
                sync_wait_timeout: Duration::from_secs(1),
                listener_timeout: None,
            })
            .store(store.clone())
            .build();
        session.ready();

        let req = session.new_request(vec![Command::new("StopCommand").reconcilable()], true);
        let err = session.send_sync(req, None).await.unwrap_err();

        assert!(err.is_timeout());
        let lookups = store.lookups.load(Ordering::SeqCst);
        assert!((1..=11).contains(&lookups), "lookups: {}", lookups);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_recorded_in_store() {
        let store = Arc::new(MemoryCommandStateStore::new());
        let session = reconciling(Arc::clone(&store));

        let req = session.new_request(vec![Command::new("StopCommand").reconcilable()], true);
        let seq = req.seq();
        let err = session
            .send_sync(req, Some(Duration::from_millis(300)))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(store.state(seq).await, Some(CommandState::TimedOut));
    }
}
