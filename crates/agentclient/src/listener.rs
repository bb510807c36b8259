//! Completion listeners and the per-session registry that holds them

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;

use crate::types::{AgentId, Answer, DisconnectReason, Sequence};

/// Caller-supplied callbacks bound to one outstanding sequence number
///
/// Exactly one of the terminal notifications (answer for a non-recurring
/// listener, timeout, or disconnect) is delivered per registration.
#[async_trait]
pub trait Listener: Send + Sync {
    /// An answer arrived for `seq`
    async fn process_answers(&self, agent_id: AgentId, seq: Sequence, answer: &Answer);

    /// The session was torn down, or `seq` was cancelled
    async fn process_disconnect(&self, agent_id: AgentId, seq: Sequence, reason: DisconnectReason);

    /// No answer arrived within [`Listener::timeout`]
    async fn process_timeout(&self, agent_id: AgentId, seq: Sequence);

    /// Stay registered after the first answer
    fn is_recurring(&self) -> bool {
        false
    }

    fn timeout(&self) -> ListenerTimeout {
        ListenerTimeout::Configured
    }
}

/// How long a listener waits for its answer before `process_timeout`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListenerTimeout {
    /// Use the session's configured listener timeout, if any
    #[default]
    Configured,
    /// Never time out, whatever the session configuration says
    Disabled,
    After(Duration),
}

impl ListenerTimeout {
    /// Resolve against the session default
    pub fn resolve(self, configured: Option<Duration>) -> Option<Duration> {
        match self {
            ListenerTimeout::Configured => configured,
            ListenerTimeout::Disabled => None,
            ListenerTimeout::After(d) => Some(d),
        }
    }
}

struct ListenerEntry {
    listener: Arc<dyn Listener>,
    alarm: Option<AbortHandle>,
}

/// Maps sequence numbers to their listener and pending alarm
///
/// Whoever removes an entry first owns the terminal notification; every
/// later removal for the same sequence finds nothing.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<Sequence, ListenerEntry>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `listener` for `seq`, replacing (and disarming) any previous one
    pub async fn register(&self, seq: Sequence, listener: Arc<dyn Listener>) {
        let old = self.listeners.write().await.insert(
            seq,
            ListenerEntry {
                listener,
                alarm: None,
            },
        );
        if let Some(ListenerEntry {
            alarm: Some(alarm), ..
        }) = old
        {
            alarm.abort();
        }
    }

    /// Attach a timeout alarm to an existing registration
    ///
    /// If the listener is already gone the handle is dropped without
    /// aborting: the alarm may be the one that removed it and must be left to
    /// deliver its notification.
    pub async fn arm(&self, seq: Sequence, alarm: AbortHandle) {
        let mut listeners = self.listeners.write().await;
        if let Some(entry) = listeners.get_mut(&seq) {
            if let Some(old) = entry.alarm.replace(alarm) {
                old.abort();
            }
        }
    }

    pub async fn get(&self, seq: Sequence) -> Option<Arc<dyn Listener>> {
        self.listeners
            .read()
            .await
            .get(&seq)
            .map(|entry| Arc::clone(&entry.listener))
    }

    pub async fn contains(&self, seq: Sequence) -> bool {
        self.listeners.read().await.contains_key(&seq)
    }

    /// Remove the listener for `seq` and disarm its alarm
    pub async fn unregister(&self, seq: Sequence) -> Option<Arc<dyn Listener>> {
        let entry = self.listeners.write().await.remove(&seq)?;
        if let Some(alarm) = entry.alarm {
            alarm.abort();
        }
        Some(entry.listener)
    }

    /// Removal performed by the alarm itself; leaves its own task running
    pub(crate) async fn take_expired(&self, seq: Sequence) -> Option<Arc<dyn Listener>> {
        self.listeners
            .write()
            .await
            .remove(&seq)
            .map(|entry| entry.listener)
    }

    /// Remove every listener, disarming all alarms
    ///
    /// Returned in ascending sequence order.
    pub async fn drain(&self) -> Vec<(Sequence, Arc<dyn Listener>)> {
        let mut drained: Vec<_> = self
            .listeners
            .write()
            .await
            .drain()
            .map(|(seq, entry)| {
                if let Some(alarm) = entry.alarm {
                    alarm.abort();
                }
                (seq, entry.listener)
            })
            .collect();
        drained.sort_by_key(|(seq, _)| *seq);
        drained
    }

    pub async fn len(&self) -> usize {
        self.listeners.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.listeners.read().await.is_empty()
    }
}
