//! Registry of agent sessions sharing one set of collaborators

use std::collections::HashMap;
use std::sync::Arc;

use agentconfig::AgentConfig;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::{DispatchOptions, SessionConfig};
use crate::error::Result;
use crate::observer::AnswerBus;
use crate::session::AgentSession;
use crate::state::AdmissionPolicy;
use crate::store::CommandStateStore;
use crate::timer::TimeoutScheduler;
use crate::transport::Transport;
use crate::types::{AgentId, DisconnectReason};

/// Owns every live [`AgentSession`]
///
/// Sessions are independent; the manager's map lock is never held while a
/// session does any work.
pub struct AgentManager {
    sessions: RwLock<HashMap<AgentId, Arc<AgentSession>>>,
    config: Option<AgentConfig>,
    defaults: DispatchOptions,
    scheduler: Arc<TimeoutScheduler>,
    answer_bus: Arc<AnswerBus>,
    store: Option<Arc<dyn CommandStateStore>>,
    policy: Arc<AdmissionPolicy>,
}

impl AgentManager {
    /// Manager using `options` for every endpoint kind
    pub fn new(options: DispatchOptions) -> Self {
        let scheduler = Arc::new(TimeoutScheduler::new(options.timer_pool_size.0 as usize));
        Self {
            sessions: RwLock::new(HashMap::new()),
            config: None,
            defaults: options,
            scheduler,
            answer_bus: Arc::new(AnswerBus::new()),
            store: None,
            policy: Arc::new(AdmissionPolicy::default()),
        }
    }

    /// Manager resolving options per endpoint kind from `config`
    pub fn from_config(config: AgentConfig) -> Result<Self> {
        let defaults = DispatchOptions::try_from_agent_config(&config, &["agent", "global"])?;
        let mut manager = Self::new(defaults);
        manager.config = Some(config);
        Ok(manager)
    }

    pub fn with_store(mut self, store: Arc<dyn CommandStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_policy(mut self, policy: AdmissionPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn answer_bus(&self) -> &Arc<AnswerBus> {
        &self.answer_bus
    }

    pub fn scheduler(&self) -> &Arc<TimeoutScheduler> {
        &self.scheduler
    }

    /// Settings a session of `kind` would be created with
    pub fn session_config(&self, kind: &str) -> Result<SessionConfig> {
        let options = match &self.config {
            Some(config) => DispatchOptions::load(config, kind)?,
            None => self.defaults.clone(),
        };
        Ok(SessionConfig::for_kind(&options, kind))
    }

    /// Return the session for `id`, creating it on first contact
    ///
    /// `transport` is only used when a new session is created.
    pub async fn get_or_create(
        &self,
        id: AgentId,
        name: &str,
        kind: &str,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<AgentSession>> {
        if let Some(session) = self.sessions.read().await.get(&id) {
            return Ok(Arc::clone(session));
        }

        let config = self.session_config(kind)?;
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(&id) {
            return Ok(Arc::clone(session));
        }

        let mut builder = AgentSession::builder(id, transport)
            .name(name)
            .kind(kind)
            .config(config)
            .scheduler(Arc::clone(&self.scheduler))
            .answer_bus(Arc::clone(&self.answer_bus))
            .policy(Arc::clone(&self.policy));
        if let Some(store) = &self.store {
            builder = builder.store(Arc::clone(store));
        }

        let session = builder.build();
        sessions.insert(id, Arc::clone(&session));
        info!("Registered agent {} ({}, kind={})", id, name, kind);
        Ok(session)
    }

    pub async fn get(&self, id: AgentId) -> Option<Arc<AgentSession>> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Forget the agent and tear down its session
    pub async fn remove(&self, id: AgentId) -> Option<Arc<AgentSession>> {
        let session = self.sessions.write().await.remove(&id)?;
        let notified = session.disconnect(DisconnectReason::Removed).await;
        debug!("Removed agent {} ({} listeners notified)", id, notified);
        Some(session)
    }

    /// Disconnect every session, e.g. at shutdown
    pub async fn disconnect_all(&self, reason: DisconnectReason) {
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            session.disconnect(reason).await;
        }
    }

    pub async fn agent_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<_> = self.sessions.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
