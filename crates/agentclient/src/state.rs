//! Session connectivity state and command admission

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::{AgentError, Result};
use crate::types::{kinds, AgentId, Command, SessionStatus};

/// Command kinds admitted while an agent is in maintenance
pub const MAINTENANCE_ALLOWED: &[&str] = &[
    kinds::MAINTAIN,
    kinds::MIGRATE,
    kinds::STOP,
    kinds::CHECK_VIRTUAL_MACHINE,
    kinds::PING_TEST,
    kinds::CHECK_HEALTH,
    kinds::READY,
    kinds::SHUTDOWN,
    kinds::SETUP,
    kinds::CLEANUP_NETWORK_RULES,
    kinds::CHECK_NETWORK,
    kinds::PVLAN_SETUP,
    kinds::CHECK_ON_HOST,
    kinds::MODIFY_TARGETS,
    kinds::MODIFY_SSH_KEYS,
    kinds::MODIFY_STORAGE_POOL,
];

/// Command kinds refused while an agent is still connecting
pub const CONNECTING_DENIED: &[&str] = &[kinds::START, kinds::CREATE];

/// Allow/deny tables consulted by [`SessionState::check_availability`]
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    maintenance_allowed: HashSet<String>,
    connecting_denied: HashSet<String>,
}

impl AdmissionPolicy {
    pub fn new<'a>(
        maintenance_allowed: impl IntoIterator<Item = &'a str>,
        connecting_denied: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            maintenance_allowed: maintenance_allowed.into_iter().map(String::from).collect(),
            connecting_denied: connecting_denied.into_iter().map(String::from).collect(),
        }
    }

    pub fn allowed_in_maintenance(&self, cmd: &Command) -> bool {
        cmd.bypass_maintenance || self.maintenance_allowed.contains(&cmd.kind)
    }

    pub fn denied_while_connecting(&self, cmd: &Command) -> bool {
        self.connecting_denied.contains(&cmd.kind)
    }
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self::new(
            MAINTENANCE_ALLOWED.iter().copied(),
            CONNECTING_DENIED.iter().copied(),
        )
    }
}

/// Connectivity (Connecting → Up, any → Disconnected) plus an orthogonal
/// maintenance flag
#[derive(Debug)]
pub struct SessionState {
    agent_id: AgentId,
    status: AtomicU8,
    maintenance: AtomicBool,
    policy: Arc<AdmissionPolicy>,
}

impl SessionState {
    pub fn new(agent_id: AgentId, policy: Arc<AdmissionPolicy>) -> Self {
        Self {
            agent_id,
            status: AtomicU8::new(SessionStatus::Connecting as u8),
            maintenance: AtomicBool::new(false),
            policy,
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Connecting → Up. Has no effect once disconnected.
    ///
    /// Returns whether the transition happened.
    pub fn ready(&self) -> bool {
        self.status
            .compare_exchange(
                SessionStatus::Connecting as u8,
                SessionStatus::Up as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to the terminal Disconnected state, returning the previous status
    pub fn mark_disconnected(&self) -> SessionStatus {
        SessionStatus::from_u8(
            self.status
                .swap(SessionStatus::Disconnected as u8, Ordering::AcqRel),
        )
    }

    pub fn in_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::Acquire)
    }

    pub fn set_maintenance(&self, on: bool) {
        self.maintenance.store(on, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.status() == SessionStatus::Up
    }

    /// Decide whether `commands` may be sent in the current state
    ///
    /// Pure predicate over the current state; no side effects.
    pub fn check_availability(&self, commands: &[Command]) -> Result<()> {
        if self.in_maintenance() {
            if let Some(cmd) = commands
                .iter()
                .find(|cmd| !self.policy.allowed_in_maintenance(cmd))
            {
                return Err(AgentError::unavailable(
                    self.agent_id,
                    format!(
                        "{} is not allowed while the agent is in maintenance",
                        cmd.kind
                    ),
                ));
            }
        }

        if self.status() == SessionStatus::Connecting {
            if let Some(cmd) = commands
                .iter()
                .find(|cmd| self.policy.denied_while_connecting(cmd))
            {
                return Err(AgentError::unavailable(
                    self.agent_id,
                    format!("{} is not allowed while the agent is connecting", cmd.kind),
                ));
            }
        }

        Ok(())
    }
}
