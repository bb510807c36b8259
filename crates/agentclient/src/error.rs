//! Error types for agent command dispatch

use std::time::Duration;
use thiserror::Error;

use crate::types::{AgentId, Sequence};

/// Errors that can occur while dispatching commands to an agent
#[derive(Debug, Error)]
pub enum AgentError {
    /// The session refused the command (maintenance/connecting policy,
    /// session closed, or the transport failed at dispatch time)
    #[error("Agent {agent_id} unavailable: {reason}")]
    Unavailable { agent_id: AgentId, reason: String },

    /// No answer arrived within the allotted wait
    ///
    /// `is_final` is set once both wait passes are exhausted.
    #[error("Command seq {seq} on agent {agent_id} timed out after {waited:?} (final={is_final})")]
    Timeout {
        agent_id: AgentId,
        seq: Sequence,
        waited: Duration,
        is_final: bool,
    },

    #[error("Agent {agent_id} disconnected while seq {seq} was outstanding")]
    Disconnected { agent_id: AgentId, seq: Sequence },

    #[error("Command seq {seq} was interrupted by agent {agent_id}")]
    Interrupted { agent_id: AgentId, seq: Sequence },

    #[error("Command seq {seq} is dangling on agent {agent_id}")]
    Dangling { agent_id: AgentId, seq: Sequence },

    #[error("Configuration error: {0}")]
    Config(#[from] agentconfig::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    pub(crate) fn unavailable(agent_id: AgentId, reason: impl Into<String>) -> Self {
        AgentError::Unavailable {
            agent_id,
            reason: reason.into(),
        }
    }

    /// True for both the retry-eligible and the final timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, AgentError::Timeout { .. })
    }
}

/// Delivery failures raised by a [`crate::transport::Transport`]
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Link to agent {0} is closed")]
    Closed(AgentId),

    #[error("Send queue for agent {0} is full")]
    Full(AgentId),

    #[error("Peer {peer} cannot reach agent {agent_id}: {reason}")]
    PeerUnreachable {
        peer: String,
        agent_id: AgentId,
        reason: String,
    },

    #[error("{0}")]
    Other(String),
}

/// Failures raised by a [`crate::store::CommandStateStore`]
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("No record for seq {0}")]
    NotFound(Sequence),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Result type alias for agent dispatch operations
pub type Result<T> = std::result::Result<T, AgentError>;
