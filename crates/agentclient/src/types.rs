//! Request, answer and status types exchanged with an agent session

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a remote agent (one per managed host)
pub type AgentId = u64;

/// Per-session sequence number correlating a request with its answer
pub type Sequence = u64;

/// Well-known command kinds referenced by the admission tables
pub mod kinds {
    pub const MAINTAIN: &str = "MaintainCommand";
    pub const MIGRATE: &str = "MigrateCommand";
    pub const STOP: &str = "StopCommand";
    pub const CHECK_VIRTUAL_MACHINE: &str = "CheckVirtualMachineCommand";
    pub const PING_TEST: &str = "PingTestCommand";
    pub const CHECK_HEALTH: &str = "CheckHealthCommand";
    pub const READY: &str = "ReadyCommand";
    pub const SHUTDOWN: &str = "ShutdownCommand";
    pub const SETUP: &str = "SetupCommand";
    pub const CLEANUP_NETWORK_RULES: &str = "CleanupNetworkRulesCmd";
    pub const CHECK_NETWORK: &str = "CheckNetworkCommand";
    pub const PVLAN_SETUP: &str = "PvlanSetupCommand";
    pub const CHECK_ON_HOST: &str = "CheckOnHostCommand";
    pub const MODIFY_TARGETS: &str = "ModifyTargetsCommand";
    pub const MODIFY_SSH_KEYS: &str = "ModifySshKeysCommand";
    pub const MODIFY_STORAGE_POOL: &str = "ModifyStoragePoolCommand";

    pub const START: &str = "StartCommand";
    pub const CREATE: &str = "CreateCommand";
}

/// A single command carried inside a [`Request`]
///
/// The payload is opaque to the session; its encoding belongs to the
/// transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub kind: String,
    pub payload: Bytes,
    /// Admit this command even while the session is in maintenance
    pub bypass_maintenance: bool,
    /// Completion can be recovered from the durable command-state store
    pub reconcilable: bool,
}

impl Command {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Bytes::new(),
            bypass_maintenance: false,
            reconcilable: false,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn bypass_maintenance(mut self) -> Self {
        self.bypass_maintenance = true;
        self
    }

    pub fn reconcilable(mut self) -> Self {
        self.reconcilable = true;
        self
    }
}

/// One or more commands bound to a single sequence number
///
/// Immutable once built: the sequence is assigned by
/// [`crate::AgentSession::new_request`] or supplied by the caller from
/// [`crate::AgentSession::next_sequence`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    agent_id: AgentId,
    seq: Sequence,
    commands: Vec<Command>,
    execute_in_sequence: bool,
}

impl Request {
    pub fn new(
        agent_id: AgentId,
        seq: Sequence,
        commands: Vec<Command>,
        execute_in_sequence: bool,
    ) -> Self {
        Self {
            agent_id,
            seq,
            commands,
            execute_in_sequence,
        }
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn seq(&self) -> Sequence {
        self.seq
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Must be dispatched in order, one at a time, relative to other ordered requests
    pub fn execute_in_sequence(&self) -> bool {
        self.execute_in_sequence
    }

    /// The command eligible for reconciliation, if this request carries
    /// exactly one command and it is reconcilable
    pub fn reconcilable_command(&self) -> Option<&Command> {
        match self.commands.as_slice() {
            [only] if only.reconcilable => Some(only),
            _ => None,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<&str> = self.commands.iter().map(|c| c.kind.as_str()).collect();
        write!(
            f,
            "seq {}-{} {{ agent: {}, in_sequence: {}, commands: [{}] }}",
            self.agent_id,
            self.seq,
            self.agent_id,
            self.execute_in_sequence,
            kinds.join(", ")
        )
    }
}

/// Outcome of one command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub kind: String,
    pub success: bool,
    pub details: String,
    /// Stand-in recorded before the agent reported a real outcome
    pub placeholder: bool,
}

impl CommandResult {
    pub fn ok(kind: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            success: true,
            details: details.into(),
            placeholder: false,
        }
    }

    pub fn failed(kind: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            success: false,
            details: details.into(),
            placeholder: false,
        }
    }

    pub fn placeholder(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            success: false,
            details: String::new(),
            placeholder: true,
        }
    }
}

/// Results correlated to a [`Request`] by sequence number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub agent_id: AgentId,
    pub seq: Sequence,
    /// Echo of the originating request's ordering flag
    pub execute_in_sequence: bool,
    pub results: Vec<CommandResult>,
}

impl Answer {
    pub fn new(request: &Request, results: Vec<CommandResult>) -> Self {
        Self {
            agent_id: request.agent_id(),
            seq: request.seq(),
            execute_in_sequence: request.execute_in_sequence(),
            results,
        }
    }

    pub fn is_success(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(|r| r.success)
    }

    /// No concrete outcome is known yet
    pub fn is_placeholder(&self) -> bool {
        self.results.is_empty() || self.results.iter().any(|r| r.placeholder)
    }
}

/// Connectivity of an agent session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionStatus {
    Connecting = 0,
    Up = 1,
    Disconnected = 2,
}

impl SessionStatus {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionStatus::Connecting,
            1 => SessionStatus::Up,
            _ => SessionStatus::Disconnected,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Connecting => "Connecting",
            SessionStatus::Up => "Up",
            SessionStatus::Disconnected => "Disconnected",
        };
        f.write_str(s)
    }
}

/// Why a session was torn down; delivered to every drained listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Transport reported the link lost
    Disconnected,
    /// Agent declared down by host monitoring
    Down,
    /// Agent is being moved to another management server
    Rebalancing,
    /// Agent permanently removed from the system
    Removed,
    /// Command cancelled on this session
    Cancelled,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcilable_command_requires_single_command() {
        let single = Request::new(1, 10, vec![Command::new(kinds::STOP).reconcilable()], true);
        assert_eq!(
            single.reconcilable_command().map(|c| c.kind.as_str()),
            Some(kinds::STOP)
        );

        let plain = Request::new(1, 11, vec![Command::new(kinds::STOP)], true);
        assert!(plain.reconcilable_command().is_none());

        let multi = Request::new(
            1,
            12,
            vec![
                Command::new(kinds::STOP).reconcilable(),
                Command::new(kinds::START).reconcilable(),
            ],
            true,
        );
        assert!(multi.reconcilable_command().is_none());
    }

    #[test]
    fn test_answer_placeholder_and_success() {
        let req = Request::new(7, 3, vec![Command::new(kinds::READY)], false);

        let empty = Answer::new(&req, vec![]);
        assert!(empty.is_placeholder());
        assert!(!empty.is_success());

        let pending = Answer::new(&req, vec![CommandResult::placeholder(kinds::READY)]);
        assert!(pending.is_placeholder());

        let done = Answer::new(&req, vec![CommandResult::ok(kinds::READY, "ready")]);
        assert!(!done.is_placeholder());
        assert!(done.is_success());
        assert_eq!(done.seq, 3);
        assert!(!done.execute_in_sequence);
    }

    #[test]
    fn test_request_display_lists_fields() {
        let req = Request::new(
            5,
            42,
            vec![Command::new(kinds::START), Command::new(kinds::CHECK_HEALTH)],
            true,
        );
        let s = req.to_string();
        assert!(s.contains("seq 5-42"));
        assert!(s.contains("in_sequence: true"));
        assert!(s.contains("StartCommand, CheckHealthCommand"));
    }

    #[test]
    fn test_status_roundtrip_through_u8() {
        for status in [
            SessionStatus::Connecting,
            SessionStatus::Up,
            SessionStatus::Disconnected,
        ] {
            assert_eq!(SessionStatus::from_u8(status as u8), status);
        }
    }
}
