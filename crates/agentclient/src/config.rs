//! Dispatch options and their per-endpoint-kind resolution

use std::time::Duration;

use agentconfig::{define_options, AgentConfig, ConfigError, Count, StringList, Timeout};

define_options! {
    /// Options recognised by the dispatch engine
    ///
    /// Looked up in `[agent.<kind>]`, then `[agent]`, then `[global]`.
    pub struct DispatchOptions {
        /// Master switch for the extended reconcile wait
        reconcile_commands_enabled: bool = false,
        /// Endpoint kinds reconciliation applies to
        reconcile_endpoint_kinds: StringList = StringList::from_names(&["kvm"]),
        reconcile_poll_interval: agentconfig::Duration = agentconfig::Duration(Duration::from_secs(60)),
        /// Budget for `send_sync` when the caller passes none
        sync_wait_timeout: agentconfig::Duration = agentconfig::Duration(Duration::from_secs(1800)),
        /// Default listener timeout; `-1` disables
        listener_timeout: Timeout = Timeout::DISABLED,
        timer_pool_size: Count = Count(10),
    }
}

impl DispatchOptions {
    /// Load options for `kind`, rejecting malformed values
    pub fn load(config: &AgentConfig, kind: &str) -> Result<Self, ConfigError> {
        let sections = AgentConfig::endpoint_sections(kind);
        let sections: Vec<&str> = sections.iter().map(String::as_str).collect();
        Self::try_from_agent_config(config, &sections)
    }
}

/// Settings resolved for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub reconcile_enabled: bool,
    pub reconcile_poll_interval: Duration,
    pub sync_wait_timeout: Duration,
    pub listener_timeout: Option<Duration>,
}

impl SessionConfig {
    /// Reconciliation is on only if globally enabled and `kind` is listed
    pub fn for_kind(options: &DispatchOptions, kind: &str) -> Self {
        Self {
            reconcile_enabled: options.reconcile_commands_enabled
                && options.reconcile_endpoint_kinds.contains(kind),
            reconcile_poll_interval: options.reconcile_poll_interval.0,
            sync_wait_timeout: options.sync_wait_timeout.0,
            listener_timeout: options.listener_timeout.0,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::for_kind(&DispatchOptions::default(), "")
    }
}
