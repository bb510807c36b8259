//! Agent dispatch configuration file parser
//!
//! This crate parses the INI-style configuration file read by the management
//! server and exposes typed option lookup with section fallback.
//!
//! Sections are resolved from most to least specific. For an endpoint of kind
//! `kvm` the lookup order is `[agent.kvm]`, `[agent]`, `[global]`.
//!
//! # Example
//!
//! ```no_run
//! use agentconfig::AgentConfig;
//!
//! let config = AgentConfig::from_file("/etc/cloud/agent.conf").unwrap();
//! let sections = AgentConfig::endpoint_sections("kvm");
//! let sections: Vec<&str> = sections.iter().map(String::as_str).collect();
//! let poll = config.get_with_fallback(&sections, "reconcile_poll_interval");
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(String),

    #[error("Missing required option: {0}")]
    MissingOption(String),
}

/// Trait for types that can be parsed from configuration values
pub trait ConfigValue: Sized + Clone {
    /// Parse from a string value in the config file
    fn parse_config_value(s: &str) -> Result<Self, ConfigError>;

    /// Get the type name for error messages
    fn type_name() -> &'static str;
}

/// Duration value (supports time units: s, ms, us, m, h, d)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Duration(pub std::time::Duration);

impl ConfigValue for Duration {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        parse_duration(s).map(Duration)
    }

    fn type_name() -> &'static str {
        "duration"
    }
}

/// Optional timeout; `-1` disables it
///
/// Any other value is parsed like [`Duration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout(pub Option<std::time::Duration>);

impl Timeout {
    pub const DISABLED: Timeout = Timeout(None);
}

impl ConfigValue for Timeout {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        if s.trim() == "-1" {
            return Ok(Timeout(None));
        }
        parse_duration(s).map(|d| Timeout(Some(d)))
    }

    fn type_name() -> &'static str {
        "timeout"
    }
}

/// Count value (plain integer)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Count(pub u64);

impl ConfigValue for Count {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        s.trim()
            .parse()
            .map(Count)
            .map_err(|_| ConfigError::ParseError(format!("Invalid count: {}", s)))
    }

    fn type_name() -> &'static str {
        "count"
    }
}

/// Comma separated list of names, lowercased and trimmed
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StringList(pub Vec<String>);

impl StringList {
    pub fn from_names(names: &[&str]) -> Self {
        StringList(names.iter().map(|s| s.to_lowercase()).collect())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| n.eq_ignore_ascii_case(name))
    }
}

impl ConfigValue for StringList {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        Ok(StringList(
            s.split(',')
                .map(|item| item.trim().to_lowercase())
                .filter(|item| !item.is_empty())
                .collect(),
        ))
    }

    fn type_name() -> &'static str {
        "list"
    }
}

impl ConfigValue for bool {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Ok(true),
            "false" | "no" | "0" | "off" => Ok(false),
            _ => Err(ConfigError::ParseError(format!("Invalid bool: {}", s))),
        }
    }

    fn type_name() -> &'static str {
        "bool"
    }
}

impl ConfigValue for String {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        Ok(s.to_string())
    }

    fn type_name() -> &'static str {
        "string"
    }
}

/// A configuration option with name, type, and default value
pub struct ConfigOption<T: ConfigValue> {
    name: &'static str,
    default: T,
    description: Option<&'static str>,
}

impl<T: ConfigValue> ConfigOption<T> {
    pub const fn new(name: &'static str, default: T) -> Self {
        Self {
            name,
            default,
            description: None,
        }
    }

    pub const fn with_description(mut self, desc: &'static str) -> Self {
        self.description = Some(desc);
        self
    }

    /// Get the value from config, falling back to default
    ///
    /// A value that fails to parse is treated as absent.
    pub fn get(&self, config: &AgentConfig, sections: &[&str]) -> T {
        config
            .get_with_fallback(sections, self.name)
            .and_then(|s| T::parse_config_value(s).ok())
            .unwrap_or_else(|| self.default.clone())
    }

    /// Like [`ConfigOption::get`], but reports values that fail to parse
    pub fn try_get(&self, config: &AgentConfig, sections: &[&str]) -> Result<T, ConfigError> {
        match config.get_with_fallback(sections, self.name) {
            Some(raw) => T::parse_config_value(raw).map_err(|e| {
                ConfigError::ParseError(format!(
                    "option '{}' expects a {}: {}",
                    self.name,
                    T::type_name(),
                    e
                ))
            }),
            None => Ok(self.default.clone()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn default_value(&self) -> &T {
        &self.default
    }

    pub fn description(&self) -> Option<&'static str> {
        self.description
    }
}

/// Parse duration string with time units
fn parse_duration(s: &str) -> Result<std::time::Duration, ConfigError> {
    let s = s.trim();

    let num_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    let num_str = &s[..num_end];
    let unit = &s[num_end..].trim().to_lowercase();

    let num: f64 = num_str
        .parse()
        .map_err(|_| ConfigError::ParseError(format!("Invalid number: {}", num_str)))?;

    let seconds = match unit.as_str() {
        "" | "s" | "sec" | "second" | "seconds" => num,
        "ms" | "msec" | "millisecond" | "milliseconds" => num / 1000.0,
        "us" | "usec" | "microsecond" | "microseconds" => num / 1_000_000.0,
        "m" | "min" | "minute" | "minutes" => num * 60.0,
        "h" | "hr" | "hour" | "hours" => num * 3600.0,
        "d" | "day" | "days" => num * 86400.0,
        _ => {
            return Err(ConfigError::ParseError(format!(
                "Unknown time unit: {}",
                unit
            )))
        }
    };

    std::time::Duration::try_from_secs_f64(seconds)
        .map_err(|e| ConfigError::ParseError(format!("Duration out of range: {}: {}", s, e)))
}

/// A parsed configuration file
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    sections: HashMap<String, HashMap<String, String>>,
}

impl AgentConfig {
    /// Parse a configuration file from the given path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a configuration from a string
    ///
    /// Keys are normalised so that `reconcile poll interval` and
    /// `reconcile_poll_interval` refer to the same option.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current_section = String::from("global");

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();

            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') {
                if !line.ends_with(']') || line.len() < 3 {
                    return Err(ConfigError::ParseError(format!(
                        "line {}: malformed section header '{}'",
                        lineno + 1,
                        line
                    )));
                }
                current_section = line[1..line.len() - 1].trim().to_lowercase();
                sections.entry(current_section.clone()).or_default();
                continue;
            }

            if let Some(eq_pos) = line.find('=') {
                let key = normalize_key(&line[..eq_pos]);
                let value = line[eq_pos + 1..].trim().to_string();

                sections
                    .entry(current_section.clone())
                    .or_default()
                    .insert(key, value);
            } else {
                return Err(ConfigError::ParseError(format!(
                    "line {}: expected 'key = value', got '{}'",
                    lineno + 1,
                    line
                )));
            }
        }

        Ok(Self { sections })
    }

    /// Get a configuration value from a specific section
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(&normalize_key(key)))
            .map(|v| v.as_str())
    }

    /// Get a configuration value, checking multiple sections in order
    pub fn get_with_fallback(&self, sections: &[&str], key: &str) -> Option<&str> {
        sections
            .iter()
            .find_map(|section| self.get(section, key))
    }

    /// Section lookup order for an endpoint kind
    pub fn endpoint_sections(kind: &str) -> Vec<String> {
        vec![
            format!("agent.{}", kind.to_lowercase()),
            "agent".to_string(),
            "global".to_string(),
        ]
    }

    pub fn sections(&self) -> Vec<&str> {
        self.sections.keys().map(|s| s.as_str()).collect()
    }

    pub fn keys(&self, section: &str) -> Vec<&str> {
        self.sections
            .get(section)
            .map(|s| s.keys().map(|k| k.as_str()).collect())
            .unwrap_or_default()
    }
}

fn normalize_key(key: &str) -> String {
    key.trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}

/// Define a configuration struct with typed options
///
/// # Example
///
/// ```
/// use agentconfig::{define_options, AgentConfig, Count, Duration};
///
/// define_options! {
///     /// Timer configuration
///     pub struct TimerConfig {
///         /// Number of alarm workers
///         timer_pool_size: Count = Count(10),
///
///         /// Poll interval
///         poll_interval: Duration = Duration(std::time::Duration::from_secs(60)),
///     }
/// }
///
/// let config = AgentConfig::parse("[agent]\ntimer_pool_size = 4\n").unwrap();
/// let timers = TimerConfig::from_agent_config(&config, &["agent", "global"]);
///
/// assert_eq!(timers.timer_pool_size.0, 4);
/// assert_eq!(timers.poll_interval.0, std::time::Duration::from_secs(60));
/// ```
#[macro_export]
macro_rules! define_options {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field:ident: $ty:ty = $default:expr
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis struct $name {
            $(
                $(#[$field_meta])*
                pub $field: $ty,
            )*
        }

        impl $name {
            /// Create with default values
            pub fn new() -> Self {
                Self {
                    $(
                        $field: $default,
                    )*
                }
            }

            /// Load from a parsed config with section fallback
            pub fn from_agent_config(
                config: &$crate::AgentConfig,
                sections: &[&str],
            ) -> Self {
                Self {
                    $(
                        $field: {
                            let opt = $crate::ConfigOption::new(stringify!($field), $default);
                            opt.get(config, sections)
                        },
                    )*
                }
            }

            /// Strict variant of `from_agent_config` that rejects malformed values
            pub fn try_from_agent_config(
                config: &$crate::AgentConfig,
                sections: &[&str],
            ) -> Result<Self, $crate::ConfigError> {
                Ok(Self {
                    $(
                        $field: {
                            let opt = $crate::ConfigOption::new(stringify!($field), $default);
                            opt.try_get(config, sections)?
                        },
                    )*
                })
            }

            /// Get option names (for introspection)
            pub fn option_names() -> &'static [&'static str] {
                &[
                    $(stringify!($field),)*
                ]
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TEST_CONFIG: &str = r#"
; Management server agent settings
[global]
sync wait timeout = 30m
timer_pool_size = 16

[agent]
reconcile_commands_enabled = true
reconcile_endpoint_kinds = KVM, vmware
listener_timeout = -1

[agent.kvm]
reconcile poll interval = 15s
listener_timeout = 90
"#;

    #[test]
    fn test_parse_config() {
        let config = AgentConfig::parse(TEST_CONFIG).unwrap();

        assert_eq!(config.get("global", "sync_wait_timeout"), Some("30m"));
        assert_eq!(config.get("agent", "listener_timeout"), Some("-1"));
        assert_eq!(config.get("agent.kvm", "reconcile_poll_interval"), Some("15s"));
        // Spaced and underscored spellings are the same key
        assert_eq!(config.get("agent.kvm", "reconcile poll interval"), Some("15s"));
    }

    #[test]
    fn test_malformed_lines() {
        assert!(AgentConfig::parse("[agent\nfoo = 1").is_err());
        assert!(AgentConfig::parse("[agent]\njust a line").is_err());
    }

    #[test]
    fn test_endpoint_fallback() {
        let config = AgentConfig::parse(TEST_CONFIG).unwrap();

        let kvm = AgentConfig::endpoint_sections("KVM");
        let kvm: Vec<&str> = kvm.iter().map(String::as_str).collect();
        assert_eq!(kvm, vec!["agent.kvm", "agent", "global"]);

        assert_eq!(config.get_with_fallback(&kvm, "listener_timeout"), Some("90"));
        assert_eq!(config.get_with_fallback(&kvm, "timer_pool_size"), Some("16"));

        let xen = AgentConfig::endpoint_sections("xen");
        let xen: Vec<&str> = xen.iter().map(String::as_str).collect();
        assert_eq!(config.get_with_fallback(&xen, "listener_timeout"), Some("-1"));
        assert_eq!(config.get_with_fallback(&xen, "nonexistent"), None);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TEST_CONFIG.as_bytes()).unwrap();

        let config = AgentConfig::from_file(file.path()).unwrap();
        let sections = config.sections();
        assert!(sections.contains(&"global"));
        assert!(sections.contains(&"agent"));
        assert!(sections.contains(&"agent.kvm"));
        assert!(config.keys("agent").contains(&"reconcile_endpoint_kinds"));

        assert!(AgentConfig::from_file("/nonexistent/agent.conf").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(
            parse_duration("30").unwrap(),
            std::time::Duration::from_secs(30)
        );
        assert_eq!(
            parse_duration("5min").unwrap(),
            std::time::Duration::from_secs(300)
        );
        assert_eq!(
            parse_duration("1h").unwrap(),
            std::time::Duration::from_secs(3600)
        );
        assert_eq!(
            parse_duration("500ms").unwrap(),
            std::time::Duration::from_millis(500)
        );
        assert!(parse_duration("10 fortnights").is_err());
    }

    #[test]
    fn test_parse_duration_out_of_range() {
        assert!(parse_duration("100000000000000000000000d").is_err());
        let overflow = <Duration as ConfigValue>::parse_config_value("100000000000000000000000d");
        assert!(overflow.is_err());
        assert_eq!(
            parse_duration("7d").unwrap(),
            std::time::Duration::from_secs(7 * 86400)
        );
    }

    #[test]
    fn test_timeout_config_value() {
        assert_eq!(Timeout::parse_config_value("-1").unwrap(), Timeout::DISABLED);
        assert_eq!(
            Timeout::parse_config_value("2s").unwrap().0,
            Some(std::time::Duration::from_secs(2))
        );
        assert!(Timeout::parse_config_value("-5").is_err());
        assert_eq!(Timeout::type_name(), "timeout");
    }

    #[test]
    fn test_string_list_config_value() {
        let list = StringList::parse_config_value(" KVM, vmware ,, ").unwrap();
        assert_eq!(list.0, vec!["kvm".to_string(), "vmware".to_string()]);
        assert!(list.contains("VMware"));
        assert!(!list.contains("xen"));
    }

    #[test]
    fn test_bool_and_count_values() {
        assert!(bool::parse_config_value("on").unwrap());
        assert!(!bool::parse_config_value("No").unwrap());
        assert!(bool::parse_config_value("maybe").is_err());
        assert_eq!(Count::parse_config_value(" 12 ").unwrap().0, 12);
        assert!(Count::parse_config_value("-3").is_err());
    }

    #[test]
    fn test_config_option_strict() {
        let config = AgentConfig::parse("[agent]\ntimer_pool_size = lots\n").unwrap();
        let opt = ConfigOption::new("timer_pool_size", Count(10))
            .with_description("Alarm worker count");

        assert_eq!(opt.get(&config, &["agent"]).0, 10);
        assert!(opt.try_get(&config, &["agent"]).is_err());
        assert_eq!(opt.try_get(&config, &["global"]).unwrap().0, 10);
        assert_eq!(opt.description(), Some("Alarm worker count"));
    }

    #[test]
    fn test_define_options_macro() {
        define_options! {
            pub struct TestOptions {
                reconcile_commands_enabled: bool = false,
                reconcile_poll_interval: Duration = Duration(std::time::Duration::from_secs(60)),
                listener_timeout: Timeout = Timeout(Some(std::time::Duration::from_secs(5))),
            }
        }

        let defaults = TestOptions::default();
        assert!(!defaults.reconcile_commands_enabled);
        assert_eq!(
            defaults.listener_timeout.0,
            Some(std::time::Duration::from_secs(5))
        );

        let config = AgentConfig::parse(TEST_CONFIG).unwrap();
        let sections = AgentConfig::endpoint_sections("kvm");
        let sections: Vec<&str> = sections.iter().map(String::as_str).collect();
        let opts = TestOptions::from_agent_config(&config, &sections);

        assert!(opts.reconcile_commands_enabled);
        assert_eq!(
            opts.reconcile_poll_interval.0,
            std::time::Duration::from_secs(15)
        );
        assert_eq!(
            opts.listener_timeout.0,
            Some(std::time::Duration::from_secs(90))
        );

        assert_eq!(TestOptions::option_names().len(), 3);
    }
}
