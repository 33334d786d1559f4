// Rule document parser

//! Configuration file parsing and validation
//!
//! This module loads the TOML rule document: an ordered list of `[[actions]]`
//! tables mapping network conditions to shell commands, plus a `[global]`
//! block with session defaults. Durations are written as humantime strings
//! ("30s", "5m"). The document is loaded once at session start and is
//! immutable afterwards.

use crate::error::HookError;
use crate::types::{ConnectionState, EventKind};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default per-rule execution timeout
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default polling interval for the fallback poll producer
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default retry budget for a failing command within a rule
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// What to do when a rule's commands fail or time out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Suppress the failure entirely
    Ignore,
    /// Log one diagnostic line and keep going
    #[default]
    Warn,
    /// Report upward and stop accepting new observations
    Abort,
}

/// Condition block of a rule; fields AND together, an empty list matches all
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionSet {
    #[serde(default)]
    pub ssid: Vec<String>,
    #[serde(default)]
    pub interface: Vec<String>,
    #[serde(default)]
    pub state: Vec<String>,
    #[serde(default)]
    pub event_type: Vec<String>,
    /// Minimum signal strength in dBm (e.g. -70); an observation without a
    /// signal reading fails the bound
    #[serde(default)]
    pub signal_min: Option<i32>,
}

impl ConditionSet {
    pub fn is_unconstrained(&self) -> bool {
        self.ssid.is_empty()
            && self.interface.is_empty()
            && self.state.is_empty()
            && self.event_type.is_empty()
            && self.signal_min.is_none()
    }
}

/// One named action: a condition set mapped to an ordered command list
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionRule {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub commands: Vec<String>,
    /// Execution timeout; the session's default hook timeout applies when absent
    #[serde(default, deserialize_with = "duration_str::opt")]
    pub timeout: Option<Duration>,
    /// Run as an independent concurrent task instead of blocking dispatch
    #[serde(default, rename = "async")]
    pub concurrent: bool,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(default)]
    pub conditions: ConditionSet,
}

/// Session defaults from the `[global]` block
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Fallback polling interval
    #[serde(default = "default_interval", deserialize_with = "duration_str::plain")]
    pub interval: Duration,
    /// Prefer push-based monitoring over polling alone
    #[serde(default = "default_use_events")]
    pub use_events: bool,
    /// Default execution timeout for rules that do not set one
    #[serde(
        default = "default_hook_timeout",
        deserialize_with = "duration_str::plain"
    )]
    pub hook_timeout: Duration,
    /// Extra attempts for a failing command before the rule counts as failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Log file used in daemon mode
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            use_events: true,
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            log_path: None,
        }
    }
}

fn default_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_use_events() -> bool {
    true
}

fn default_hook_timeout() -> Duration {
    DEFAULT_HOOK_TIMEOUT
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// The whole rule document
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HooksConfig {
    #[serde(default)]
    pub actions: Vec<ActionRule>,
    #[serde(default)]
    pub global: GlobalConfig,
}

/// Serde helpers for humantime duration strings
mod duration_str {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn plain<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => humantime::parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Load and validate the rule document from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<HooksConfig, HookError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .map_err(|e| HookError::ConfigLoad(format!("failed to read {}: {}", path.display(), e)))?;
    parse_config(&contents)
}

/// Parse and validate a rule document
///
/// A rule without an explicit timeout keeps `None`; the dispatcher resolves
/// it against the session's default hook timeout, so CLI overrides compose.
pub fn parse_config(contents: &str) -> Result<HooksConfig, HookError> {
    let config: HooksConfig =
        toml::from_str(contents).map_err(|e| HookError::ConfigLoad(e.to_string()))?;

    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration values
fn validate_config(config: &HooksConfig) -> Result<(), HookError> {
    let mut seen = HashSet::new();

    for action in &config.actions {
        if action.name.is_empty() {
            return Err(HookError::ConfigLoad("action name cannot be empty".into()));
        }
        if !seen.insert(action.name.as_str()) {
            return Err(HookError::ConfigLoad(format!(
                "duplicate action name '{}'",
                action.name
            )));
        }
        if action.commands.is_empty() {
            return Err(HookError::ConfigLoad(format!(
                "action '{}' has no commands",
                action.name
            )));
        }
        if action.commands.iter().any(|c| c.trim().is_empty()) {
            return Err(HookError::ConfigLoad(format!(
                "action '{}' has an empty command",
                action.name
            )));
        }
        if action.timeout == Some(Duration::ZERO) {
            return Err(HookError::ConfigLoad(format!(
                "action '{}' has a zero timeout",
                action.name
            )));
        }
        for state in &action.conditions.state {
            if ConnectionState::parse(state).is_none() {
                return Err(HookError::ConfigLoad(format!(
                    "action '{}' has unknown state condition '{}'",
                    action.name, state
                )));
            }
        }
        for kind in &action.conditions.event_type {
            if EventKind::parse(kind).is_none() {
                return Err(HookError::ConfigLoad(format!(
                    "action '{}' has unknown event_type condition '{}'",
                    action.name, kind
                )));
            }
        }
    }

    if config.global.interval == Duration::ZERO {
        return Err(HookError::ConfigLoad("global.interval must be > 0".into()));
    }
    if config.global.hook_timeout == Duration::ZERO {
        return Err(HookError::ConfigLoad(
            "global.hook_timeout must be > 0".into(),
        ));
    }

    Ok(())
}

/// Example rule document written by `wifi-hooks config init`
pub const EXAMPLE_CONFIG: &str = r#"# wifi-hooks configuration
# Each [[actions]] table maps network conditions to shell commands.

[[actions]]
name = "vpn-connect-office"
description = "Connect to the office VPN when joining the office network"
timeout = "30s"
on_failure = "warn"
commands = [
    "systemctl start openvpn@office",
]

[actions.conditions]
ssid = ["OfficeWiFi", "Office-Guest"]
event_type = ["connect", "change", "push"]

[[actions]]
name = "dns-switch-public"
description = "Switch to public DNS on open networks with decent signal"
timeout = "10s"
async = true
commands = [
    "resolvectl dns wlan0 1.1.1.1 1.0.0.1",
]

[actions.conditions]
ssid = ["Starbucks", "PublicWiFi", "Guest"]
event_type = ["connect"]
signal_min = -70

[[actions]]
name = "network-disconnect"
description = "Clean up when leaving any network"
timeout = "20s"
on_failure = "ignore"
commands = [
    "systemctl stop openvpn@office || true",
]

[actions.conditions]
state = ["disconnected"]
event_type = ["disconnect"]

[global]
use_events = true       # prefer the push event stream (faster response)
interval = "5s"         # fallback polling interval
hook_timeout = "30s"    # default timeout for actions
max_retries = 3         # extra attempts for a failing command
"#;
