// Error taxonomy

//! Typed errors for probe, parse, and command failures.
//!
//! Probe and parse errors are absorbed where they occur (degrading to an
//! `Unknown` observation or a dropped event line); command errors stay scoped
//! to the rule that ran the command and are handled by its failure policy.
//! Only [`HookError::ConfigLoad`] is fatal, and only at session startup.

use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HookError {
    /// One probe strategy could not run; the next backend is tried
    #[error("probe backend '{backend}' unavailable: {reason}")]
    ProbeUnavailable {
        backend: &'static str,
        reason: String,
    },

    /// An event-stream line did not match the expected grammar
    #[error("unrecognized event line: {line:?}")]
    Parse { line: String },

    /// The OS failed to start the process
    #[error("failed to spawn '{command}': {source}")]
    CommandSpawn {
        command: String,
        source: std::io::Error,
    },

    /// The process ran but exited with a non-zero status
    #[error("'{command}' exited with {status}")]
    NonZeroExit {
        command: String,
        status: ExitStatus,
    },

    /// A rule's commands did not finish within its execution timeout
    #[error("action '{rule}' timed out after {timeout:?}")]
    ActionTimeout { rule: String, timeout: Duration },

    /// The rule document could not be read, parsed, or validated
    #[error("failed to load configuration: {0}")]
    ConfigLoad(String),
}
