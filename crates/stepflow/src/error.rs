//! Error types for pipeline execution.
//!
//! Every error maps onto one [`ErrorKind`], which is what callers match on
//! to decide between retrying the same step list, submitting the undo list,
//! or fixing their request. Messages are never parsed for that decision.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Categories of pipeline errors for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad step name, unknown profile, malformed settings. Always a caller bug.
    Configuration,
    /// Host unreachable or command timeout. Safe to re-run the same step list.
    TransientRemote,
    /// The step decided the operation cannot succeed.
    FatalStep,
    /// A critical section is held by someone else.
    LockUnavailable,
}

impl ErrorKind {
    /// Whether re-invoking the same step list may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientRemote | Self::LockUnavailable)
    }

    /// Get a user-friendly description of this error kind.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Configuration => "Invalid request or configuration",
            Self::TransientRemote => "Remote host temporarily unavailable",
            Self::FatalStep => "Step cannot complete",
            Self::LockUnavailable => "Shared resource is locked",
        }
    }

    /// Get actionable advice for this error kind.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Configuration => "Fix the step list or settings and submit again",
            Self::TransientRemote => "Re-run the same step list; completed work is skipped",
            Self::FatalStep => "Investigate the failure, then re-run forward or run undo",
            Self::LockUnavailable => "Wait for the other operation to finish and retry",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Configuration => "configuration",
            Self::TransientRemote => "transient-remote",
            Self::FatalStep => "fatal-step",
            Self::LockUnavailable => "lock-unavailable",
        };
        f.write_str(name)
    }
}

/// Failure of one host inside a fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFailure {
    pub host: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl HostFailure {
    pub fn from_error(host: impl Into<String>, error: &Error) -> Self {
        Self {
            host: host.into(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl std::fmt::Display for HostFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.host, self.message)
    }
}

/// Errors raised by the engine, its collaborators and the steps it runs.
#[derive(Debug, Error)]
pub enum Error {
    /// Step name not present in the profile's table
    #[error("invalid step '{name}' for profile {profile}")]
    UnknownStep { name: String, profile: String },

    /// Profile name not recognised
    #[error("unknown profile '{0}'")]
    UnknownProfile(String),

    /// A setting or option has an unusable value
    #[error("invalid setting {key}: {message}")]
    InvalidSetting { key: String, message: String },

    /// The cluster description is unusable for this step
    #[error("invalid cluster description: {0}")]
    InvalidCluster(String),

    /// Host could not be reached
    #[error("host {host} unreachable: {message}")]
    HostUnreachable { host: String, message: String },

    /// Remote command exceeded its timeout
    #[error("command on {host} timed out after {}s", .timeout.as_secs())]
    Timeout {
        host: String,
        command: String,
        timeout: Duration,
    },

    /// Remote command ran but exited non-zero
    #[error("command on {host} exited with {exit_code}: {stderr}")]
    CommandFailed {
        host: String,
        exit_code: i32,
        stderr: String,
    },

    /// Step logic determined the operation cannot succeed
    #[error("step {step} failed: {message}")]
    StepFailed { step: String, message: String },

    /// One or more hosts failed during a fan-out
    #[error("step {step}: {} host(s) failed: {}", .failures.len(), join_failures(.failures))]
    HostFailures {
        step: String,
        failures: Vec<HostFailure>,
    },

    /// A transient failure survived every in-step retry
    #[error("{operation} still failing after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: String,
    },

    /// A lease on a shared resource is held by another holder
    #[error("resource {key} is locked by {holder}")]
    LockUnavailable { key: String, holder: String },

    /// Completion ledger, progress store or lock store failure
    #[error("state store error: {0}")]
    Store(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn join_failures(failures: &[HostFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Get the error kind for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnknownStep { .. }
            | Error::UnknownProfile(_)
            | Error::InvalidSetting { .. }
            | Error::InvalidCluster(_) => ErrorKind::Configuration,
            Error::HostUnreachable { .. } | Error::Timeout { .. } => ErrorKind::TransientRemote,
            Error::HostFailures { failures, .. } => {
                if !failures.is_empty() && failures.iter().all(|f| f.kind.is_retryable()) {
                    ErrorKind::TransientRemote
                } else {
                    ErrorKind::FatalStep
                }
            }
            Error::LockUnavailable { .. } => ErrorKind::LockUnavailable,
            Error::CommandFailed { .. }
            | Error::StepFailed { .. }
            | Error::RetriesExhausted { .. }
            | Error::Store(_)
            | Error::Io(_)
            | Error::Json(_) => ErrorKind::FatalStep,
        }
    }

    /// Whether this error is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Stable numeric code reported to callers alongside the kind.
    pub fn code(&self) -> u32 {
        match self {
            Error::UnknownStep { .. } => 0x0781,
            Error::UnknownProfile(_) => 0x0782,
            Error::InvalidSetting { .. } => 0x0783,
            Error::InvalidCluster(_) => 0x0784,
            Error::HostUnreachable { .. } => 0x0601,
            Error::Timeout { .. } => 0x0602,
            Error::CommandFailed { .. } => 0x0603,
            Error::HostFailures { .. } => 0x0604,
            Error::StepFailed { .. } => 0x0391,
            Error::RetriesExhausted { .. } => 0x0392,
            Error::LockUnavailable { .. } => 0x0806,
            Error::Store(_) => 0x0901,
            Error::Io(_) => 0x0902,
            Error::Json(_) => 0x0903,
        }
    }

    /// Shorthand for a fatal step error.
    pub fn step_failed(step: impl Into<String>, message: impl Into<String>) -> Self {
        Error::StepFailed {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a bad setting.
    pub fn invalid_setting(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidSetting {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
