//! Core error types for fleet-control
//!
//! Every condition in the control plane is recoverable: policy violations
//! and stale handles come back to the caller as typed errors, while local
//! failures (one push in a fan-out, one persistence write) are logged by the
//! component that hit them and never abort the surrounding operation.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::traits::ExecOutput;
use crate::types::{DeviceId, ShellSessionId, TaskId};

/// Top-level error type for the fleet-control ecosystem
#[derive(Error, Debug)]
pub enum FcError {
    /// Registry error
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Dispatch error
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Scheduler error
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Shell gateway error
    #[error("Shell error: {0}")]
    Shell(#[from] ShellError),

    /// Persistence error
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Device session registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No session has ever been registered under this ID
    #[error("Device not found: {0}")]
    NotFound(DeviceId),
}

/// Command dispatch errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The named device is unknown or offline; nothing was sent or logged
    #[error("Device {0} is not online")]
    DeviceOffline(DeviceId),
}

/// Failure of a single push within a dispatch
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushError {
    /// The transport behind the handle has gone away
    #[error("transport closed")]
    Closed,

    /// The transport's outbound queue is full
    #[error("transport queue full")]
    Full,

    /// The session is offline and holds no handle
    #[error("no live transport handle")]
    NoHandle,
}

/// Scheduled task engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Unknown task
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// Interval must be a positive number of minutes
    #[error("Invalid interval: {0} (must be a positive number of minutes)")]
    InvalidInterval(i64),

    /// The engine is shutting down and accepts no further mutations
    #[error("Scheduler is shut down")]
    ShutDown,
}

/// Shell session gateway errors
#[derive(Error, Debug)]
pub enum ShellError {
    /// No session with this ID is retained
    #[error("Shell session not found: {0}")]
    SessionNotFound(ShellSessionId),

    /// The session exists but is closed
    #[error("Shell session {0} is not active")]
    SessionInactive(ShellSessionId),

    /// The security gate rejected the command
    #[error("Command blocked: {0}")]
    CommandBlocked(String),

    /// The process did not finish within the execution timeout
    #[error("Command timed out after {timeout_secs}s")]
    ProcessTimeout {
        /// Configured timeout
        timeout_secs: u64,
        /// Output captured before the process was killed
        partial: ExecOutput,
    },

    /// The process produced more output than the buffer allows
    #[error("Output buffer of {limit} bytes exceeded")]
    BufferExceeded {
        /// Configured output cap
        limit: usize,
        /// Output truncated to the cap
        partial: ExecOutput,
    },

    /// The process could not be started
    #[error("Failed to execute command: {0}")]
    Execution(String),

    /// The target device is not online
    #[error("Device {0} is not online")]
    DeviceOffline(DeviceId),

    /// The gateway is shutting down
    #[error("Shell gateway is shut down")]
    ShutDown,
}

impl ShellError {
    /// Output captured before the failure, if any
    pub fn partial_output(&self) -> Option<&ExecOutput> {
        match self {
            ShellError::ProcessTimeout { partial, .. } | ShellError::BufferExceeded { partial, .. } => {
                Some(partial)
            }
            _ => None,
        }
    }
}

/// Durable-state write/read failures. Never fatal; the in-memory effect stands.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// File system failure
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Encoding/decoding failure
    #[error("Serialization error on {path}: {source}")]
    Serialization {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },
}

impl PersistenceError {
    /// Wrap an I/O error with the file it concerns
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap a serde error with the file it concerns
    pub fn serialization(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Serialization {
            path: path.into(),
            source,
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = DispatchError::DeviceOffline(DeviceId::new("phone-a"));
        assert_eq!(err.to_string(), "Device phone-a is not online");

        let err = SchedulerError::InvalidInterval(0);
        assert!(err.to_string().contains("positive"));

        let err: FcError = ShellError::CommandBlocked("Command is in blocked list".into()).into();
        assert_eq!(
            err.to_string(),
            "Shell error: Command blocked: Command is in blocked list"
        );
    }

    #[test]
    fn test_partial_output() {
        let partial = ExecOutput {
            stdout: "partial".into(),
            ..ExecOutput::default()
        };
        let err = ShellError::ProcessTimeout {
            timeout_secs: 30,
            partial,
        };
        assert_eq!(err.partial_output().map(|o| o.stdout.as_str()), Some("partial"));
        assert!(ShellError::ShutDown.partial_output().is_none());
    }
}
