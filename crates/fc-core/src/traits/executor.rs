//! Process execution collaborator

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A command to run on behalf of a shell session
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Full command text as typed by the operator
    pub command: String,
    /// Working directory of the session
    pub working_directory: String,
    /// Environment overrides layered over the inherited environment
    pub env: HashMap<String, String>,
    /// Kill the process after this long
    pub timeout: Duration,
    /// Kill the process once stdout or stderr exceeds this many bytes
    pub max_output_bytes: usize,
}

/// How a process run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecTermination {
    /// The process exited on its own
    #[default]
    Exited,
    /// Killed after the execution timeout
    TimedOut,
    /// Killed after exceeding the output cap
    BufferExceeded,
}

/// Captured output of a process run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    /// Captured standard output (truncated to the cap when exceeded)
    pub stdout: String,
    /// Captured standard error (truncated to the cap when exceeded)
    pub stderr: String,
    /// Exit code, if the process exited normally
    pub exit_code: Option<i32>,
    /// Wall time of the run in milliseconds
    pub execution_time_ms: u64,
    /// How the run ended
    pub termination: ExecTermination,
}

impl ExecOutput {
    /// Whether the process exited on its own with status 0
    pub fn success(&self) -> bool {
        self.termination == ExecTermination::Exited && self.exit_code == Some(0)
    }
}

/// Runs commands for the shell gateway.
///
/// Implementations must honour `timeout` and `max_output_bytes` by killing
/// the process and reporting the matching [`ExecTermination`] with whatever
/// output was captured. An `Err` means the process could not be run. The
/// gateway treats `NotFound`, `PermissionDenied` and `InvalidInput` as a
/// bad command and any other kind as a broken session.
#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    /// Run one command to completion (or termination)
    async fn execute(&self, request: ExecRequest) -> std::io::Result<ExecOutput>;
}
