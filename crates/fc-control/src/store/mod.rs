//! Durable storage for tasks, audit lines and session summaries
//!
//! File-backed implementations live under the daemon's data directory;
//! in-memory implementations back tests and ephemeral runs.

mod file;
mod memory;

pub use file::{FileAuditSink, JsonSummaryStore, JsonTaskStore, MAX_SESSION_SUMMARIES};
pub use memory::{MemoryAuditSink, MemorySummaryStore, MemoryTaskStore};

use std::path::{Path, PathBuf};

/// Scheduled tasks, rewritten in full on each mutation
pub const TASKS_FILE: &str = "scheduled_tasks.json";

/// Append-only log of dispatches and shell activity
pub const COMMAND_LOG_FILE: &str = "command_history.log";

/// Append-only log of warning and critical security events
pub const SECURITY_LOG_FILE: &str = "security.log";

/// Capped array of shell session summaries
pub const SHELL_STATS_FILE: &str = "shell_stats.json";

/// Paths of every durable file under one data directory
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub tasks: PathBuf,
    pub command_log: PathBuf,
    pub security_log: PathBuf,
    pub shell_stats: PathBuf,
}

impl DataPaths {
    /// Standard layout under `data_dir`
    pub fn new(data_dir: &Path) -> Self {
        Self {
            tasks: data_dir.join(TASKS_FILE),
            command_log: data_dir.join(COMMAND_LOG_FILE),
            security_log: data_dir.join(SECURITY_LOG_FILE),
            shell_stats: data_dir.join(SHELL_STATS_FILE),
        }
    }
}
