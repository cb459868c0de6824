//! Durable storage collaborators
//!
//! Writes are synchronous: the caller persists immediately after each
//! mutation and treats any error as logged-but-non-fatal.

use crate::error::PersistenceError;
use crate::records::{AuditLine, ScheduledTask, SessionSummary};

/// Persists the full scheduled-task set
pub trait TaskStore: Send + Sync {
    /// Load every persisted task (empty when nothing was stored yet)
    fn load(&self) -> Result<Vec<ScheduledTask>, PersistenceError>;

    /// Replace the stored task set with `tasks`
    fn save(&self, tasks: &[ScheduledTask]) -> Result<(), PersistenceError>;
}

/// Append-only line log (`timestamp | actor | action | detail`)
pub trait AuditSink: Send + Sync {
    /// Append one line
    fn append(&self, line: &AuditLine) -> Result<(), PersistenceError>;
}

/// Capped store of shell session close summaries
pub trait SummaryStore: Send + Sync {
    /// Append a summary, dropping the oldest beyond the cap
    fn append(&self, summary: &SessionSummary) -> Result<(), PersistenceError>;

    /// Every retained summary, oldest first
    fn load(&self) -> Result<Vec<SessionSummary>, PersistenceError>;
}
