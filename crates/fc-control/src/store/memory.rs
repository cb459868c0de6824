//! In-memory stores

use std::sync::{Mutex, PoisonError};

use fc_core::error::PersistenceError;
use fc_core::records::{AuditLine, ScheduledTask, SessionSummary};
use fc_core::traits::{AuditSink, SummaryStore, TaskStore};

/// Task store holding the last saved set
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<Vec<ScheduledTask>>,
    saves: Mutex<usize>,
}

impl MemoryTaskStore {
    /// Store pre-populated with `tasks`
    pub fn with_tasks(tasks: Vec<ScheduledTask>) -> Self {
        Self {
            tasks: Mutex::new(tasks),
            saves: Mutex::new(0),
        }
    }

    /// Number of `save` calls so far
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The last saved task set
    pub fn snapshot(&self) -> Vec<ScheduledTask> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TaskStore for MemoryTaskStore {
    fn load(&self) -> Result<Vec<ScheduledTask>, PersistenceError> {
        Ok(self.snapshot())
    }

    fn save(&self, tasks: &[ScheduledTask]) -> Result<(), PersistenceError> {
        *self.tasks.lock().unwrap_or_else(PoisonError::into_inner) = tasks.to_vec();
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }
}

/// Audit sink collecting formatted lines
#[derive(Default)]
pub struct MemoryAuditSink {
    lines: Mutex<Vec<String>>,
}

impl MemoryAuditSink {
    /// Every appended line, formatted
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, line: &AuditLine) -> Result<(), PersistenceError> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_string());
        Ok(())
    }
}

/// Summary store without a cap
#[derive(Default)]
pub struct MemorySummaryStore {
    summaries: Mutex<Vec<SessionSummary>>,
}

impl SummaryStore for MemorySummaryStore {
    fn append(&self, summary: &SessionSummary) -> Result<(), PersistenceError> {
        self.summaries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(summary.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<SessionSummary>, PersistenceError> {
        Ok(self
            .summaries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}
