//! Collaborator trait definitions
//!
//! The control plane talks to the outside world through these seams:
//! process execution for shell sessions and durable storage for tasks,
//! audit lines and session summaries.

mod executor;
mod store;

pub use executor::{ExecOutput, ExecRequest, ExecTermination, ProcessExecutor};
pub use store::{AuditSink, SummaryStore, TaskStore};
