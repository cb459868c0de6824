//! File-backed stores
//!
//! Writes are synchronous and serialized per file. JSON files are written
//! to a temporary sibling and renamed into place so a crash never leaves a
//! half-written file behind.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;

use fc_core::error::PersistenceError;
use fc_core::records::{AuditLine, ScheduledTask, SessionSummary};
use fc_core::traits::{AuditSink, SummaryStore, TaskStore};

/// Session summaries kept in `shell_stats.json`
pub const MAX_SESSION_SUMMARIES: usize = 100;

fn ensure_parent(path: &Path) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;
    }
    Ok(())
}

fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, PersistenceError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(PersistenceError::io(path, e)),
    };
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&content).map_err(|e| PersistenceError::serialization(path, e))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    ensure_parent(path)?;
    let content =
        serde_json::to_vec_pretty(value).map_err(|e| PersistenceError::serialization(path, e))?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).map_err(|e| PersistenceError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| PersistenceError::io(path, e))
}

/// Scheduled tasks as a pretty JSON array
pub struct JsonTaskStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonTaskStore {
    /// Store backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

impl TaskStore for JsonTaskStore {
    fn load(&self) -> Result<Vec<ScheduledTask>, PersistenceError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        read_json(&self.path)
    }

    fn save(&self, tasks: &[ScheduledTask]) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        write_json(&self.path, tasks)
    }
}

/// Append-only `timestamp | actor | action | detail` log file
pub struct FileAuditSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileAuditSink {
    /// Sink appending to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for FileAuditSink {
    fn append(&self, line: &AuditLine) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        ensure_parent(&self.path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| PersistenceError::io(&self.path, e))?;
        writeln!(file, "{}", line).map_err(|e| PersistenceError::io(&self.path, e))
    }
}

/// Session summaries as a JSON array capped at [`MAX_SESSION_SUMMARIES`]
pub struct JsonSummaryStore {
    path: PathBuf,
    capacity: usize,
    lock: Mutex<()>,
}

impl JsonSummaryStore {
    /// Store backed by `path` with the default cap
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_capacity(path, MAX_SESSION_SUMMARIES)
    }

    /// Store backed by `path` keeping at most `capacity` summaries
    pub fn with_capacity(path: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            path: path.into(),
            capacity: capacity.max(1),
            lock: Mutex::new(()),
        }
    }
}

impl SummaryStore for JsonSummaryStore {
    fn append(&self, summary: &SessionSummary) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut summaries: Vec<SessionSummary> = read_json(&self.path)?;
        summaries.push(summary.clone());
        if summaries.len() > self.capacity {
            let excess = summaries.len() - self.capacity;
            summaries.drain(..excess);
        }
        write_json(&self.path, &summaries)
    }

    fn load(&self) -> Result<Vec<SessionSummary>, PersistenceError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        read_json(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_core::time;
    use fc_core::types::{CloseReason, DeviceId, ShellSessionId, Target, TaskId};

    fn task(id: &str) -> ScheduledTask {
        ScheduledTask {
            id: TaskId::from(id),
            name: format!("task {}", id),
            command: "battery_status".into(),
            interval_minutes: 5,
            target: Target::All,
            enabled: true,
            created_at: time::now(),
            last_run: None,
            run_count: 0,
        }
    }

    fn summary(n: usize) -> SessionSummary {
        SessionSummary {
            session_id: ShellSessionId::from(format!("shell_{}", n).as_str()),
            device_id: DeviceId::new("d"),
            operator_id: "op".into(),
            start_time: time::now(),
            end_time: time::now(),
            duration_ms: 10,
            command_count: n as u64,
            close_reason: CloseReason::Manual,
        }
    }

    #[test]
    fn test_task_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonTaskStore::new(dir.path().join("tasks.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_task_store_save_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonTaskStore::new(dir.path().join("data").join("tasks.json"));

        store.save(&[task("a"), task("b")]).unwrap();
        store.save(&[task("b")]).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, TaskId::from("b"));
    }

    #[test]
    fn test_task_store_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        fs::write(&path, "{ not json").unwrap();

        let err = JsonTaskStore::new(&path).load().unwrap_err();
        assert!(matches!(err, PersistenceError::Serialization { .. }));
    }

    #[test]
    fn test_audit_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileAuditSink::new(dir.path().join("command_history.log"));

        sink.append(&AuditLine::new("dev-1", "dispatch", "ping")).unwrap();
        sink.append(&AuditLine::new("dev-2", "dispatch", "reboot")).unwrap();

        let content = fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("| dev-1 | dispatch | ping"));
        assert!(lines[1].ends_with("| dev-2 | dispatch | reboot"));
    }

    #[test]
    fn test_summary_store_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSummaryStore::with_capacity(dir.path().join("shell_stats.json"), 3);

        for n in 0..5 {
            store.append(&summary(n)).unwrap();
        }

        let loaded = store.load().unwrap();
        let counts: Vec<u64> = loaded.iter().map(|s| s.command_count).collect();
        assert_eq!(counts, vec![2, 3, 4]);
    }
}
