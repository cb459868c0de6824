//! Records kept by the control plane
//!
//! These are the values that leave a component: log entries, persisted
//! tasks and summaries, and the read-only snapshots handed to the operator
//! front-end. None of them carry live handles.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PushError;
use crate::time::{log_timestamp, Timestamp};
use crate::traits::ExecOutput;
use crate::types::{
    CloseReason, DeviceId, DeviceStatus, Severity, ShellSessionId, ShellState, Target, TaskId,
};

/// Where a logged command came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "session", rename_all = "snake_case")]
pub enum CommandOrigin {
    /// Pushed to an agent by the dispatcher
    Dispatch,
    /// Run through a shell session
    Shell(ShellSessionId),
}

/// One entry of the bounded command log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandLogEntry {
    /// Unique entry ID
    pub id: String,
    /// Device the command was sent to
    pub device_id: DeviceId,
    /// Command text
    pub command: String,
    /// When it was logged
    pub timestamp: Timestamp,
    /// Dispatcher or shell session
    pub origin: CommandOrigin,
}

impl CommandLogEntry {
    /// New entry stamped now
    pub fn new(device_id: DeviceId, command: impl Into<String>, origin: CommandOrigin) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_id,
            command: command.into(),
            timestamp: crate::time::now(),
            origin,
        }
    }
}

/// A recurring command owned by the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    /// Task ID
    pub id: TaskId,
    /// Human-readable name
    pub name: String,
    /// Command pushed on every fire
    pub command: String,
    /// Period in minutes, always > 0
    pub interval_minutes: u32,
    /// One device or every online device
    pub target: Target,
    /// Whether a timer is armed for this task
    pub enabled: bool,
    /// Creation time
    pub created_at: Timestamp,
    /// Last fire, if any
    #[serde(default)]
    pub last_run: Option<Timestamp>,
    /// Number of fires so far
    #[serde(default)]
    pub run_count: u64,
}

/// Partial update applied by the scheduler; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub command: Option<String>,
    pub interval_minutes: Option<i64>,
    pub target: Option<Target>,
    pub enabled: Option<bool>,
}

impl TaskUpdate {
    /// Whether the update changes nothing
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// A security gate event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// Unique event ID
    pub id: String,
    /// When it happened
    pub timestamp: Timestamp,
    /// Short machine-readable kind (`failed_attempt`, `ip_blocked`, ...)
    pub kind: String,
    /// Free-text detail
    pub detail: String,
    /// Severity
    pub severity: Severity,
}

impl SecurityEvent {
    /// New event stamped now
    pub fn new(kind: impl Into<String>, detail: impl Into<String>, severity: Severity) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: crate::time::now(),
            kind: kind.into(),
            detail: detail.into(),
            severity,
        }
    }

    /// The line written to the security log
    pub fn audit_line(&self) -> AuditLine {
        AuditLine {
            timestamp: self.timestamp,
            actor: self.severity.to_string(),
            action: self.kind.clone(),
            detail: self.detail.clone(),
        }
    }
}

/// One line of an append-only audit log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditLine {
    /// When it happened
    pub timestamp: Timestamp,
    /// Who did it (device, operator, severity)
    pub actor: String,
    /// What was done
    pub action: String,
    /// Free text
    pub detail: String,
}

impl AuditLine {
    /// New line stamped now
    pub fn new(actor: impl Into<String>, action: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            timestamp: crate::time::now(),
            actor: actor.into(),
            action: action.into(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for AuditLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Newlines would split one record across lines
        let detail = self.detail.replace(['\n', '\r'], " ");
        write!(
            f,
            "{} | {} | {} | {}",
            log_timestamp(&self.timestamp),
            self.actor,
            self.action,
            detail
        )
    }
}

/// Statistics persisted when a shell session closes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: ShellSessionId,
    pub device_id: DeviceId,
    pub operator_id: String,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub duration_ms: u64,
    pub command_count: u64,
    pub close_reason: CloseReason,
}

/// One executed command in a shell session's output ring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellOutputEntry {
    pub command: String,
    pub timestamp: Timestamp,
    pub result: ExecOutput,
    pub success: bool,
}

/// Truncated view of a [`ShellOutputEntry`] for history listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub command: String,
    pub timestamp: Timestamp,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: String,
}

/// Maximum characters kept in a history preview
pub const PREVIEW_CHARS: usize = 200;

impl From<&ShellOutputEntry> for HistoryEntry {
    fn from(entry: &ShellOutputEntry) -> Self {
        Self {
            command: entry.command.clone(),
            timestamp: entry.timestamp,
            success: entry.success,
            exit_code: entry.result.exit_code,
            output: preview(&entry.result.stdout),
            error: preview(&entry.result.stderr),
        }
    }
}

/// First [`PREVIEW_CHARS`] characters of `text`
pub fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

/// Snapshot of a device session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub model: String,
    pub address: Option<String>,
    pub connected_at: Timestamp,
    pub last_seen: Timestamp,
    pub disconnected_at: Option<Timestamp>,
    pub status: DeviceStatus,
}

/// Online/offline tallies of the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCounts {
    pub online: usize,
    pub offline: usize,
    pub total: usize,
}

/// Result of pushing to one device within a dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub device_id: DeviceId,
    /// `None` when the push was accepted by the transport
    pub error: Option<PushError>,
}

impl DispatchOutcome {
    /// Whether the transport accepted the command
    pub fn delivered(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-target results of one dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub target: Target,
    pub command: String,
    pub outcomes: Vec<DispatchOutcome>,
}

impl DispatchReport {
    /// Number of pushes the transport accepted
    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|o| o.delivered()).count()
    }

    /// Number of pushes that failed
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.delivered()
    }
}

/// Snapshot of a shell session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellSessionInfo {
    pub id: ShellSessionId,
    pub device_id: DeviceId,
    pub operator_id: String,
    pub start_time: Timestamp,
    pub last_activity: Timestamp,
    pub state: ShellState,
    pub working_directory: String,
    pub environment: HashMap<String, String>,
    pub command_count: u64,
    pub buffered_outputs: usize,
}

/// Shell gateway statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellStats {
    pub active_sessions: usize,
    pub retained_sessions: usize,
    pub total_commands: u64,
}

/// Security gate statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityStats {
    pub total_events: usize,
    pub blocked_addresses: usize,
    pub tracked_addresses: usize,
    pub critical_events: usize,
    pub warning_events: usize,
}

/// Windowed security report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityReport {
    pub generated_at: Timestamp,
    pub window_secs: u64,
    pub total_events: usize,
    pub critical_events: usize,
    pub warning_events: usize,
    pub blocked_addresses: usize,
    pub tracked_addresses: usize,
    /// Newest events inside the window, newest last
    pub recent_events: Vec<SecurityEvent>,
}

/// Scheduler statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub total: usize,
    pub enabled: usize,
    pub armed_timers: usize,
}

/// Periodic fleet status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub generated_at: Timestamp,
    pub devices: DeviceCounts,
    pub commands_today: usize,
    pub active_tasks: usize,
    pub active_shell_sessions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_audit_line_format() {
        let line = AuditLine {
            timestamp: chrono::Utc.with_ymd_and_hms(2024, 5, 2, 8, 0, 0).unwrap(),
            actor: "phone-pixel".into(),
            action: "dispatch".into(),
            detail: "reboot\nnow".into(),
        };
        assert_eq!(
            line.to_string(),
            "2024-05-02T08:00:00.000Z | phone-pixel | dispatch | reboot now"
        );
    }

    #[test]
    fn test_scheduled_task_json_shape() {
        let task = ScheduledTask {
            id: TaskId::from("task_1"),
            name: "battery".into(),
            command: "battery_status".into(),
            interval_minutes: 15,
            target: Target::All,
            enabled: true,
            created_at: chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            last_run: None,
            run_count: 0,
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["intervalMinutes"], 15);
        assert_eq!(json["target"], "all");
        assert!(json["lastRun"].is_null());

        let back: ScheduledTask = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_history_preview_truncates() {
        let entry = ShellOutputEntry {
            command: "cat big".into(),
            timestamp: crate::time::now(),
            result: ExecOutput {
                stdout: "x".repeat(500),
                exit_code: Some(0),
                ..ExecOutput::default()
            },
            success: true,
        };
        let preview = HistoryEntry::from(&entry);
        assert_eq!(preview.output.len(), PREVIEW_CHARS);
        assert!(preview.error.is_empty());
    }

    #[test]
    fn test_dispatch_report_counts() {
        let report = DispatchReport {
            target: Target::All,
            command: "ping".into(),
            outcomes: vec![
                DispatchOutcome {
                    device_id: DeviceId::new("a"),
                    error: None,
                },
                DispatchOutcome {
                    device_id: DeviceId::new("b"),
                    error: Some(PushError::Closed),
                },
            ],
        };
        assert_eq!(report.delivered(), 1);
        assert_eq!(report.failed(), 1);
    }
}
