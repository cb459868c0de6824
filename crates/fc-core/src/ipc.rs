//! IPC protocol between operator clients and the control plane
//!
//! Newline-delimited JSON over TCP on localhost (127.0.0.1). Every request
//! gets exactly one response line; events are interleaved on the same
//! connection as they happen. Message `type` tags are unique across
//! requests, responses and events so a client can decode any line with
//! [`IpcMessage`].

use std::collections::HashMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::records::{
    CommandLogEntry, DeviceCounts, DeviceInfo, DispatchReport, HistoryEntry, ScheduledTask,
    SecurityEvent, SecurityReport, SecurityStats, ShellSessionInfo, ShellStats, StatusReport,
    TaskStats, TaskUpdate,
};
use crate::traits::ExecOutput;
use crate::types::{CloseReason, DeviceId, ShellSessionId, StatusFilter, Target, TaskId};

/// IPC request from an operator client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Present the IPC token; required first when a token is configured
    Authenticate { token: String },

    /// Control-plane status
    GetStatus,

    /// List device sessions
    ListDevices {
        #[serde(default)]
        filter: StatusFilter,
    },

    /// One device session
    GetDevice { device_id: DeviceId },

    /// Push a command to one device or `"all"`
    SendCommand {
        target: Target,
        command: String,
        #[serde(default)]
        extras: Vec<String>,
    },

    /// Newest command log entries
    GetCommandHistory { limit: Option<usize> },

    /// Every scheduled task
    ListTasks,

    /// One scheduled task
    GetTask { task_id: TaskId },

    /// Create a scheduled task
    CreateTask {
        name: String,
        command: String,
        interval_minutes: i64,
        target: Target,
    },

    /// Change fields of a scheduled task
    UpdateTask { task_id: TaskId, update: TaskUpdate },

    /// Delete a scheduled task
    DeleteTask { task_id: TaskId },

    /// Flip a task's enabled flag
    ToggleTask { task_id: TaskId },

    /// Fire a task immediately
    RunTask { task_id: TaskId },

    /// Scheduler counts
    GetTaskStats,

    /// Open a shell session against a device
    CreateShellSession {
        device_id: DeviceId,
        operator_id: String,
        working_directory: Option<String>,
        #[serde(default)]
        environment: HashMap<String, String>,
    },

    /// Run a command in a shell session
    Execute {
        session_id: ShellSessionId,
        command: String,
    },

    /// Newest executed commands of a session
    GetShellHistory {
        session_id: ShellSessionId,
        limit: Option<usize>,
    },

    /// Change a session's working directory
    ChangeDirectory {
        session_id: ShellSessionId,
        directory: String,
    },

    /// Set an environment override on a session
    SetEnv {
        session_id: ShellSessionId,
        key: String,
        value: String,
    },

    /// Close a shell session
    CloseShellSession { session_id: ShellSessionId },

    /// One shell session
    GetShellSession { session_id: ShellSessionId },

    /// Active shell sessions
    ListShellSessions,

    /// Shell gateway counts
    GetShellStats,

    /// Whether an address is blocked
    IsBlocked { address: IpAddr },

    /// Count a failed authentication from an address
    RecordFailedAttempt { address: IpAddr },

    /// Block an address
    BlockAddress { address: IpAddr, reason: String },

    /// Lift a block early
    UnblockAddress { address: IpAddr },

    /// Security report over the last `window_secs` (default 24 h)
    GetSecurityReport { window_secs: Option<u64> },

    /// Security gate counts
    GetSecurityStats,

    /// Keepalive
    Ping,

    /// Stop the daemon
    Shutdown,
}

/// Machine-readable class of an IPC error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpcErrorKind {
    InvalidRequest,
    Unauthorized,
    NotFound,
    DeviceOffline,
    SessionInactive,
    CommandBlocked,
    ProcessTimeout,
    BufferExceeded,
    InvalidInterval,
    Unavailable,
    Internal,
}

/// IPC response to an operator client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    /// Token accepted
    Authenticated,

    /// Control-plane status
    Status(ControlStatus),

    /// Device sessions
    Devices { devices: Vec<DeviceInfo> },

    /// One device session
    Device(DeviceInfo),

    /// Per-target dispatch results
    Dispatched(DispatchReport),

    /// Command log entries, oldest first
    CommandHistory { entries: Vec<CommandLogEntry> },

    /// Scheduled tasks
    Tasks { tasks: Vec<ScheduledTask> },

    /// One scheduled task
    Task(ScheduledTask),

    /// Scheduler counts
    TaskStats(TaskStats),

    /// One shell session
    ShellSession(ShellSessionInfo),

    /// Shell sessions
    ShellSessions { sessions: Vec<ShellSessionInfo> },

    /// Result of a shell command
    ShellOutput(ExecOutput),

    /// Shell history previews, oldest first
    ShellHistory { entries: Vec<HistoryEntry> },

    /// Shell gateway counts
    ShellStats(ShellStats),

    /// Block state of an address
    BlockState { address: IpAddr, blocked: bool },

    /// Security report
    SecurityReport(SecurityReport),

    /// Security gate counts
    SecurityStats(SecurityStats),

    /// Generic success
    Ok,

    /// Pong response
    Pong,

    /// Error response
    Error {
        kind: IpcErrorKind,
        message: String,
        /// Output captured before a timeout or buffer overflow
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial_output: Option<ExecOutput>,
    },
}

impl IpcResponse {
    /// Error response without partial output
    pub fn error(kind: IpcErrorKind, message: impl Into<String>) -> Self {
        IpcResponse::Error {
            kind,
            message: message.into(),
            partial_output: None,
        }
    }
}

/// Lifecycle notification pushed to every connected operator client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    /// An agent registered
    DeviceConnected {
        device: DeviceInfo,
        online_count: usize,
    },

    /// An agent went offline
    DeviceDisconnected {
        device_id: DeviceId,
        online_count: usize,
    },

    /// An agent answered a command
    DeviceResponse {
        device_id: DeviceId,
        kind: String,
        payload: Vec<u8>,
    },

    /// A scheduled task fired
    TaskFired {
        task_id: TaskId,
        run_count: u64,
        delivered: usize,
    },

    /// A shell session left the active state
    ShellSessionClosed {
        session_id: ShellSessionId,
        reason: CloseReason,
    },

    /// A warning or critical security event
    SecurityAlert(SecurityEvent),

    /// Periodic status report
    StatusReport(StatusReport),
}

/// Control-plane status information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlStatus {
    /// Uptime in seconds
    pub uptime_secs: u64,
    /// Daemon version
    pub version: String,
    /// Agent listener address
    pub agent_bind_address: String,
    /// Device tallies
    pub devices: DeviceCounts,
    /// Number of scheduled tasks
    pub task_count: usize,
    /// Number of active shell sessions
    pub active_shell_sessions: usize,
    /// Number of blocked addresses
    pub blocked_addresses: usize,
}

/// Any line on an IPC connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IpcMessage {
    Request(IpcRequest),
    Response(IpcResponse),
    Event(FleetEvent),
}

impl IpcMessage {
    /// Serialize to a JSON line (without the trailing newline)
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from one JSON line
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl From<IpcRequest> for IpcMessage {
    fn from(req: IpcRequest) -> Self {
        IpcMessage::Request(req)
    }
}

impl From<IpcResponse> for IpcMessage {
    fn from(resp: IpcResponse) -> Self {
        IpcMessage::Response(resp)
    }
}

impl From<FleetEvent> for IpcMessage {
    fn from(event: FleetEvent) -> Self {
        IpcMessage::Event(event)
    }
}
