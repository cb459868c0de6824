//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::auth::random_suffix;

/// Model name used when an agent does not report one
pub const UNKNOWN_MODEL: &str = "unknown";

/// Target keyword addressing every online device
pub const ALL_DEVICES: &str = "all";

/// Stable identifier for an agent device, derived from its connection metadata
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Create a new device ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the identity from the host and model an agent reports.
    ///
    /// The same host/model pair always maps to the same ID, so a reconnecting
    /// agent overwrites its previous session instead of creating a new one.
    pub fn from_metadata(host: &str, model: Option<&str>) -> Self {
        let model = model
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(UNKNOWN_MODEL);
        Self(format!("{}-{}", host.trim(), model))
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a scheduled task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Allocate a fresh task ID
    pub fn generate() -> Self {
        Self(format!("task_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of an interactive shell session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShellSessionId(pub String);

impl ShellSessionId {
    /// Allocate a fresh shell session ID (`shell_<millis>_<8 hex>`)
    pub fn generate() -> Self {
        Self(format!(
            "shell_{}_{}",
            crate::time::current_time_millis(),
            random_suffix()
        ))
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShellSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ShellSessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Dispatch target: one device, or every online device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// Fan out to every online device
    All,
    /// A single device
    Device(DeviceId),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::All => write!(f, "{}", ALL_DEVICES),
            Target::Device(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for Target {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case(ALL_DEVICES) {
            Ok(Target::All)
        } else {
            Ok(Target::Device(DeviceId::new(s)))
        }
    }
}

impl From<&str> for Target {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(target) => target,
            Err(never) => match never {},
        }
    }
}

impl From<DeviceId> for Target {
    fn from(id: DeviceId) -> Self {
        Target::Device(id)
    }
}

impl Serialize for Target {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Target {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Target::from(s.as_str()))
    }
}

/// Reachability of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// A live transport handle exists
    Online,
    /// Disconnected; record retained for history
    Offline,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Online => write!(f, "online"),
            DeviceStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Filter for listing device sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFilter {
    /// Only online sessions
    Online,
    /// Only offline sessions
    Offline,
    /// Everything
    #[default]
    All,
}

impl StatusFilter {
    /// Whether a session with `status` passes this filter
    pub fn matches(&self, status: DeviceStatus) -> bool {
        match self {
            StatusFilter::Online => status == DeviceStatus::Online,
            StatusFilter::Offline => status == DeviceStatus::Offline,
            StatusFilter::All => true,
        }
    }
}

/// Security event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational
    Info,
    /// Suspicious, persisted
    Warning,
    /// Dangerous, persisted
    Critical,
}

impl Severity {
    /// Whether events of this severity go to durable storage
    pub fn is_persisted(&self) -> bool {
        matches!(self, Severity::Warning | Severity::Critical)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Why a shell session left the `Active` state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Closed by the operator
    Manual,
    /// Inactivity timeout elapsed
    Timeout,
    /// Fatal error
    Error,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Manual => write!(f, "manual"),
            CloseReason::Timeout => write!(f, "timeout"),
            CloseReason::Error => write!(f, "error"),
        }
    }
}

/// Lifecycle state of a shell session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ShellState {
    /// Accepting commands
    Active,
    /// Terminal
    Closed(CloseReason),
}

impl ShellState {
    /// Whether the session accepts commands
    pub fn is_active(&self) -> bool {
        matches!(self, ShellState::Active)
    }
}
