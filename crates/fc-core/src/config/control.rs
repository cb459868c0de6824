//! Control-plane daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Configuration for the control-plane daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Address the agent transport listens on
    pub agent_bind_address: String,

    /// IPC port for operator clients (localhost only)
    pub ipc_port: u16,

    /// Directory holding tasks, logs and session summaries
    pub data_dir: PathBuf,

    /// Shared secret agents present on registration (`None` accepts any agent)
    pub agent_token: Option<String>,

    /// Shared secret operator clients present on IPC requests (`None` disables auth)
    pub ipc_token: Option<String>,

    /// How often the status report is broadcast
    #[serde(with = "duration_secs")]
    pub report_interval: Duration,

    /// Security gate settings
    pub security: SecurityConfig,

    /// Shell gateway settings
    pub shell: ShellConfig,

    /// Dispatcher settings
    pub dispatch: DispatchConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            agent_bind_address: "0.0.0.0:7420".to_string(),
            ipc_port: 7421,
            data_dir: super::default_config_dir().join("data"),
            agent_token: None,
            ipc_token: None,
            report_interval: Duration::from_secs(6 * 60 * 60),
            security: SecurityConfig::default(),
            shell: ShellConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl ControlConfig {
    /// Get the IPC address (localhost:port)
    pub fn ipc_address(&self) -> String {
        format!("127.0.0.1:{}", self.ipc_port)
    }

    /// Reject values the components cannot run with
    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        use crate::error::ConfigError;

        if self.security.max_failed_attempts == 0 {
            return Err(ConfigError::Invalid(
                "security.max_failed_attempts must be at least 1".into(),
            ));
        }
        if self.shell.exec_timeout.is_zero() {
            return Err(ConfigError::Invalid("shell.exec_timeout must be positive".into()));
        }
        if self.shell.inactivity_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "shell.inactivity_timeout must be positive".into(),
            ));
        }
        if self.report_interval.is_zero() {
            return Err(ConfigError::Invalid("report_interval must be positive".into()));
        }
        Ok(())
    }
}

/// Security gate thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Failed attempts from one address before it is blocked
    pub max_failed_attempts: u32,

    /// A failure counter resets after this long without further failures
    #[serde(with = "duration_secs")]
    pub failed_attempt_window: Duration,

    /// How long a blocked address stays blocked
    #[serde(with = "duration_secs")]
    pub block_duration: Duration,

    /// Security events kept in memory
    pub event_capacity: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: 5,
            failed_attempt_window: Duration::from_secs(15 * 60),
            block_duration: Duration::from_secs(30 * 60),
            event_capacity: 1000,
        }
    }
}

/// Shell gateway limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Idle time before a session is closed
    #[serde(with = "duration_secs")]
    pub inactivity_timeout: Duration,

    /// How long a closed session stays queryable
    #[serde(with = "duration_secs")]
    pub grace_period: Duration,

    /// Executed commands kept per session
    pub output_capacity: usize,

    /// Per-command execution timeout
    #[serde(with = "duration_secs")]
    pub exec_timeout: Duration,

    /// Output cap per command
    pub max_output_bytes: usize,

    /// Longest command text accepted
    pub max_command_length: usize,

    /// Working directory of new sessions
    pub default_working_directory: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(30 * 60),
            grace_period: Duration::from_secs(5 * 60),
            output_capacity: 1000,
            exec_timeout: Duration::from_secs(30),
            max_output_bytes: 1024 * 1024,
            max_command_length: 1000,
            default_working_directory: "/".to_string(),
        }
    }
}

/// Dispatcher settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Command log entries kept in memory
    pub history_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControlConfig::default();
        assert_eq!(config.security.max_failed_attempts, 5);
        assert_eq!(config.security.block_duration, Duration::from_secs(1800));
        assert_eq!(config.shell.max_output_bytes, 1024 * 1024);
        assert_eq!(config.dispatch.history_capacity, 1000);
        assert_eq!(config.ipc_address(), "127.0.0.1:7421");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ControlConfig = toml::from_str(
            r#"
            ipc_port = 9000

            [shell]
            exec_timeout = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.ipc_port, 9000);
        assert_eq!(config.shell.exec_timeout, Duration::from_secs(5));
        assert_eq!(config.shell.inactivity_timeout, Duration::from_secs(1800));
        assert_eq!(config.security, SecurityConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = ControlConfig::default();
        config.security.max_failed_attempts = 0;
        assert!(config.validate().is_err());
    }
}
