//! Shell session gateway
//!
//! Stateful command sessions bound to an online device. Each session is
//! `Active` until it is closed by the operator, by its inactivity watchdog,
//! or by a fatal error; `Closed` is terminal. A closed session stays
//! queryable for a grace period and is then reclaimed.
//!
//! Every command is checked by the [`SecurityGate`] before the
//! [`ProcessExecutor`] sees it. Execution runs outside every registry and
//! session-state lock; commands on one session are serialized by the
//! session's own execution lock.

mod executor;
mod session;

pub use executor::LocalExecutor;
pub use session::ShellSession;

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use fc_core::config::ShellConfig;
use fc_core::error::ShellError;
use fc_core::ipc::FleetEvent;
use fc_core::records::{
    AuditLine, CommandLogEntry, CommandOrigin, HistoryEntry, ShellOutputEntry, ShellSessionInfo,
    ShellStats,
};
use fc_core::time;
use fc_core::timer::{self as timers, TimerHandle};
use fc_core::traits::{ExecOutput, ExecTermination, ProcessExecutor, SummaryStore};
use fc_core::types::{CloseReason, DeviceId, Severity, ShellSessionId};

use crate::dispatch::CommandLog;
use crate::events::{self, EventSender};
use crate::registry::DeviceRegistry;
use crate::security::{CommandVerdict, SecurityGate};

/// History entries returned when no limit is given
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Per-session overrides of the gateway defaults
#[derive(Debug, Clone, Default)]
pub struct ShellOptions {
    /// Starting directory, `default_working_directory` when `None`
    pub working_directory: Option<String>,
    /// Environment overrides passed to every command
    pub environment: HashMap<String, String>,
    /// Idle time before the watchdog closes the session
    pub inactivity_timeout: Option<Duration>,
    /// Executed commands kept in the session history
    pub output_capacity: Option<usize>,
}

/// Registry of shell sessions
pub struct ShellGateway {
    config: ShellConfig,
    sessions: DashMap<ShellSessionId, Arc<ShellSession>>,
    registry: Arc<DeviceRegistry>,
    security: Arc<SecurityGate>,
    command_log: Arc<CommandLog>,
    executor: Arc<dyn ProcessExecutor>,
    summaries: Arc<dyn SummaryStore>,
    events: EventSender,
    shutdown: CancellationToken,
    closed: AtomicBool,
    total_commands: AtomicU64,
    self_ref: Weak<ShellGateway>,
}

/// Collaborators of a [`ShellGateway`]
pub struct ShellDeps {
    /// Device sessions; a shell can only open on an online device
    pub registry: Arc<DeviceRegistry>,
    /// Command policy and security event log
    pub security: Arc<SecurityGate>,
    /// Shared command log and audit trail
    pub command_log: Arc<CommandLog>,
    /// Runs the commands that pass the policy
    pub executor: Arc<dyn ProcessExecutor>,
    /// Close summaries
    pub summaries: Arc<dyn SummaryStore>,
    /// Lifecycle notifications
    pub events: EventSender,
}

/// Whether an executor failure ends the session.
///
/// A missing or unrunnable program is the command's fault; anything else
/// means the execution environment itself is broken.
fn is_fatal(error: &io::Error) -> bool {
    !matches!(
        error.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput
    )
}

impl ShellGateway {
    /// Create a gateway. Watchdog and reclaim timers are children of `shutdown`.
    pub fn new(config: ShellConfig, deps: ShellDeps, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            sessions: DashMap::new(),
            registry: deps.registry,
            security: deps.security,
            command_log: deps.command_log,
            executor: deps.executor,
            summaries: deps.summaries,
            events: deps.events,
            shutdown,
            closed: AtomicBool::new(false),
            total_commands: AtomicU64::new(0),
            self_ref: self_ref.clone(),
        })
    }

    /// Open a session on an online device and arm its inactivity watchdog
    pub fn create(
        &self,
        device_id: DeviceId,
        operator_id: &str,
        options: ShellOptions,
    ) -> Result<ShellSessionInfo, ShellError> {
        self.ensure_running()?;
        if !self.registry.is_online(&device_id) {
            return Err(ShellError::DeviceOffline(device_id));
        }

        let session = Arc::new(ShellSession::new(
            device_id,
            operator_id.to_string(),
            options
                .working_directory
                .unwrap_or_else(|| self.config.default_working_directory.clone()),
            options.environment,
            options.output_capacity.unwrap_or(self.config.output_capacity),
            options
                .inactivity_timeout
                .unwrap_or(self.config.inactivity_timeout),
        ));
        session.set_watchdog(self.spawn_watchdog(&session));
        self.sessions.insert(session.id().clone(), Arc::clone(&session));

        self.audit(
            session.id(),
            "SESSION_CREATED",
            format!("Shell session created for device {}", session.device_id()),
        );
        tracing::info!(
            "Shell session {} created for device {} by {}",
            session.id(),
            session.device_id(),
            operator_id
        );
        Ok(session.info())
    }

    /// Run one command in a session.
    ///
    /// The session's command counter and activity stamp move before the
    /// security check. A blocked command never reaches the executor. A
    /// timeout or output overflow is returned as an error carrying the
    /// captured output, which is also kept in the session history.
    pub async fn execute(&self, id: &ShellSessionId, command: &str) -> Result<ExecOutput, ShellError> {
        self.ensure_running()?;
        let session = self
            .lookup(id)
            .ok_or_else(|| ShellError::SessionInactive(id.clone()))?;

        let _exec = session.exec_guard().await;
        let request =
            session.begin_command(command, self.config.exec_timeout, self.config.max_output_bytes)?;
        self.total_commands.fetch_add(1, Ordering::Relaxed);

        if let CommandVerdict::Blocked(reason) = self.security.check_command(command) {
            self.audit(id, "BLOCKED_COMMAND", format!("{} ({})", command, reason));
            self.security.log_event(
                "command_blocked",
                format!("Blocked command in shell session {}: {} ({})", id, command, reason),
                Severity::Warning,
            );
            return Err(ShellError::CommandBlocked(reason.to_string()));
        }

        self.command_log.record(CommandLogEntry::new(
            session.device_id().clone(),
            command,
            CommandOrigin::Shell(id.clone()),
        ));

        let output = match self.executor.execute(request).await {
            Ok(output) => output,
            Err(e) => {
                self.audit(id, "ERROR", format!("{} ({})", command, e));
                if is_fatal(&e) {
                    tracing::error!("Shell session {} failed to run '{}': {}", id, command, e);
                    self.close_session(&session, CloseReason::Error);
                } else {
                    tracing::warn!("Shell session {} failed to run '{}': {}", id, command, e);
                }
                return Err(ShellError::Execution(e.to_string()));
            }
        };

        let success = output.success();
        session.record_output(ShellOutputEntry {
            command: command.to_string(),
            timestamp: time::now(),
            result: output.clone(),
            success,
        });
        self.audit(
            id,
            "COMPLETED",
            format!("{} ({})", command, if success { "success" } else { "error" }),
        );

        match output.termination {
            ExecTermination::Exited => Ok(output),
            ExecTermination::TimedOut => Err(ShellError::ProcessTimeout {
                timeout_secs: self.config.exec_timeout.as_secs(),
                partial: output,
            }),
            ExecTermination::BufferExceeded => Err(ShellError::BufferExceeded {
                limit: self.config.max_output_bytes,
                partial: output,
            }),
        }
    }

    /// Close a session. Returns `false` if it was already closed.
    pub fn close(&self, id: &ShellSessionId, reason: CloseReason) -> Result<bool, ShellError> {
        let session = self
            .lookup(id)
            .ok_or_else(|| ShellError::SessionNotFound(id.clone()))?;
        Ok(self.close_session(&session, reason))
    }

    /// Newest runs of a session, oldest first
    pub fn history(
        &self,
        id: &ShellSessionId,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryEntry>, ShellError> {
        let session = self
            .lookup(id)
            .ok_or_else(|| ShellError::SessionNotFound(id.clone()))?;
        Ok(session.history(limit.unwrap_or(DEFAULT_HISTORY_LIMIT)))
    }

    pub fn change_directory(&self, id: &ShellSessionId, directory: &str) -> Result<(), ShellError> {
        let session = self
            .lookup(id)
            .ok_or_else(|| ShellError::SessionNotFound(id.clone()))?;
        session.change_directory(directory)?;
        self.audit(id, "CHANGE_DIR", directory);
        Ok(())
    }

    pub fn set_env(&self, id: &ShellSessionId, key: &str, value: &str) -> Result<(), ShellError> {
        let session = self
            .lookup(id)
            .ok_or_else(|| ShellError::SessionNotFound(id.clone()))?;
        session.set_env(key, value)?;
        self.audit(id, "SET_ENV", format!("{}={}", key, value));
        Ok(())
    }

    /// Snapshot of one retained session
    pub fn get(&self, id: &ShellSessionId) -> Result<ShellSessionInfo, ShellError> {
        self.lookup(id)
            .map(|s| s.info())
            .ok_or_else(|| ShellError::SessionNotFound(id.clone()))
    }

    /// Every retained session, oldest first
    pub fn list(&self) -> Vec<ShellSessionInfo> {
        let mut sessions: Vec<ShellSessionInfo> =
            self.sessions.iter().map(|s| s.value().info()).collect();
        sessions.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        sessions
    }

    /// Sessions still accepting commands
    pub fn active_sessions(&self) -> Vec<ShellSessionInfo> {
        self.list()
            .into_iter()
            .filter(|s| s.state.is_active())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.value().is_active()).count()
    }

    pub fn stats(&self) -> ShellStats {
        ShellStats {
            active_sessions: self.active_count(),
            retained_sessions: self.sessions.len(),
            total_commands: self.total_commands.load(Ordering::Relaxed),
        }
    }

    /// Close every active session and cancel all timers
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let sessions: Vec<Arc<ShellSession>> =
            self.sessions.iter().map(|s| Arc::clone(s.value())).collect();
        let closed = sessions
            .iter()
            .filter(|s| self.close_session(s, CloseReason::Manual))
            .count();
        self.shutdown.cancel();
        tracing::info!("Shell gateway shut down ({} sessions closed)", closed);
    }

    fn ensure_running(&self) -> Result<(), ShellError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ShellError::ShutDown);
        }
        Ok(())
    }

    fn lookup(&self, id: &ShellSessionId) -> Option<Arc<ShellSession>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    fn close_session(&self, session: &Arc<ShellSession>, reason: CloseReason) -> bool {
        let Some(summary) = session.close(reason) else {
            return false;
        };

        if let Err(e) = self.summaries.append(&summary) {
            tracing::warn!("Failed to persist shell session summary: {}", e);
        }
        self.audit(session.id(), "SESSION_CLOSED", format!("Session closed: {}", reason));
        tracing::info!("Shell session {} closed ({})", session.id(), reason);
        events::publish(
            &self.events,
            FleetEvent::ShellSessionClosed {
                session_id: session.id().clone(),
                reason,
            },
        );

        session.set_reclaim(self.spawn_reclaim(session.id().clone()));
        true
    }

    fn spawn_watchdog(&self, session: &Arc<ShellSession>) -> TimerHandle {
        let watched = Arc::downgrade(session);
        let expired = Arc::downgrade(session);
        let gateway = self.self_ref.clone();
        timers::spawn_deadline(
            &self.shutdown,
            move || watched.upgrade().and_then(|s| s.deadline()),
            move || {
                if let (Some(gateway), Some(session)) = (gateway.upgrade(), expired.upgrade()) {
                    gateway.close_session(&session, CloseReason::Timeout);
                }
            },
        )
    }

    fn spawn_reclaim(&self, id: ShellSessionId) -> TimerHandle {
        let gateway = self.self_ref.clone();
        timers::spawn_after(&self.shutdown, self.config.grace_period, move || {
            if let Some(gateway) = gateway.upgrade() {
                if gateway
                    .sessions
                    .remove_if(&id, |_, s| !s.is_active())
                    .is_some()
                {
                    tracing::debug!("Reclaimed shell session {}", id);
                }
            }
        })
    }

    fn audit(&self, id: &ShellSessionId, action: &str, detail: impl Into<String>) {
        self.command_log
            .audit(AuditLine::new(id.as_str(), action, detail));
    }
}
