//! A single interactive shell session

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use fc_core::error::ShellError;
use fc_core::records::{HistoryEntry, SessionSummary, ShellOutputEntry, ShellSessionInfo};
use fc_core::time::{self, Timestamp};
use fc_core::timer::TimerHandle;
use fc_core::traits::ExecRequest;
use fc_core::types::{CloseReason, DeviceId, ShellSessionId, ShellState};
use fc_core::RingBuffer;

struct SessionState {
    state: ShellState,
    last_activity: Timestamp,
    last_activity_at: Instant,
    end_time: Option<Timestamp>,
    working_directory: String,
    environment: HashMap<String, String>,
    command_count: u64,
    outputs: RingBuffer<ShellOutputEntry>,
    watchdog: Option<TimerHandle>,
    reclaim: Option<TimerHandle>,
}

/// Operator session bound to one device.
///
/// All mutable state sits behind one short-lived lock. `exec_lock` orders
/// command executions on the session and is held across the process run,
/// never the state lock.
pub struct ShellSession {
    id: ShellSessionId,
    device_id: DeviceId,
    operator_id: String,
    start_time: Timestamp,
    inactivity_timeout: Duration,
    inner: Mutex<SessionState>,
    exec_lock: tokio::sync::Mutex<()>,
}

impl ShellSession {
    pub(crate) fn new(
        device_id: DeviceId,
        operator_id: String,
        working_directory: String,
        environment: HashMap<String, String>,
        output_capacity: usize,
        inactivity_timeout: Duration,
    ) -> Self {
        let now = time::now();
        Self {
            id: ShellSessionId::generate(),
            device_id,
            operator_id,
            start_time: now,
            inactivity_timeout,
            inner: Mutex::new(SessionState {
                state: ShellState::Active,
                last_activity: now,
                last_activity_at: Instant::now(),
                end_time: None,
                working_directory,
                environment,
                command_count: 0,
                outputs: RingBuffer::new(output_capacity),
                watchdog: None,
                reclaim: None,
            }),
            exec_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &ShellSessionId {
        &self.id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn state(&self) -> ShellState {
        self.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Current inactivity deadline, `None` once closed
    pub(crate) fn deadline(&self) -> Option<Instant> {
        let inner = self.lock();
        inner
            .state
            .is_active()
            .then(|| inner.last_activity_at + self.inactivity_timeout)
    }

    pub(crate) fn set_watchdog(&self, timer: TimerHandle) {
        self.lock().watchdog = Some(timer);
    }

    pub(crate) fn set_reclaim(&self, timer: TimerHandle) {
        self.lock().reclaim = Some(timer);
    }

    pub(crate) async fn exec_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.exec_lock.lock().await
    }

    fn touch(inner: &mut SessionState) {
        inner.last_activity = time::now();
        inner.last_activity_at = Instant::now();
    }

    /// Count an attempted command and build the request for it.
    ///
    /// The counter moves before any policy check, so blocked commands are
    /// counted too.
    pub(crate) fn begin_command(
        &self,
        command: &str,
        timeout: Duration,
        max_output_bytes: usize,
    ) -> Result<ExecRequest, ShellError> {
        let mut inner = self.lock();
        if !inner.state.is_active() {
            return Err(ShellError::SessionInactive(self.id.clone()));
        }
        Self::touch(&mut inner);
        inner.command_count += 1;

        Ok(ExecRequest {
            command: command.to_string(),
            working_directory: inner.working_directory.clone(),
            env: inner.environment.clone(),
            timeout,
            max_output_bytes,
        })
    }

    /// Append a finished run to the output ring
    pub(crate) fn record_output(&self, entry: ShellOutputEntry) {
        let mut inner = self.lock();
        Self::touch(&mut inner);
        inner.outputs.push(entry);
    }

    pub(crate) fn change_directory(&self, directory: &str) -> Result<(), ShellError> {
        let mut inner = self.lock();
        if !inner.state.is_active() {
            return Err(ShellError::SessionInactive(self.id.clone()));
        }
        Self::touch(&mut inner);
        inner.working_directory = directory.to_string();
        Ok(())
    }

    pub(crate) fn set_env(&self, key: &str, value: &str) -> Result<(), ShellError> {
        let mut inner = self.lock();
        if !inner.state.is_active() {
            return Err(ShellError::SessionInactive(self.id.clone()));
        }
        Self::touch(&mut inner);
        inner.environment.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Leave the active state.
    ///
    /// Returns the close summary on the first call and `None` afterwards.
    pub(crate) fn close(&self, reason: CloseReason) -> Option<SessionSummary> {
        let mut inner = self.lock();
        if !inner.state.is_active() {
            return None;
        }

        let end = time::now();
        inner.state = ShellState::Closed(reason);
        inner.end_time = Some(end);
        // Dropping the handle cancels the watchdog
        inner.watchdog = None;

        let duration_ms = (end - self.start_time).num_milliseconds().max(0) as u64;
        Some(SessionSummary {
            session_id: self.id.clone(),
            device_id: self.device_id.clone(),
            operator_id: self.operator_id.clone(),
            start_time: self.start_time,
            end_time: end,
            duration_ms,
            command_count: inner.command_count,
            close_reason: reason,
        })
    }

    /// The newest `limit` runs, oldest first, with truncated output
    pub fn history(&self, limit: usize) -> Vec<HistoryEntry> {
        self.lock()
            .outputs
            .recent(limit)
            .iter()
            .map(HistoryEntry::from)
            .collect()
    }

    pub fn command_count(&self) -> u64 {
        self.lock().command_count
    }

    pub fn info(&self) -> ShellSessionInfo {
        let inner = self.lock();
        ShellSessionInfo {
            id: self.id.clone(),
            device_id: self.device_id.clone(),
            operator_id: self.operator_id.clone(),
            start_time: self.start_time,
            last_activity: inner.last_activity,
            state: inner.state,
            working_directory: inner.working_directory.clone(),
            environment: inner.environment.clone(),
            command_count: inner.command_count,
            buffered_outputs: inner.outputs.len(),
        }
    }
}
