//! IPC server implementation
//!
//! Listens on localhost TCP for JSON-line requests from operator clients.
//! Every response is one line; lifecycle notifications are interleaved as
//! event lines once the client is authenticated.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use fc_core::auth::check_token;
use fc_core::error::{DispatchError, SchedulerError, ShellError};
use fc_core::ipc::{FleetEvent, IpcErrorKind, IpcMessage, IpcRequest, IpcResponse};
use fc_core::types::CloseReason;

use crate::shell::ShellOptions;
use crate::state::ControlState;

/// Report window used when a client does not give one
const DEFAULT_REPORT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Command log entries returned when a client does not give a limit
const DEFAULT_HISTORY_LIMIT: usize = 50;

/// IPC server for operator clients
///
/// Listens on localhost (127.0.0.1) only - not accessible from network.
pub struct IpcServer {
    /// Address to bind (127.0.0.1:port)
    pub address: String,
    /// Control-plane state
    state: Arc<ControlState>,
    /// Cancellation token for shutdown
    shutdown_token: Option<CancellationToken>,
}

impl IpcServer {
    /// Create a new IPC server
    pub fn new(address: String, state: Arc<ControlState>) -> Self {
        Self {
            address,
            state,
            shutdown_token: None,
        }
    }

    /// Set the shutdown token (call before run)
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown_token = Some(token);
        self
    }

    /// Bind and serve until shut down
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.address)
            .await
            .with_context(|| format!("Failed to bind IPC server to {}", self.address))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shut down
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("IPC server listening on {}", listener.local_addr()?);
        let shutdown = self.shutdown_token.clone().unwrap_or_default();

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("IPC server shutting down");
                    return Ok(());
                }
                result = listener.accept() => match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::error!("Failed to accept IPC connection: {}", e);
                        continue;
                    }
                }
            };

            // Only accept connections from localhost
            if !peer_addr.ip().is_loopback() {
                tracing::warn!("Rejected non-localhost connection from {}", peer_addr);
                continue;
            }
            if self.state.security.is_blocked(&peer_addr.ip()) {
                tracing::warn!("Rejected IPC connection from blocked address {}", peer_addr);
                continue;
            }

            let state = Arc::clone(&self.state);
            let shutdown_token = self.shutdown_token.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_client(stream, peer_addr, state, shutdown_token).await {
                    tracing::warn!("IPC client error: {}", e);
                }
            });
        }
    }
}

/// State for a single IPC client connection
struct ClientState {
    peer_addr: SocketAddr,
    authenticated: bool,
}

impl ClientState {
    fn new(peer_addr: SocketAddr, token_required: bool) -> Self {
        Self {
            peer_addr,
            authenticated: !token_required,
        }
    }

    /// Check if this client should receive events
    fn should_receive_event(&self, _event: &FleetEvent) -> bool {
        self.authenticated
    }
}

async fn handle_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ControlState>,
    shutdown_token: Option<CancellationToken>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut client_state = ClientState::new(peer_addr, state.config.ipc_token.is_some());

    let mut event_rx = state.subscribe();

    loop {
        tokio::select! {
            result = reader.read_line(&mut line) => {
                match result {
                    Ok(0) => break,
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            line.clear();
                            continue;
                        }

                        let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                            Ok(request) => handle_request_with_state(
                                request,
                                &state,
                                &mut client_state,
                                shutdown_token.as_ref(),
                            ).await,
                            Err(e) => IpcResponse::error(
                                IpcErrorKind::InvalidRequest,
                                format!("Invalid request: {}", e),
                            ),
                        };

                        let mut response_json = IpcMessage::from(response).to_line()?;
                        response_json.push('\n');
                        writer.write_all(response_json.as_bytes()).await?;

                        line.clear();
                    }
                    Err(e) => {
                        return Err(e.into());
                    }
                }
            }

            result = event_rx.recv() => {
                match result {
                    Ok(event) => {
                        if client_state.should_receive_event(&event) {
                            let mut event_json = IpcMessage::from(event).to_line()?;
                            event_json.push('\n');
                            writer.write_all(event_json.as_bytes()).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("IPC client lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

async fn handle_request_with_state(
    request: IpcRequest,
    state: &ControlState,
    client_state: &mut ClientState,
    shutdown_token: Option<&CancellationToken>,
) -> IpcResponse {
    match &request {
        IpcRequest::Authenticate { token } => {
            let expected = state.config.ipc_token.as_deref();
            if check_token(Some(token.as_str()), expected) {
                client_state.authenticated = true;
                state.security.reset_failed_attempts(&client_state.peer_addr.ip());
                tracing::debug!("IPC client {} authenticated", client_state.peer_addr);
                return IpcResponse::Authenticated;
            }
            let outcome = state
                .security
                .record_failed_attempt(client_state.peer_addr.ip());
            return IpcResponse::error(
                IpcErrorKind::Unauthorized,
                format!("Invalid token ({} failed attempts)", outcome.attempts),
            );
        }
        IpcRequest::Ping => return IpcResponse::Pong,
        _ => {}
    }

    if !client_state.authenticated {
        return IpcResponse::error(IpcErrorKind::Unauthorized, "Authenticate first");
    }

    handle_request(request, state, shutdown_token).await
}

async fn handle_request(
    request: IpcRequest,
    state: &ControlState,
    shutdown_token: Option<&CancellationToken>,
) -> IpcResponse {
    match request {
        IpcRequest::GetStatus => IpcResponse::Status(state.status()),

        IpcRequest::ListDevices { filter } => IpcResponse::Devices {
            devices: state.registry.list(filter),
        },

        IpcRequest::GetDevice { device_id } => match state.registry.get(&device_id) {
            Ok(device) => IpcResponse::Device(device),
            Err(e) => IpcResponse::error(IpcErrorKind::NotFound, e.to_string()),
        },

        IpcRequest::SendCommand {
            target,
            command,
            extras,
        } => match state.dispatcher.send(&target, &command, &extras) {
            Ok(report) => IpcResponse::Dispatched(report),
            Err(e @ DispatchError::DeviceOffline(_)) => {
                IpcResponse::error(IpcErrorKind::DeviceOffline, e.to_string())
            }
        },

        IpcRequest::GetCommandHistory { limit } => IpcResponse::CommandHistory {
            entries: state
                .command_log
                .recent(limit.unwrap_or(DEFAULT_HISTORY_LIMIT)),
        },

        IpcRequest::ListTasks => IpcResponse::Tasks {
            tasks: state.scheduler.list(),
        },

        IpcRequest::GetTask { task_id } => task_response(state.scheduler.get(&task_id)),

        IpcRequest::CreateTask {
            name,
            command,
            interval_minutes,
            target,
        } => task_response(
            state
                .scheduler
                .create(&name, &command, interval_minutes, target),
        ),

        IpcRequest::UpdateTask { task_id, update } => {
            task_response(state.scheduler.update(&task_id, update))
        }

        IpcRequest::DeleteTask { task_id } => match state.scheduler.delete(&task_id) {
            Ok(_) => IpcResponse::Ok,
            Err(e) => scheduler_error(e),
        },

        IpcRequest::ToggleTask { task_id } => task_response(state.scheduler.toggle(&task_id)),

        IpcRequest::RunTask { task_id } => task_response(state.scheduler.run_now(&task_id)),

        IpcRequest::GetTaskStats => IpcResponse::TaskStats(state.scheduler.stats()),

        IpcRequest::CreateShellSession {
            device_id,
            operator_id,
            working_directory,
            environment,
        } => {
            let options = ShellOptions {
                working_directory,
                environment,
                ..ShellOptions::default()
            };
            match state.shell.create(device_id, &operator_id, options) {
                Ok(session) => IpcResponse::ShellSession(session),
                Err(e) => shell_error(e),
            }
        }

        IpcRequest::Execute {
            session_id,
            command,
        } => match state.shell.execute(&session_id, &command).await {
            Ok(output) => IpcResponse::ShellOutput(output),
            Err(e) => shell_error(e),
        },

        IpcRequest::GetShellHistory { session_id, limit } => {
            match state.shell.history(&session_id, limit) {
                Ok(entries) => IpcResponse::ShellHistory { entries },
                Err(e) => shell_error(e),
            }
        }

        IpcRequest::ChangeDirectory {
            session_id,
            directory,
        } => ok_or_shell_error(state.shell.change_directory(&session_id, &directory)),

        IpcRequest::SetEnv {
            session_id,
            key,
            value,
        } => ok_or_shell_error(state.shell.set_env(&session_id, &key, &value)),

        IpcRequest::CloseShellSession { session_id } => {
            match state.shell.close(&session_id, CloseReason::Manual) {
                Ok(_) => match state.shell.get(&session_id) {
                    Ok(session) => IpcResponse::ShellSession(session),
                    Err(_) => IpcResponse::Ok,
                },
                Err(e) => shell_error(e),
            }
        }

        IpcRequest::GetShellSession { session_id } => match state.shell.get(&session_id) {
            Ok(session) => IpcResponse::ShellSession(session),
            Err(e) => shell_error(e),
        },

        IpcRequest::ListShellSessions => IpcResponse::ShellSessions {
            sessions: state.shell.active_sessions(),
        },

        IpcRequest::GetShellStats => IpcResponse::ShellStats(state.shell.stats()),

        IpcRequest::IsBlocked { address } => IpcResponse::BlockState {
            address,
            blocked: state.security.is_blocked(&address),
        },

        IpcRequest::RecordFailedAttempt { address } => {
            let outcome = state.security.record_failed_attempt(address);
            IpcResponse::BlockState {
                address,
                blocked: outcome.blocked,
            }
        }

        IpcRequest::BlockAddress { address, reason } => {
            state.security.block(address, &reason);
            IpcResponse::BlockState {
                address,
                blocked: true,
            }
        }

        IpcRequest::UnblockAddress { address } => {
            state.security.unblock(&address);
            IpcResponse::BlockState {
                address,
                blocked: false,
            }
        }

        IpcRequest::GetSecurityReport { window_secs } => {
            let window = window_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REPORT_WINDOW);
            IpcResponse::SecurityReport(state.security.report(window))
        }

        IpcRequest::GetSecurityStats => IpcResponse::SecurityStats(state.security.stats()),

        IpcRequest::Shutdown => {
            tracing::info!("Shutdown requested via IPC");
            if let Some(token) = shutdown_token {
                token.cancel();
                IpcResponse::Ok
            } else {
                IpcResponse::error(
                    IpcErrorKind::Unavailable,
                    "Shutdown not supported (no shutdown token configured)",
                )
            }
        }

        // Answered before authentication is checked
        IpcRequest::Authenticate { .. } => IpcResponse::Authenticated,
        IpcRequest::Ping => IpcResponse::Pong,
    }
}

fn task_response(result: Result<fc_core::records::ScheduledTask, SchedulerError>) -> IpcResponse {
    match result {
        Ok(task) => IpcResponse::Task(task),
        Err(e) => scheduler_error(e),
    }
}

fn scheduler_error(e: SchedulerError) -> IpcResponse {
    let kind = match e {
        SchedulerError::TaskNotFound(_) => IpcErrorKind::NotFound,
        SchedulerError::InvalidInterval(_) => IpcErrorKind::InvalidInterval,
        SchedulerError::ShutDown => IpcErrorKind::Unavailable,
    };
    IpcResponse::error(kind, e.to_string())
}

fn ok_or_shell_error(result: Result<(), ShellError>) -> IpcResponse {
    match result {
        Ok(()) => IpcResponse::Ok,
        Err(e) => shell_error(e),
    }
}

fn shell_error(e: ShellError) -> IpcResponse {
    let kind = match e {
        ShellError::SessionNotFound(_) => IpcErrorKind::NotFound,
        ShellError::SessionInactive(_) => IpcErrorKind::SessionInactive,
        ShellError::CommandBlocked(_) => IpcErrorKind::CommandBlocked,
        ShellError::ProcessTimeout { .. } => IpcErrorKind::ProcessTimeout,
        ShellError::BufferExceeded { .. } => IpcErrorKind::BufferExceeded,
        ShellError::Execution(_) => IpcErrorKind::Internal,
        ShellError::DeviceOffline(_) => IpcErrorKind::DeviceOffline,
        ShellError::ShutDown => IpcErrorKind::Unavailable,
    };
    IpcResponse::Error {
        kind,
        message: e.to_string(),
        partial_output: e.partial_output().cloned(),
    }
}
