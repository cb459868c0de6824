//! Per-connection agent handler
//!
//! The first frame on a connection must be `Register`. When an agent token
//! is configured, a missing or wrong token counts as a failed attempt for
//! the peer address and the connection is refused. After registration the
//! handler owns the sending half of the device's command queue; the
//! registry only holds a weak reference to it, so the device is online
//! exactly as long as this handler runs.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use fc_core::auth::check_token;
use fc_core::types::DeviceId;
use fc_protocol::{ErrorCode, Frame, FrameCodec, Message, Sequence};

use crate::registry::{AgentCommand, DeviceMetadata};
use crate::state::ControlState;

/// How long a new connection may take to send `Register`
pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Commands buffered per agent before pushes fail with `Full`
pub const COMMAND_QUEUE_CAPACITY: usize = 256;

type AgentStream = Framed<TcpStream, FrameCodec>;

/// Handler for a single agent connection
pub struct AgentConnection {
    state: Arc<ControlState>,
    peer_addr: SocketAddr,
    cancel: CancellationToken,
}

impl AgentConnection {
    pub fn new(state: Arc<ControlState>, peer_addr: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            state,
            peer_addr,
            cancel,
        }
    }

    /// Register the agent and serve it until either side hangs up
    pub async fn run(self, socket: TcpStream) -> Result<()> {
        let mut framed = Framed::new(socket, FrameCodec::new());

        let first = tokio::time::timeout(REGISTER_TIMEOUT, framed.next())
            .await
            .context("Timed out waiting for registration")?;
        let frame = match first {
            Some(frame) => frame.context("Failed to decode registration frame")?,
            None => {
                tracing::debug!("{} disconnected before registering", self.peer_addr);
                return Ok(());
            }
        };

        let Message::Register {
            host,
            model,
            address,
            token,
            version,
        } = frame.message
        else {
            send_error(&mut framed, ErrorCode::InvalidMessage, "expected Register").await;
            bail!("First frame from {} was not Register", self.peer_addr);
        };

        let security = &self.state.security;
        let ip = self.peer_addr.ip();
        if !check_token(token.as_deref(), self.state.config.agent_token.as_deref()) {
            let outcome = security.record_failed_attempt(ip);
            framed
                .send(Frame::control(Message::RegisterAck {
                    accepted: false,
                    reason: Some("authentication failed".to_string()),
                }))
                .await
                .ok();
            bail!(
                "Agent {} failed authentication ({} attempts{})",
                self.peer_addr,
                outcome.attempts,
                if outcome.blocked { ", now blocked" } else { "" }
            );
        }
        security.reset_failed_attempts(&ip);

        let (tx, mut rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let registration = self.state.registry.register(
            DeviceMetadata {
                host,
                model,
                address: address.or_else(|| Some(self.peer_addr.to_string())),
            },
            &tx,
        );
        tracing::debug!(
            "Agent {} registered as {} (protocol {})",
            self.peer_addr,
            registration.device_id,
            version.as_deref().unwrap_or("unknown")
        );

        let result = match framed
            .send(Frame::control(Message::RegisterAck {
                accepted: true,
                reason: None,
            }))
            .await
        {
            Ok(()) => {
                self.serve(&mut framed, &registration.device_id, &mut rx)
                    .await
            }
            Err(e) => Err(e.into()),
        };

        self.state
            .registry
            .disconnect(&registration.device_id, registration.epoch);
        drop(tx);
        result
    }

    async fn serve(
        &self,
        framed: &mut AgentStream,
        device_id: &DeviceId,
        rx: &mut mpsc::Receiver<AgentCommand>,
    ) -> Result<()> {
        let mut sequence = Sequence::CONTROL;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!("Connection handler for {} cancelled", device_id);
                    return Ok(());
                }

                Some(command) = rx.recv() => {
                    sequence = sequence.next();
                    tracing::debug!("Pushing '{}' to {} ({})", command.request, device_id, sequence);
                    framed
                        .send(Frame::new(sequence, command.into_message()))
                        .await
                        .with_context(|| format!("Failed to push command to {}", device_id))?;
                }

                frame = framed.next() => match frame {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e).context("Failed to decode agent frame"),
                    Some(Ok(frame)) => self.handle_frame(framed, device_id, frame).await?,
                }
            }
        }
    }

    async fn handle_frame(
        &self,
        framed: &mut AgentStream,
        device_id: &DeviceId,
        frame: Frame,
    ) -> Result<()> {
        let registry = &self.state.registry;
        match frame.message {
            Message::Heartbeat { timestamp } => {
                registry.heartbeat(device_id);
                framed
                    .send(Frame::control(Message::HeartbeatAck { timestamp }))
                    .await?;
            }
            Message::Response { kind, payload } => {
                tracing::trace!("{} answered {} with '{}'", device_id, frame.sequence, kind);
                registry.record_response(device_id, kind, payload.to_vec());
            }
            Message::Error { code, message } => {
                tracing::warn!("Agent {} reported error {:?}: {}", device_id, code, message);
            }
            Message::Register { .. } => {
                tracing::warn!("Ignoring repeated Register from {}", device_id);
            }
            other => {
                tracing::debug!(
                    "Ignoring unexpected {:?} frame from {}",
                    other.message_type(),
                    device_id
                );
            }
        }
        Ok(())
    }
}

async fn send_error(framed: &mut AgentStream, code: ErrorCode, message: &str) {
    let frame = Frame::control(Message::Error {
        code,
        message: message.to_string(),
    });
    if let Err(e) = framed.send(frame).await {
        tracing::debug!("Failed to send error frame: {}", e);
    }
}
