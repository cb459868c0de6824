//! Agent transport listener
//!
//! Accepts incoming agent connections and spawns a handler for each one.
//! Connections from blocked addresses are dropped at accept.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::server::handler::AgentConnection;
use crate::state::ControlState;

/// Listener for agent connections
pub struct AgentServer {
    /// Shared control-plane state
    state: Arc<ControlState>,
    /// Cancellation token for graceful shutdown
    cancel: CancellationToken,
}

impl AgentServer {
    /// Create a new agent server
    pub fn new(state: Arc<ControlState>, cancel: CancellationToken) -> Self {
        Self { state, cancel }
    }

    /// Bind `bind_addr` and serve until cancelled
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("Agent server listening on {}", local_addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Agent server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                        Err(e) => tracing::error!("Failed to accept agent connection: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        if self.state.security.is_blocked(&peer_addr.ip()) {
            tracing::warn!("Rejected agent connection from blocked address {}", peer_addr);
            return;
        }
        tracing::info!("New agent connection from {}", peer_addr);

        let connection = AgentConnection::new(
            Arc::clone(&self.state),
            peer_addr,
            self.cancel.child_token(),
        );

        tokio::spawn(async move {
            match connection.run(socket).await {
                Ok(()) => tracing::info!("Agent connection from {} closed", peer_addr),
                Err(e) => {
                    tracing::warn!("Agent connection from {} closed with error: {:#}", peer_addr, e)
                }
            }
        });
    }
}
