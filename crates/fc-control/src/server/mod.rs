//! Agent transport
//!
//! TCP listener speaking the `fc-protocol` frame format. Each accepted
//! connection gets its own task that registers the agent, relays pushed
//! commands and feeds heartbeats and responses into the registry.

mod handler;
mod listener;

pub use handler::{AgentConnection, COMMAND_QUEUE_CAPACITY, REGISTER_TIMEOUT};
pub use listener::AgentServer;
