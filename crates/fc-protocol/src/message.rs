//! Message types for the fleet-control agent protocol
//!
//! Messages are serialized into frames using the codec defined in `codec.rs`.
//!
//! # Message Flow
//!
//! 1. Agent connects and sends `Register` (identity metadata, optional token)
//! 2. Control plane responds with `RegisterAck`
//! 3. Agent sends `Heartbeat` periodically, control plane answers `HeartbeatAck`
//! 4. Control plane pushes `Command` frames, each with a fresh sequence number
//! 5. Agent sends `Response` frames, echoing the sequence of the command they answer
//!
//! Command delivery is fire-and-forget: there is no acknowledgement of a `Command`
//! beyond whatever `Response` the agent chooses to send.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Current protocol version string, sent in `Register`.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Registration message (agent -> control plane)
    Register = 0x01,
    /// Registration acknowledgment
    RegisterAck = 0x02,
    /// Command pushed to an agent
    Command = 0x03,
    /// Agent response to a command
    Response = 0x04,
    /// Heartbeat ping
    Heartbeat = 0x05,
    /// Heartbeat acknowledgment
    HeartbeatAck = 0x06,
    /// Error response
    Error = 0xFF,
}

impl MessageType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Register),
            0x02 => Some(Self::RegisterAck),
            0x03 => Some(Self::Command),
            0x04 => Some(Self::Response),
            0x05 => Some(Self::Heartbeat),
            0x06 => Some(Self::HeartbeatAck),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }
}

/// Error codes for error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    /// Unknown error
    Unknown = 0,
    /// Authentication failed
    AuthenticationFailed = 1,
    /// Source address is blocked
    AddressBlocked = 2,
    /// Invalid message
    InvalidMessage = 3,
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Agent registration.
    ///
    /// Sent by the agent immediately after connecting. The device identity is
    /// derived from `host` and `model`.
    Register {
        /// Host name the agent reports
        host: String,
        /// Device model (falls back to "unknown" when absent)
        model: Option<String>,
        /// Address the agent believes it is reachable at
        address: Option<String>,
        /// Shared agent token, if the control plane requires one
        token: Option<String>,
        /// Protocol version (e.g., "1.0")
        #[serde(default)]
        version: Option<String>,
    },

    /// Registration acknowledgment
    RegisterAck {
        /// Whether registration was accepted
        accepted: bool,
        /// Reason if not accepted
        reason: Option<String>,
    },

    /// Command pushed to the agent
    Command {
        /// Command name or text
        request: String,
        /// Extra arguments
        extras: Vec<String>,
    },

    /// Agent response
    Response {
        /// Response kind (e.g. "system_info")
        kind: String,
        /// Opaque payload
        payload: Bytes,
    },

    /// Heartbeat ping
    Heartbeat {
        /// Timestamp for latency measurement
        timestamp: u64,
    },

    /// Heartbeat acknowledgment
    HeartbeatAck {
        /// Echo of the original timestamp
        timestamp: u64,
    },

    /// Error response
    Error {
        /// Error code
        code: ErrorCode,
        /// Human-readable message
        message: String,
    },
}

impl Message {
    /// Get the message type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Register { .. } => MessageType::Register,
            Message::RegisterAck { .. } => MessageType::RegisterAck,
            Message::Command { .. } => MessageType::Command,
            Message::Response { .. } => MessageType::Response,
            Message::Heartbeat { .. } => MessageType::Heartbeat,
            Message::HeartbeatAck { .. } => MessageType::HeartbeatAck,
            Message::Error { .. } => MessageType::Error,
        }
    }
}
