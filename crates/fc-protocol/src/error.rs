//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown message type
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Frame body exceeds the allowed size
    #[error("Frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Frame body shorter than its envelope
    #[error("Truncated frame: {0} bytes")]
    Truncated(usize),

    /// Peer speaks another wire revision
    #[error("Wire version mismatch: got {got}, expected {expected}")]
    VersionMismatch { got: u8, expected: u8 },

    /// Header announced one message type, payload decoded as another
    #[error("Header/payload mismatch: header says {header:?}, payload is {payload:?}")]
    TypeMismatch {
        header: crate::message::MessageType,
        payload: crate::message::MessageType,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
