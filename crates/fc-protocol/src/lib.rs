//! fc-protocol: Wire protocol between fleet-control and its agents
//!
//! This crate defines the binary protocol spoken over the agent transport:
//! registration, heartbeats, command pushes and agent responses.

pub mod codec;
pub mod error;
pub mod message;
pub mod sequence;

pub use codec::{Frame, FrameCodec, MAX_FRAME_SIZE, WIRE_VERSION};
pub use error::ProtocolError;
pub use message::{ErrorCode, Message, MessageType, PROTOCOL_VERSION};
pub use sequence::Sequence;
