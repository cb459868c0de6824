//! Agent transport framing
//!
//! Every frame is length-prefixed; the body opens with a small envelope
//! followed by the bincode-encoded [`Message`]:
//!
//! ```text
//! +-------------------+---------+------+-----------------+-----------------+
//! | Length (u32, BE)  | Version | Type | Sequence (u32)  | bincode Message |
//! +-------------------+---------+------+-----------------+-----------------+
//! ```
//!
//! `Length` counts every byte after the prefix. Oversized frames are
//! rejected from the prefix alone, before the body is buffered.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::ProtocolError;
use crate::message::{Message, MessageType};
use crate::sequence::Sequence;

/// Wire format revision carried in every envelope
pub const WIRE_VERSION: u8 = 1;

/// Largest frame body accepted or produced (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Version + type + sequence
const ENVELOPE_SIZE: usize = 6;

/// One decoded frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Command this frame belongs to, or [`Sequence::CONTROL`]
    pub sequence: Sequence,
    pub message: Message,
}

impl Frame {
    pub fn new(sequence: Sequence, message: Message) -> Self {
        Self { sequence, message }
    }

    /// Create a frame that is not tied to any command
    pub fn control(message: Message) -> Self {
        Self::new(Sequence::CONTROL, message)
    }
}

/// Codec for `Framed<TcpStream, FrameCodec>` on both ends of the agent link
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
    /// The inner codec has consumed a prefix and is waiting on its body
    mid_frame: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_PREFIX)
                .max_frame_length(MAX_FRAME_SIZE)
                .new_codec(),
            mid_frame: false,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let has_prefix = src.len() >= LENGTH_PREFIX;
        if has_prefix && !self.mid_frame {
            let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
            if size > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge {
                    size,
                    max: MAX_FRAME_SIZE,
                });
            }
        }

        let Some(mut body) = self.inner.decode(src)? else {
            self.mid_frame |= has_prefix;
            return Ok(None);
        };
        self.mid_frame = false;
        if body.len() < ENVELOPE_SIZE {
            return Err(ProtocolError::Truncated(body.len()));
        }

        let version = body.get_u8();
        if version != WIRE_VERSION {
            return Err(ProtocolError::VersionMismatch {
                got: version,
                expected: WIRE_VERSION,
            });
        }
        let type_byte = body.get_u8();
        let declared =
            MessageType::from_u8(type_byte).ok_or(ProtocolError::UnknownMessageType(type_byte))?;
        let sequence = Sequence::new(body.get_u32());

        let message: Message = bincode::deserialize(&body)?;
        if message.message_type() != declared {
            return Err(ProtocolError::TypeMismatch {
                header: declared,
                payload: message.message_type(),
            });
        }

        Ok(Some(Frame { sequence, message }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&frame.message)?;
        let size = ENVELOPE_SIZE + payload.len();
        if size > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut body = BytesMut::with_capacity(size);
        body.put_u8(WIRE_VERSION);
        body.put_u8(frame.message.message_type().as_u8());
        body.put_u32(frame.sequence.as_u32());
        body.extend_from_slice(&payload);

        self.inner.encode(body.freeze(), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn encoded(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_envelope_layout() {
        let buf = encoded(Frame::new(
            Sequence::new(42),
            Message::Heartbeat { timestamp: 7 },
        ));

        let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(body_len, buf.len() - LENGTH_PREFIX);
        assert_eq!(buf[4], WIRE_VERSION);
        assert_eq!(buf[5], MessageType::Heartbeat.as_u8());
        assert_eq!(&buf[6..10], &[0, 0, 0, 42]);
    }

    #[test]
    fn test_command_frame_decodes() {
        let frame = Frame::new(
            Sequence::new(7),
            Message::Command {
                request: "device_info".to_string(),
                extras: vec!["verbose".to_string()],
            },
        );
        let mut buf = encoded(frame.clone());

        let decoded = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_frames_arrive_in_pieces() {
        let mut codec = FrameCodec::new();
        let mut wire = encoded(Frame::control(Message::Response {
            kind: "system_info".to_string(),
            payload: Bytes::from("uptime 3 days"),
        }));
        wire.extend_from_slice(&encoded(Frame::control(Message::Heartbeat { timestamp: 1 })));

        // Two bytes of the prefix only
        let mut buf = wire.split_to(2);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // Prefix complete, body still short
        buf.extend_from_slice(&wire.split_to(8));
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // Body bytes alone must not be read as a new prefix
        buf.extend_from_slice(&wire.split_to(4));
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&wire);
        match codec.decode(&mut buf).unwrap().unwrap().message {
            Message::Response { kind, payload } => {
                assert_eq!(kind, "system_info");
                assert_eq!(payload.as_ref(), b"uptime 3 days");
            }
            other => panic!("Expected Response, got {:?}", other),
        }
        assert!(matches!(
            codec.decode(&mut buf).unwrap().unwrap().message,
            Message::Heartbeat { timestamp: 1 }
        ));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_prefix_rejected_before_body() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_SIZE as u32 + 1);
        buf.put_u8(WIRE_VERSION);

        assert!(matches!(
            FrameCodec::new().decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_rejects_other_wire_version() {
        let mut buf = encoded(Frame::control(Message::Heartbeat { timestamp: 1 }));
        buf[4] = WIRE_VERSION + 1;

        assert!(matches!(
            FrameCodec::new().decode(&mut buf),
            Err(ProtocolError::VersionMismatch { got: 2, expected: 1 })
        ));
    }

    #[test]
    fn test_rejects_unknown_and_mismatched_types() {
        let mut buf = encoded(Frame::control(Message::Heartbeat { timestamp: 1 }));
        buf[5] = 0xFE;
        assert!(matches!(
            FrameCodec::new().decode(&mut buf),
            Err(ProtocolError::UnknownMessageType(0xFE))
        ));

        let mut buf = encoded(Frame::control(Message::Heartbeat { timestamp: 1 }));
        buf[5] = MessageType::Command.as_u8();
        assert!(matches!(
            FrameCodec::new().decode(&mut buf),
            Err(ProtocolError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_short_body_is_truncated() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.extend_from_slice(&[WIRE_VERSION, 0x05, 0]);

        assert!(matches!(
            FrameCodec::new().decode(&mut buf),
            Err(ProtocolError::Truncated(3))
        ));
    }
}
