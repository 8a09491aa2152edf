//! Codecs for Parley envelopes.
//!
//! Text frames carry plain JSON envelopes. Binary frames carry
//! MessagePack-encoded envelopes with length-prefixed framing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;

use crate::events::{ClientEvent, Envelope, ServerEvent};

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Envelope names an event this server does not handle.
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    /// Payload fields have the wrong shape.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

/// Encoding used on a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireFormat {
    /// JSON text frames.
    #[default]
    Json,
    /// Length-prefixed MessagePack binary frames.
    MessagePack,
}

/// Decode a JSON text frame into a client event.
///
/// # Errors
///
/// Returns an error if the text is not a valid envelope or names an unknown event.
pub fn decode_text(text: &str) -> Result<ClientEvent, ProtocolError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    ClientEvent::from_envelope(envelope)
}

/// Encode a server event as a JSON text frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_text(event: &ServerEvent) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(event)?)
}

/// Encode any serializable value as a length-prefixed MessagePack frame.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded value
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_binary<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(value, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a value into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into<T: Serialize>(value: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(value)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode one complete binary frame into a client event.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode_binary(data: &[u8]) -> Result<ClientEvent, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let envelope: Envelope = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    ClientEvent::from_envelope(envelope)
}

/// Try to decode a client event from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(event))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error. A frame
/// with a bad payload is still consumed from the buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<ClientEvent>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let envelope: Envelope = rmp_serde::from_slice(&payload)?;

    ClientEvent::from_envelope(envelope).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{names, GroupRef, SendDirect};
    use serde_json::json;

    #[test]
    fn test_decode_text() {
        let event =
            decode_text(r#"{"event":"chat:send-dm","data":{"recipientId":"bob","message":"hi"}}"#)
                .unwrap();
        assert_eq!(
            event,
            ClientEvent::SendDirect(SendDirect {
                recipient_id: "bob".into(),
                message: "hi".into(),
                metadata: None,
            })
        );
    }

    #[test]
    fn test_decode_text_garbage() {
        assert!(matches!(decode_text("not json"), Err(ProtocolError::Json(_))));
        assert!(matches!(
            decode_text(r#"{"data":{}}"#),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_binary_frame() {
        let envelope = Envelope {
            event: names::LEAVE_GROUP.into(),
            data: json!({"groupId": "rust"}),
        };
        let encoded = encode_binary(&envelope).unwrap();
        let decoded = decode_binary(&encoded).unwrap();
        assert_eq!(
            decoded,
            ClientEvent::LeaveGroup(GroupRef {
                group_id: "rust".into()
            })
        );
    }

    #[test]
    fn test_decode_incomplete() {
        let envelope = Envelope {
            event: names::PING.into(),
            data: serde_json::Value::Null,
        };
        let encoded = encode_binary(&envelope).unwrap();

        match decode_binary(&encoded[..5]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let first = Envelope {
            event: names::JOIN_GROUP.into(),
            data: json!({"groupId": "a"}),
        };
        let second = Envelope {
            event: names::PING.into(),
            data: serde_json::Value::Null,
        };

        let mut buf = BytesMut::new();
        encode_into(&first, &mut buf).unwrap();
        encode_into(&second, &mut buf).unwrap();

        let decoded1 = decode_from(&mut buf).unwrap().unwrap();
        let decoded2 = decode_from(&mut buf).unwrap().unwrap();

        assert!(matches!(decoded1, ClientEvent::JoinGroup(ref g) if g.group_id == "a"));
        assert_eq!(decoded2, ClientEvent::Ping);
        assert!(buf.is_empty());
        assert!(decode_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_encode_text_server_event() {
        let text = encode_text(&ServerEvent::Pong {}).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "pong");
    }
}
