//! Codec for encoding/decoding protocol messages

use crate::messages::ProxyMessage;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Protocol message codec
pub struct FrameCodec;

impl FrameCodec {
    /// Maximum message size (16MB)
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

    /// Encode a protocol message to bytes
    ///
    /// Format: [length: u32 big-endian][payload: bincode serialized message]
    pub fn encode(msg: &ProxyMessage) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a protocol message from bytes
    ///
    /// Returns Ok(Some(message)) if a complete message was decoded,
    /// Ok(None) if more data is needed,
    /// Err on error
    pub fn decode(buf: &mut BytesMut) -> Result<Option<ProxyMessage>, CodecError> {
        // Need at least 4 bytes for length header
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        // Check if we have the full message
        if buf.len() < 4 + length {
            return Ok(None);
        }

        // Remove length header
        let _ = buf.split_to(4);

        let msg_bytes = buf.split_to(length);
        let msg: ProxyMessage = bincode::deserialize(&msg_bytes)?;

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ScrapeResponse;

    #[test]
    fn test_encode_decode() {
        let msg = ProxyMessage::Heartbeat {
            agent_id: "agent-1".to_string(),
        };

        let encoded = FrameCodec::encode(&msg).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());

        let decoded = FrameCodec::decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(msg));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_decode_incomplete() {
        let msg = ProxyMessage::HeartbeatAck { valid: true };
        let encoded = FrameCodec::encode(&msg).unwrap();

        // Only provide length header
        let mut buf = BytesMut::from(&encoded[..4]);
        let result = FrameCodec::decode(&mut buf).unwrap();
        assert_eq!(result, None);

        // Provide rest of message
        buf.extend_from_slice(&encoded[4..]);
        let result = FrameCodec::decode(&mut buf).unwrap();
        assert_eq!(result, Some(msg));
    }

    #[test]
    fn test_scrape_response_fields_survive() {
        let msg = ProxyMessage::ScrapeResponse(ScrapeResponse {
            agent_id: "agent-1".to_string(),
            scrape_id: 42,
            valid: true,
            status_code: 200,
            reason: String::new(),
            text: "up 1".to_string(),
            content_type: "text/plain".to_string(),
        });

        let encoded = FrameCodec::encode(&msg).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());

        let decoded = FrameCodec::decode(&mut buf).unwrap();
        if let Some(ProxyMessage::ScrapeResponse(resp)) = decoded {
            assert_eq!(resp.scrape_id, 42);
            assert_eq!(resp.status_code, 200);
            assert_eq!(resp.text, "up 1");
            assert_eq!(resp.content_type, "text/plain");
        } else {
            panic!("Expected ScrapeResponse message");
        }
    }

    #[test]
    fn test_encode_oversize_rejected() {
        let msg = ProxyMessage::ScrapeResponse(ScrapeResponse {
            agent_id: "agent-1".to_string(),
            scrape_id: 1,
            valid: true,
            status_code: 200,
            reason: String::new(),
            text: "x".repeat(FrameCodec::MAX_MESSAGE_SIZE + 1),
            content_type: "text/plain".to_string(),
        });

        let result = FrameCodec::encode(&msg);
        assert!(matches!(result, Err(CodecError::MessageTooLarge(_))));
    }

    #[test]
    fn test_decode_oversize_length_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&((FrameCodec::MAX_MESSAGE_SIZE as u32) + 1).to_be_bytes());
        buf.extend_from_slice(&[0u8; 16]);

        let result = FrameCodec::decode(&mut buf);
        assert!(matches!(result, Err(CodecError::MessageTooLarge(_))));
    }
}
