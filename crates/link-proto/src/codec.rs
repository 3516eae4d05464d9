//! Codec for encoding/decoding control messages
//!
//! Format: `[length: u32 BE][payload: JSON message]`. The decoder is
//! incremental so a streaming reader can feed partial buffers safely.

use crate::messages::ControlMessage;
use crate::session::{MuxStreamReceiver, MuxStreamSender};
use crate::MuxError;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Stream ended mid-message")]
    Truncated,

    #[error("Mux error: {0}")]
    Mux(#[from] MuxError),
}

/// Control message codec
pub struct MessageCodec;

impl MessageCodec {
    /// Maximum control message size (1MB); control traffic is tiny
    pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

    /// Encode a control message to bytes
    pub fn encode(msg: &ControlMessage) -> Result<Bytes, CodecError> {
        let payload = serde_json::to_vec(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a control message from the front of `buf`
    ///
    /// Returns Ok(Some(message)) if a complete message was decoded,
    /// Ok(None) if more data is needed,
    /// Err on error
    pub fn decode(buf: &mut BytesMut) -> Result<Option<ControlMessage>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let msg_bytes = buf.split_to(length);

        let msg: ControlMessage = serde_json::from_slice(&msg_bytes)?;

        Ok(Some(msg))
    }
}

/// Read the next complete control message from a mux stream
///
/// `buf` carries partial bytes across calls. Returns Ok(None) on a clean
/// end of stream; a stream that ends with a partial message is an error.
pub async fn read_message(
    stream: &mut MuxStreamReceiver,
    buf: &mut BytesMut,
) -> Result<Option<ControlMessage>, CodecError> {
    loop {
        if let Some(msg) = MessageCodec::decode(buf)? {
            return Ok(Some(msg));
        }

        match stream.recv().await {
            Some(chunk) => buf.extend_from_slice(&chunk),
            None if buf.is_empty() => return Ok(None),
            None => return Err(CodecError::Truncated),
        }
    }
}

/// Write one control message to a mux stream
pub async fn write_message(
    stream: &MuxStreamSender,
    msg: &ControlMessage,
) -> Result<(), CodecError> {
    let encoded = MessageCodec::encode(msg)?;
    stream.send(&encoded).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ErrorCode, RegisterPayload};

    #[test]
    fn test_encode_decode() {
        let msg = ControlMessage::Ping;

        let encoded = MessageCodec::encode(&msg).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());

        let decoded = MessageCodec::decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(msg));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_decode_incomplete() {
        let msg = ControlMessage::Register(RegisterPayload {
            tenant_id: "t".to_string(),
            jwt: "a.b.c".to_string(),
            version: "1".to_string(),
        });
        let encoded = MessageCodec::encode(&msg).unwrap();

        // Only provide length header
        let mut buf = BytesMut::from(&encoded[..4]);
        let result = MessageCodec::decode(&mut buf).unwrap();
        assert_eq!(result, None);

        // Provide rest of message
        buf.extend_from_slice(&encoded[4..]);
        let result = MessageCodec::decode(&mut buf).unwrap();
        assert_eq!(result, Some(msg));
    }

    #[test]
    fn test_decode_multiple() {
        let msg1 = ControlMessage::Ping;
        let msg2 = ControlMessage::Error {
            code: ErrorCode::NoAvailablePorts,
            message: "pool exhausted".to_string(),
        };

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&MessageCodec::encode(&msg1).unwrap());
        buf.extend_from_slice(&MessageCodec::encode(&msg2).unwrap());

        assert_eq!(MessageCodec::decode(&mut buf).unwrap(), Some(msg1));
        assert_eq!(MessageCodec::decode(&mut buf).unwrap(), Some(msg2));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(MessageCodec::MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes());
        buf.extend_from_slice(b"junk");

        assert!(matches!(
            MessageCodec::decode(&mut buf),
            Err(CodecError::MessageTooLarge(_))
        ));
    }
}
