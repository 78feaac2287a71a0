//! Wire protocol for agent protocol v2.
//!
//! All messages use a length-prefixed binary format:
//!
//! ```text
//! +--------+--------+------------------+
//! | Length | Type   | Payload          |
//! | 4 bytes| 1 byte | variable         |
//! | BE u32 | u8     | JSON             |
//! +--------+--------+------------------+
//! ```
//!
//! The length field counts the type byte plus the payload, so its minimum
//! value is 1. Empty payloads are written as the literal `{}` so that every
//! payload on the wire is valid JSON. The type byte is the single source of
//! truth for dispatch; payloads do not re-declare it.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::AgentError;

/// Maximum frame size (16 MB), enforced on both read and write.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Message type identifiers for the binary protocol.
///
/// The byte values are the wire contract and are not negotiable.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Handshake and reverse registration
    HandshakeRequest = 0x01,
    HandshakeResponse = 0x02,
    Registration = 0x03,
    RegistrationAck = 0x04,

    // Request path (proxy -> agent)
    RequestHeaders = 0x10,
    RequestBodyChunk = 0x11,
    ResponseHeaders = 0x12,
    ResponseBodyChunk = 0x13,

    // Request path (agent -> proxy)
    Decision = 0x20,
    BodyMutation = 0x21,

    // Cancellation (proxy -> agent, no reply)
    CancelRequest = 0x30,
    CancelAll = 0x31,

    // Observability
    HealthRequest = 0xE0,
    HealthResponse = 0xE1,
    MetricsRequest = 0xE2,
    MetricsResponse = 0xE3,

    // Keep-alive
    Ping = 0xF0,
    Pong = 0xF1,
}

impl TryFrom<u8> for MessageType {
    type Error = AgentError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::HandshakeRequest),
            0x02 => Ok(MessageType::HandshakeResponse),
            0x03 => Ok(MessageType::Registration),
            0x04 => Ok(MessageType::RegistrationAck),
            0x10 => Ok(MessageType::RequestHeaders),
            0x11 => Ok(MessageType::RequestBodyChunk),
            0x12 => Ok(MessageType::ResponseHeaders),
            0x13 => Ok(MessageType::ResponseBodyChunk),
            0x20 => Ok(MessageType::Decision),
            0x21 => Ok(MessageType::BodyMutation),
            0x30 => Ok(MessageType::CancelRequest),
            0x31 => Ok(MessageType::CancelAll),
            0xE0 => Ok(MessageType::HealthRequest),
            0xE1 => Ok(MessageType::HealthResponse),
            0xE2 => Ok(MessageType::MetricsRequest),
            0xE3 => Ok(MessageType::MetricsResponse),
            0xF0 => Ok(MessageType::Ping),
            0xF1 => Ok(MessageType::Pong),
            _ => Err(AgentError::ProtocolViolation(format!(
                "unknown message type: 0x{value:02X}"
            ))),
        }
    }
}

/// A single protocol frame: a raw type byte plus a JSON payload.
///
/// The tag is kept raw so that unknown types can flow up to the dispatch
/// layer, which answers them defensively instead of erroring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame from a typed payload.
    pub fn new<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<Self, AgentError> {
        let payload = serde_json::to_vec(payload)
            .map_err(|e| AgentError::Serialization(e.to_string()))?;
        Ok(Self {
            tag: msg_type as u8,
            payload,
        })
    }

    /// Build a frame with an empty (`{}`) payload.
    pub fn empty(msg_type: MessageType) -> Self {
        Self {
            tag: msg_type as u8,
            payload: Vec::new(),
        }
    }

    /// The message type, if the tag is a known one.
    pub fn msg_type(&self) -> Option<MessageType> {
        MessageType::try_from(self.tag).ok()
    }

    pub fn is(&self, msg_type: MessageType) -> bool {
        self.tag == msg_type as u8
    }

    /// Deserialize the payload into a typed message.
    pub fn parse<'a, T: Deserialize<'a>>(&'a self) -> Result<T, AgentError> {
        serde_json::from_slice(&self.payload).map_err(|e| AgentError::Decode(e.to_string()))
    }
}

/// Read one frame from the stream.
///
/// Returns `Ok(None)` on a clean end of stream (EOF before the first length
/// byte). EOF anywhere inside a frame is a `Truncated` error.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, AgentError> {
    let mut len_bytes = [0u8; 4];

    let n = reader.read(&mut len_bytes).await?;
    if n == 0 {
        return Ok(None);
    }
    if n < len_bytes.len() {
        reader
            .read_exact(&mut len_bytes[n..])
            .await
            .map_err(|e| truncated("length prefix", e))?;
    }

    let total_len = u32::from_be_bytes(len_bytes) as usize;
    if total_len < 1 {
        return Err(AgentError::ProtocolViolation(format!(
            "frame length too small: {total_len}"
        )));
    }
    if total_len > MAX_FRAME_SIZE {
        return Err(AgentError::FrameTooLarge {
            size: total_len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut type_byte = [0u8; 1];
    reader
        .read_exact(&mut type_byte)
        .await
        .map_err(|e| truncated("type byte", e))?;

    let payload_len = total_len - 1;
    let mut payload = vec![0u8; payload_len];
    if payload_len > 0 {
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| truncated("payload", e))?;
    }

    Ok(Some(Frame {
        tag: type_byte[0],
        payload,
    }))
}

/// Write one frame to the stream.
///
/// An empty payload is written as the literal `{}`, preserving the invariant
/// that every payload on the wire is JSON.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), AgentError> {
    let payload: &[u8] = if frame.payload.is_empty() {
        b"{}"
    } else {
        &frame.payload
    };

    let total_len = 1 + payload.len();
    if total_len > MAX_FRAME_SIZE {
        return Err(AgentError::FrameTooLarge {
            size: total_len,
            max: MAX_FRAME_SIZE,
        });
    }

    writer.write_all(&(total_len as u32).to_be_bytes()).await?;
    writer.write_all(&[frame.tag]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;

    Ok(())
}

fn truncated(what: &str, err: std::io::Error) -> AgentError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        AgentError::Truncated(format!("stream ended while reading {what}"))
    } else {
        AgentError::Io(err)
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Client metadata attached to request headers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestMetadata {
    /// Correlation ID for request tracing (proxy-side string identity)
    pub correlation_id: String,
    /// Client IP address
    pub client_ip: String,
    /// Client port
    pub client_port: u16,
    /// Server name (SNI or Host header)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    /// Protocol (HTTP/1.1, HTTP/2, ...)
    pub protocol: String,
    /// TLS version if applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_version: Option<String>,
    /// Route ID that matched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    /// Upstream ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_id: Option<String>,
    /// W3C trace context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceparent: Option<String>,
}

/// Request headers event (0x10).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestHeadersEvent {
    pub request_id: u64,
    pub method: String,
    pub uri: String,
    pub headers: HashMap<String, Vec<String>>,
    pub has_body: bool,
    pub metadata: RequestMetadata,
}

/// Request body chunk event (0x11).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestBodyChunkEvent {
    pub request_id: u64,
    /// 0-based, monotonic per request
    pub chunk_index: u32,
    /// Base64-encoded chunk data
    pub data: String,
    pub is_last: bool,
}

impl RequestBodyChunkEvent {
    /// Decode the base64 chunk data.
    pub fn decoded_data(&self) -> Result<Vec<u8>, AgentError> {
        BASE64
            .decode(&self.data)
            .map_err(|e| AgentError::Decode(format!("invalid chunk data: {e}")))
    }
}

/// Response headers event (0x12).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseHeadersEvent {
    pub request_id: u64,
    pub status_code: u16,
    pub headers: HashMap<String, Vec<String>>,
    pub has_body: bool,
}

/// Response body chunk event (0x13).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseBodyChunkEvent {
    pub request_id: u64,
    pub chunk_index: u32,
    /// Base64-encoded chunk data
    pub data: String,
    pub is_last: bool,
}

impl ResponseBodyChunkEvent {
    /// Decode the base64 chunk data.
    pub fn decoded_data(&self) -> Result<Vec<u8>, AgentError> {
        BASE64
            .decode(&self.data)
            .map_err(|e| AgentError::Decode(format!("invalid chunk data: {e}")))
    }
}

/// Cancellation of a single request (0x30). Never answered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CancelRequestMessage {
    pub request_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Cancellation of every in-flight request (0x31). Never answered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CancelAllMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Keep-alive ping (0xF0).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PingMessage {
    pub timestamp: i64,
}

/// Keep-alive reply (0xF1), echoing the ping timestamp.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PongMessage {
    pub timestamp: i64,
}

/// Encode raw bytes the way chunk payloads carry them.
pub fn encode_chunk_data(data: &[u8]) -> String {
    BASE64.encode(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn message_type_byte_values_are_fixed() {
        assert_eq!(MessageType::HandshakeRequest as u8, 0x01);
        assert_eq!(MessageType::HandshakeResponse as u8, 0x02);
        assert_eq!(MessageType::Registration as u8, 0x03);
        assert_eq!(MessageType::RegistrationAck as u8, 0x04);
        assert_eq!(MessageType::RequestHeaders as u8, 0x10);
        assert_eq!(MessageType::RequestBodyChunk as u8, 0x11);
        assert_eq!(MessageType::ResponseHeaders as u8, 0x12);
        assert_eq!(MessageType::ResponseBodyChunk as u8, 0x13);
        assert_eq!(MessageType::Decision as u8, 0x20);
        assert_eq!(MessageType::BodyMutation as u8, 0x21);
        assert_eq!(MessageType::CancelRequest as u8, 0x30);
        assert_eq!(MessageType::CancelAll as u8, 0x31);
        assert_eq!(MessageType::HealthRequest as u8, 0xE0);
        assert_eq!(MessageType::HealthResponse as u8, 0xE1);
        assert_eq!(MessageType::MetricsRequest as u8, 0xE2);
        assert_eq!(MessageType::MetricsResponse as u8, 0xE3);
        assert_eq!(MessageType::Ping as u8, 0xF0);
        assert_eq!(MessageType::Pong as u8, 0xF1);
    }

    #[test]
    fn message_type_roundtrip() {
        for byte in [0x01u8, 0x02, 0x10, 0x11, 0x20, 0x30, 0xE0, 0xF0, 0xF1] {
            let parsed = MessageType::try_from(byte).unwrap();
            assert_eq!(parsed as u8, byte);
        }
        assert!(MessageType::try_from(0xFF).is_err());
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut client, mut server) = duplex(1024);

        let event = RequestBodyChunkEvent {
            request_id: 42,
            chunk_index: 0,
            data: encode_chunk_data(b"hello"),
            is_last: true,
        };
        let frame = Frame::new(MessageType::RequestBodyChunk, &event).unwrap();
        write_frame(&mut client, &frame).await.unwrap();

        let read = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(read.msg_type(), Some(MessageType::RequestBodyChunk));
        assert_eq!(read, frame);

        let parsed: RequestBodyChunkEvent = read.parse().unwrap();
        assert_eq!(parsed.request_id, 42);
        assert_eq!(parsed.decoded_data().unwrap(), b"hello");
    }

    #[tokio::test]
    async fn length_prefix_counts_type_byte_and_payload() {
        let (mut client, mut server) = duplex(1024);

        let frame = Frame::new(MessageType::Ping, &PingMessage { timestamp: 7 }).unwrap();
        let payload_len = frame.payload.len();
        write_frame(&mut client, &frame).await.unwrap();
        drop(client);

        let mut raw = Vec::new();
        server.read_to_end(&mut raw).await.unwrap();
        let declared = u32::from_be_bytes(raw[..4].try_into().unwrap()) as usize;
        assert_eq!(declared, 1 + payload_len);
        assert_eq!(raw[4], 0xF0);
    }

    #[tokio::test]
    async fn empty_payload_is_written_as_json_object() {
        let (mut client, mut server) = duplex(64);

        write_frame(&mut client, &Frame::empty(MessageType::HealthRequest))
            .await
            .unwrap();

        let read = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(read.tag, 0xE0);
        assert_eq!(read.payload, b"{}");
    }

    #[tokio::test]
    async fn empty_reader_is_end_of_stream() {
        let (client, mut server) = duplex(64);
        drop(client);

        let result = read_frame(&mut server).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn partial_header_is_truncated() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x00, 0x00, 0x01]).await.unwrap();
        drop(client);

        match read_frame(&mut server).await {
            Err(AgentError::Truncated(_)) => {}
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn partial_payload_is_truncated() {
        let (mut client, mut server) = duplex(64);
        // Declares 10 payload bytes but delivers 3.
        client.write_all(&11u32.to_be_bytes()).await.unwrap();
        client.write_all(&[0x10]).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        match read_frame(&mut server).await {
            Err(AgentError::Truncated(_)) => {}
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversize_frame_is_rejected_on_read() {
        let (mut client, mut server) = duplex(64);
        let oversize = (MAX_FRAME_SIZE + 1) as u32;
        client.write_all(&oversize.to_be_bytes()).await.unwrap();

        match read_frame(&mut server).await {
            Err(AgentError::FrameTooLarge { size, max }) => {
                assert_eq!(size, MAX_FRAME_SIZE + 1);
                assert_eq!(max, MAX_FRAME_SIZE);
            }
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversize_frame_is_rejected_on_write() {
        let (mut client, _server) = duplex(64);
        let frame = Frame {
            tag: MessageType::Decision as u8,
            payload: vec![b'x'; MAX_FRAME_SIZE],
        };

        match write_frame(&mut client, &frame).await {
            Err(AgentError::FrameTooLarge { .. }) => {}
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_length_frame_is_a_protocol_violation() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&0u32.to_be_bytes()).await.unwrap();

        match read_frame(&mut server).await {
            Err(AgentError::ProtocolViolation(_)) => {}
            other => panic!("expected ProtocolViolation, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_preserved_on_the_frame() {
        let frame = Frame {
            tag: 0x7F,
            payload: b"{}".to_vec(),
        };
        assert_eq!(frame.msg_type(), None);
    }
}
