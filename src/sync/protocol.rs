//! Binary WebSocket protocol for document synchronization.
//!
//! Every frame is `[version:u8][type:u8][len:u24][payload]` where the payload
//! is the bincode encoding of a [`ClientMessage`] or [`ServerMessage`]. State
//! vectors, deltas and presence payloads travel as opaque byte vectors produced
//! by the document and presence layers.
//!
//! Text frames carrying the same messages as JSON are accepted as well, which
//! keeps the protocol easy to poke at from a browser console.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::Cursor;

use super::clock::ReplicaId;
use super::SessionId;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

/// Message type identifiers carried in the frame header
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Connection
    Hello = 0x01,
    Welcome = 0x02,
    Goodbye = 0x03,
    Error = 0x04,

    // Reconciliation and live updates
    SyncStep1 = 0x10,
    SyncStep2 = 0x11,
    Update = 0x12,

    // Presence
    Awareness = 0x40,

    // Keepalive
    Ping = 0xF0,
    Pong = 0xF1,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(MessageType::Hello),
            0x02 => Ok(MessageType::Welcome),
            0x03 => Ok(MessageType::Goodbye),
            0x04 => Ok(MessageType::Error),
            0x10 => Ok(MessageType::SyncStep1),
            0x11 => Ok(MessageType::SyncStep2),
            0x12 => Ok(MessageType::Update),
            0x40 => Ok(MessageType::Awareness),
            0xF0 => Ok(MessageType::Ping),
            0xF1 => Ok(MessageType::Pong),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Initial handshake with client identity
    Hello {
        protocol_version: u8,
        /// Replica id of the client's document copy
        replica_id: Option<ReplicaId>,
        name: String,
        color: Option<String>,
        /// Token from an earlier `Welcome`, to resume that session
        session_token: Option<String>,
    },

    /// The client's state vector; the server answers with `SyncStep2`
    SyncStep1 { state_vector: Vec<u8> },

    /// Encoded `SyncDelta` the server is missing, answering a server
    /// `SyncStep1`
    SyncStep2 { delta: Vec<u8> },

    /// Live local edits as an encoded `UpdateRecord`
    Update { delta: Vec<u8> },

    /// Encoded presence updates
    Awareness { payload: Vec<u8> },

    /// Ping for keepalive
    Ping { timestamp: u64 },

    /// Graceful disconnect
    Goodbye { reason: Option<String> },
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Handshake response with the assigned session
    Welcome {
        protocol_version: u8,
        session_id: SessionId,
        color: String,
        session_token: String,
        server_time: i64,
    },

    SyncStep1 { state_vector: Vec<u8> },

    /// One chunk of an encoded `SyncDelta`; a large delta arrives as
    /// several of these, to be applied in order
    SyncStep2 { delta: Vec<u8> },

    /// Edits relayed from another session
    Update {
        delta: Vec<u8>,
        from_session: Option<SessionId>,
    },

    Awareness { payload: Vec<u8> },

    Pong { timestamp: u64, server_time: i64 },

    Error { code: ErrorCode, message: String },
}

/// Error codes for server responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0,
    InvalidMessage = 1,
    DocumentNotFound = 2,
    MalformedRecord = 3,
    ServerError = 4,
    VersionMismatch = 5,
    DocumentFull = 6,
    NotJoined = 7,
}

impl ClientMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ClientMessage::Hello { .. } => MessageType::Hello,
            ClientMessage::SyncStep1 { .. } => MessageType::SyncStep1,
            ClientMessage::SyncStep2 { .. } => MessageType::SyncStep2,
            ClientMessage::Update { .. } => MessageType::Update,
            ClientMessage::Awareness { .. } => MessageType::Awareness,
            ClientMessage::Ping { .. } => MessageType::Ping,
            ClientMessage::Goodbye { .. } => MessageType::Goodbye,
        }
    }
}

impl ServerMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ServerMessage::Welcome { .. } => MessageType::Welcome,
            ServerMessage::SyncStep1 { .. } => MessageType::SyncStep1,
            ServerMessage::SyncStep2 { .. } => MessageType::SyncStep2,
            ServerMessage::Update { .. } => MessageType::Update,
            ServerMessage::Awareness { .. } => MessageType::Awareness,
            ServerMessage::Pong { .. } => MessageType::Pong,
            ServerMessage::Error { .. } => MessageType::Error,
        }
    }
}

/// Protocol codec for encoding/decoding messages
pub struct SyncProtocol;

impl SyncProtocol {
    /// Encode a client message to bytes
    pub fn encode_client(msg: &ClientMessage) -> Result<Bytes, ProtocolError> {
        Self::frame(msg.message_type(), msg)
    }

    /// Encode a server message to bytes
    pub fn encode_server(msg: &ServerMessage) -> Result<Bytes, ProtocolError> {
        Self::frame(msg.message_type(), msg)
    }

    /// Decode a client message from bytes
    pub fn decode_client(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
        let (msg_type, msg): (_, ClientMessage) = Self::unframe(data)?;
        Self::check_type(msg_type, msg.message_type())?;
        Ok(msg)
    }

    /// Decode a server message from bytes
    pub fn decode_server(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
        let (msg_type, msg): (_, ServerMessage) = Self::unframe(data)?;
        Self::check_type(msg_type, msg.message_type())?;
        Ok(msg)
    }

    /// Decode a client message sent as a JSON text frame
    pub fn decode_client_json(text: &str) -> Result<ClientMessage, ProtocolError> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(text.len(), MAX_MESSAGE_SIZE));
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Create an error response message
    pub fn error_response(code: ErrorCode, message: impl Into<String>) -> ServerMessage {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }

    fn frame<T: Serialize>(msg_type: MessageType, msg: &T) -> Result<Bytes, ProtocolError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() + HEADER_LEN > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(
                payload.len() + HEADER_LEN,
                MAX_MESSAGE_SIZE,
            ));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(msg_type as u8);
        buf.put_u24(payload.len() as u32);
        buf.put_slice(&payload);

        Ok(buf.freeze())
    }

    fn unframe<T: DeserializeOwned>(data: &[u8]) -> Result<(MessageType, T), ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::InvalidFormat(
                "Message too short".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let version = cursor.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
        }

        let msg_type = MessageType::try_from(cursor.get_u8())?;
        let payload_len = cursor.get_uint(3) as usize;

        if data.len() < HEADER_LEN + payload_len {
            return Err(ProtocolError::InvalidFormat(format!(
                "Expected {} bytes, got {}",
                HEADER_LEN + payload_len,
                data.len()
            )));
        }

        let payload = &data[HEADER_LEN..HEADER_LEN + payload_len];
        Ok((msg_type, bincode::deserialize(payload)?))
    }

    fn check_type(header: MessageType, body: MessageType) -> Result<(), ProtocolError> {
        if header != body {
            return Err(ProtocolError::InvalidFormat(format!(
                "Header says {:?} but payload is {:?}",
                header, body
            )));
        }
        Ok(())
    }
}

/// Extension trait for writing u24 values
trait BufMutExt {
    fn put_u24(&mut self, n: u32);
}

impl BufMutExt for BytesMut {
    fn put_u24(&mut self, n: u32) {
        self.put_u8((n >> 16) as u8);
        self.put_u8((n >> 8) as u8);
        self.put_u8(n as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_hello_frame() {
        let msg = ClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            replica_id: Some(ReplicaId(42)),
            name: "Test User".to_string(),
            color: None,
            session_token: None,
        };

        let encoded = SyncProtocol::encode_client(&msg).unwrap();
        assert_eq!(encoded[0], PROTOCOL_VERSION);
        assert_eq!(encoded[1], MessageType::Hello as u8);
        let len = ((encoded[2] as usize) << 16) | ((encoded[3] as usize) << 8) | encoded[4] as usize;
        assert_eq!(len, encoded.len() - HEADER_LEN);

        assert_eq!(SyncProtocol::decode_client(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_server_welcome() {
        let msg = ServerMessage::Welcome {
            protocol_version: PROTOCOL_VERSION,
            session_id: "session-456".to_string(),
            color: "#ff5500".to_string(),
            session_token: "token-abc".to_string(),
            server_time: 1234567890,
        };

        let encoded = SyncProtocol::encode_server(&msg).unwrap();
        match SyncProtocol::decode_server(&encoded).unwrap() {
            ServerMessage::Welcome {
                session_id,
                session_token,
                ..
            } => {
                assert_eq!(session_id, "session-456");
                assert_eq!(session_token, "token-abc");
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_update_payload_is_opaque() {
        let delta = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let msg = ClientMessage::Update {
            delta: delta.clone(),
        };

        let encoded = SyncProtocol::encode_client(&msg).unwrap();
        match SyncProtocol::decode_client(&encoded).unwrap() {
            ClientMessage::Update { delta: data } => assert_eq!(data, delta),
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_version_mismatch() {
        let data = SyncProtocol::encode_client(&ClientMessage::Ping { timestamp: 0 }).unwrap();
        let mut bytes = data.to_vec();
        bytes[0] = 0xFF;

        let result = SyncProtocol::decode_client(&bytes);
        assert!(matches!(result, Err(ProtocolError::VersionMismatch(_, _))));
    }

    #[test]
    fn test_header_type_must_match_payload() {
        let data = SyncProtocol::encode_client(&ClientMessage::Ping { timestamp: 7 }).unwrap();
        let mut bytes = data.to_vec();
        bytes[1] = MessageType::Update as u8;
        assert!(matches!(
            SyncProtocol::decode_client(&bytes),
            Err(ProtocolError::InvalidFormat(_))
        ));

        bytes[1] = 0x99;
        assert!(matches!(
            SyncProtocol::decode_client(&bytes),
            Err(ProtocolError::UnknownMessageType(0x99))
        ));
    }

    #[test]
    fn test_truncated_frame() {
        let data = SyncProtocol::encode_server(&ServerMessage::SyncStep2 { delta: vec![9; 32] }).unwrap();
        let result = SyncProtocol::decode_server(&data[..data.len() - 4]);
        assert!(matches!(result, Err(ProtocolError::InvalidFormat(_))));
        assert!(SyncProtocol::decode_server(&[1, 2]).is_err());
    }

    #[test]
    fn test_json_text_frame() {
        let msg = SyncProtocol::decode_client_json(r#"{"Ping":{"timestamp":99}}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping { timestamp: 99 });
        assert!(SyncProtocol::decode_client_json("{\"Bogus\":{}}").is_err());
    }

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::try_from(0x01).unwrap(), MessageType::Hello);
        assert_eq!(MessageType::try_from(0x11).unwrap(), MessageType::SyncStep2);
        assert!(MessageType::try_from(0xFF).is_err());
    }
}
