//! Wire message types and JSON bodies.
//!
//! Every frame carries a typed header and a body. Bodies are JSON except
//! [`MessageType::DataStream`], which is raw bytes. Optional fields are
//! omitted from serialized JSON when absent, and binary payloads inside
//! JSON are base64-encoded.
//!
//! Bodies that crossed the legacy cipher carry trailing zero padding;
//! [`parse_body`] strips it before handing bytes to the JSON parser.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::error::{ProtocolError, ProtocolResult};

/// Message type discriminant, one byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageType {
    /// Client credentials challenge.
    AuthRequest = 1,
    /// Authentication outcome.
    AuthResponse = 2,
    /// Command invocation.
    CommandRequest = 3,
    /// Terminal command outcome.
    CommandResponse = 4,
    /// Raw streamed bytes for a request.
    DataStream = 5,
    /// Request-scoped error.
    ErrorResponse = 6,
    /// Liveness probe.
    HeartbeatRequest = 7,
    /// Liveness reply.
    HeartbeatResponse = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::AuthRequest),
            2 => Ok(Self::AuthResponse),
            3 => Ok(Self::CommandRequest),
            4 => Ok(Self::CommandResponse),
            5 => Ok(Self::DataStream),
            6 => Ok(Self::ErrorResponse),
            7 => Ok(Self::HeartbeatRequest),
            8 => Ok(Self::HeartbeatResponse),
            other => Err(format!("unsupported message type: {other}")),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        value as u8
    }
}

/// Frame header, serialized as JSON after a `u16` length prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    /// Message type.
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Number of body bytes following the header (post-encryption size).
    pub length: u32,
    /// Opaque request correlation id chosen by the client.
    pub request_id: String,
    /// Whether the body has been passed through the connection cipher.
    pub encrypted: bool,
}

/// One message on the wire.
#[derive(Debug, Clone)]
pub struct Message {
    /// Frame header.
    pub header: Header,
    /// Frame body; plaintext in memory, encrypted on the wire when the
    /// header says so.
    pub body: Bytes,
}

impl Message {
    /// Build a message with the header length tracking the body.
    #[must_use]
    pub fn new(msg_type: MessageType, request_id: impl Into<String>, body: Bytes, encrypted: bool) -> Self {
        Self {
            header: Header {
                msg_type,
                length: body.len() as u32,
                request_id: request_id.into(),
                encrypted,
            },
            body,
        }
    }

    fn with_json_body<T: Serialize>(
        msg_type: MessageType,
        request_id: impl Into<String>,
        body: &T,
        encrypted: bool,
    ) -> ProtocolResult<Self> {
        let bytes = serde_json::to_vec(body).map_err(|e| ProtocolError::BadBody(e.to_string()))?;
        Ok(Self::new(msg_type, request_id, Bytes::from(bytes), encrypted))
    }

    /// Build an `AUTH_REQUEST`.
    ///
    /// # Errors
    ///
    /// Fails if the body does not serialize.
    pub fn auth_request(
        request_id: impl Into<String>,
        body: &AuthRequestBody,
    ) -> ProtocolResult<Self> {
        // The server has no cipher before authentication succeeds.
        Self::with_json_body(MessageType::AuthRequest, request_id, body, false)
    }

    /// Build an `AUTH_RESPONSE`.
    ///
    /// # Errors
    ///
    /// Fails if the body does not serialize.
    pub fn auth_response(
        request_id: impl Into<String>,
        body: &AuthResponseBody,
    ) -> ProtocolResult<Self> {
        Self::with_json_body(MessageType::AuthResponse, request_id, body, false)
    }

    /// Build a `COMMAND_REQUEST`.
    ///
    /// # Errors
    ///
    /// Fails if the body does not serialize.
    pub fn command_request(
        request_id: impl Into<String>,
        body: &CommandRequestBody,
        encrypted: bool,
    ) -> ProtocolResult<Self> {
        Self::with_json_body(MessageType::CommandRequest, request_id, body, encrypted)
    }

    /// Build a `COMMAND_RESPONSE`.
    ///
    /// # Errors
    ///
    /// Fails if the body does not serialize.
    pub fn command_response(
        request_id: impl Into<String>,
        body: &CommandResponseBody,
        encrypted: bool,
    ) -> ProtocolResult<Self> {
        Self::with_json_body(MessageType::CommandResponse, request_id, body, encrypted)
    }

    /// Build a `DATA_STREAM` carrying raw bytes.
    #[must_use]
    pub fn data_stream(request_id: impl Into<String>, data: Bytes, encrypted: bool) -> Self {
        Self::new(MessageType::DataStream, request_id, data, encrypted)
    }

    /// Build an `ERROR_RESPONSE`.
    ///
    /// # Errors
    ///
    /// Fails if the body does not serialize.
    pub fn error_response(
        request_id: impl Into<String>,
        code: u16,
        message: impl Into<String>,
        encrypted: bool,
    ) -> ProtocolResult<Self> {
        Self::with_json_body(
            MessageType::ErrorResponse,
            request_id,
            &ErrorResponseBody {
                code,
                message: message.into(),
            },
            encrypted,
        )
    }

    /// Build a `HEARTBEAT_REQUEST`.
    ///
    /// # Errors
    ///
    /// Fails if the body does not serialize.
    pub fn heartbeat_request(
        request_id: impl Into<String>,
        timestamp: i64,
        encrypted: bool,
    ) -> ProtocolResult<Self> {
        Self::with_json_body(
            MessageType::HeartbeatRequest,
            request_id,
            &HeartbeatRequestBody { timestamp },
            encrypted,
        )
    }

    /// Build a `HEARTBEAT_RESPONSE`.
    ///
    /// # Errors
    ///
    /// Fails if the body does not serialize.
    pub fn heartbeat_response(
        request_id: impl Into<String>,
        timestamp: i64,
        server_load: f64,
        encrypted: bool,
    ) -> ProtocolResult<Self> {
        Self::with_json_body(
            MessageType::HeartbeatResponse,
            request_id,
            &HeartbeatResponseBody {
                timestamp,
                server_load,
            },
            encrypted,
        )
    }
}

/// Parse a JSON body, tolerating the legacy cipher's zero padding.
///
/// # Errors
///
/// Fails with [`ProtocolError::BadBody`] when the remaining bytes are not
/// the expected JSON shape.
pub fn parse_body<T: DeserializeOwned>(body: &[u8]) -> ProtocolResult<T> {
    let trimmed_len = body
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |pos| pos + 1);
    serde_json::from_slice(&body[..trimmed_len]).map_err(|e| ProtocolError::BadBody(e.to_string()))
}

/// `AUTH_REQUEST` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequestBody {
    /// Client identity.
    pub client_id: String,
    /// Client-chosen nonce.
    pub nonce: String,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    /// Hex-encoded HMAC-SHA256 over `"<client_id>:<nonce>:<timestamp>"`.
    pub signature: String,
}

/// `AUTH_RESPONSE` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponseBody {
    /// Whether authentication succeeded.
    pub success: bool,
    /// Session id on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Failure reason or informational text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `COMMAND_REQUEST` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequestBody {
    /// Target plugin id.
    pub plugin: String,
    /// Command within the plugin.
    pub command: String,
    /// Command arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Whether the client will stream stdin for this request.
    pub interactive: bool,
}

/// `COMMAND_RESPONSE` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponseBody {
    /// Whether the command completed without error.
    pub success: bool,
    /// Error text on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Optional binary payload, base64 in JSON.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_base64")]
    pub data: Option<Vec<u8>>,
}

/// `ERROR_RESPONSE` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponseBody {
    /// HTTP-flavored error code (400/401/403/404/409/500).
    pub code: u16,
    /// Human-readable reason.
    pub message: String,
}

/// `HEARTBEAT_REQUEST` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequestBody {
    /// Client's Unix timestamp in seconds.
    pub timestamp: i64,
}

/// `HEARTBEAT_RESPONSE` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponseBody {
    /// Server's Unix timestamp in seconds.
    pub timestamp: i64,
    /// Load indicator; currently always zero.
    pub server_load: f64,
}

/// Base64 (de)serialization for `Option<Vec<u8>>`.
mod opt_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_roundtrips_and_rejects_unknown() {
        for value in 1u8..=8 {
            let parsed = MessageType::try_from(value).unwrap();
            assert_eq!(u8::from(parsed), value);
        }
        assert!(MessageType::try_from(0).is_err());
        assert!(MessageType::try_from(9).is_err());
    }

    #[test]
    fn header_json_shape_is_stable() {
        let header = Header {
            msg_type: MessageType::CommandRequest,
            length: 12,
            request_id: "r1".to_string(),
            encrypted: true,
        };
        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": 3,
                "length": 12,
                "request_id": "r1",
                "encrypted": true
            })
        );
    }

    #[test]
    fn constructor_sets_length_from_body() {
        let body = AuthResponseBody {
            success: true,
            session_id: Some("s".to_string()),
            message: None,
        };
        let msg = Message::auth_response("r1", &body).unwrap();
        assert_eq!(msg.header.length as usize, msg.body.len());
        assert_eq!(msg.header.msg_type, MessageType::AuthResponse);

        // Absent optionals are omitted entirely.
        let text = String::from_utf8(msg.body.to_vec()).unwrap();
        assert!(!text.contains("message"));
    }

    #[test]
    fn parse_body_strips_trailing_zero_padding() {
        let mut padded = serde_json::to_vec(&HeartbeatRequestBody { timestamp: 42 }).unwrap();
        padded.extend_from_slice(&[0, 0, 0]);

        let parsed: HeartbeatRequestBody = parse_body(&padded).unwrap();
        assert_eq!(parsed.timestamp, 42);
    }

    #[test]
    fn parse_body_rejects_garbage() {
        assert!(parse_body::<HeartbeatRequestBody>(b"not json").is_err());
        assert!(parse_body::<HeartbeatRequestBody>(&[]).is_err());
    }

    #[test]
    fn command_response_data_is_base64() {
        let body = CommandResponseBody {
            success: true,
            message: None,
            data: Some(vec![0xDE, 0xAD, 0xBE, 0xEF]),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["data"], "3q2+7w==");

        let back: CommandResponseBody = serde_json::from_value(json).unwrap();
        assert_eq!(back.data.unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn command_request_args_default_empty() {
        let parsed: CommandRequestBody = serde_json::from_str(
            r#"{"plugin": "echo", "command": "say", "interactive": false}"#,
        )
        .unwrap();
        assert!(parsed.args.is_empty());
    }
}
