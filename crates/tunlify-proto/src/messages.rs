//! Control-channel message types
//!
//! Every frame is a single JSON text message with a `type` tag. The set of
//! types is closed; anything else deserializes to [`ControlMessage::Unknown`]
//! and is logged and dropped by the receiver. Protocol evolution is additive.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}

/// Body encoding for `response` frames.
///
/// `utf8` bodies are carried verbatim; `base64` bodies are decoded to raw
/// bytes before being written to the ingress socket. A receiver must never
/// re-encode a base64 body as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    Utf8,
    Base64,
}

impl BodyEncoding {
    /// Decode a response body according to this encoding.
    pub fn decode(&self, body: &str) -> Result<Vec<u8>, FrameError> {
        match self {
            BodyEncoding::Utf8 => Ok(body.as_bytes().to_vec()),
            BodyEncoding::Base64 => Ok(base64_decode(body)?),
        }
    }
}

/// One control-channel frame, in either direction.
///
/// The same enum covers both directions since the tag set is shared
/// (`tcp_data`, `tcp_close` and `heartbeat` flow both ways). Field names
/// follow the wire format (camelCase).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Issued once by the server after successful authentication.
    #[serde(rename_all = "camelCase")]
    Connected {
        tunnel_id: String,
        subdomain: String,
        region: String,
        public_url: String,
    },

    /// One HTTP request to be proxied to the local endpoint.
    /// The body, when present, is base64 of the raw request bytes.
    #[serde(rename_all = "camelCase")]
    Request {
        request_id: String,
        method: String,
        url: String,
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },

    /// Correlates to a prior `request`.
    #[serde(rename_all = "camelCase")]
    Response {
        request_id: String,
        #[serde(default, deserialize_with = "lenient_status")]
        status_code: Option<u16>,
        headers: HashMap<String, String>,
        encoding: BodyEncoding,
        body: String,
    },

    /// Failure report for a specific request.
    #[serde(rename_all = "camelCase")]
    Error { request_id: String, message: String },

    /// Open a new logical TCP stream.
    #[serde(rename_all = "camelCase")]
    TcpConnect { connection_id: String },

    /// The client reached the local endpoint for this stream.
    #[serde(rename_all = "camelCase")]
    TcpConnectAck { connection_id: String },

    /// Payload bytes for a TCP stream, ordered within the stream only.
    #[serde(rename_all = "camelCase")]
    TcpData {
        connection_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    /// Half-close of a TCP stream by either side.
    #[serde(rename_all = "camelCase")]
    TcpClose { connection_id: String },

    /// The stream failed; aborts it on both sides.
    #[serde(rename_all = "camelCase")]
    TcpError { connection_id: String, message: String },

    /// One datagram to relay. Sessions are independent; there is no
    /// connection handshake.
    #[serde(rename_all = "camelCase")]
    UdpData {
        session_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        source_addr: String,
    },

    /// Return datagram for a prior `udp_data` session.
    #[serde(rename_all = "camelCase")]
    UdpResponse {
        session_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    /// Liveness probe; the peer answers with `heartbeat_ack`.
    Heartbeat,

    /// Answer to a `heartbeat`.
    HeartbeatAck,

    /// Advisory from the client: its intended local target. Logging only.
    #[serde(rename_all = "camelCase")]
    SetLocalAddress { address: String },

    /// Unrecognized `type` tag. Logged and dropped by the receiver.
    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    /// Serialize the frame to its JSON wire form.
    pub fn to_wire(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a frame from its JSON wire form.
    pub fn from_wire(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Encode raw bytes for an opaque body field.
pub fn encode_body(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode an opaque base64 body field.
pub fn decode_body(body: &str) -> Result<Vec<u8>, FrameError> {
    Ok(base64_decode(body)?)
}

fn base64_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(s)
}

/// Accepts any JSON value for `statusCode` and yields `None` when it is
/// not a plain integer, so one malformed field does not poison the whole
/// frame. The ingress falls back to 200.
fn lenient_status<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value.as_u64().and_then(|n| u16::try_from(n).ok()))
}

// Serde helpers carrying binary payloads as base64 strings on the wire.
mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .map_err(serde::de::Error::custom)
    }
}
