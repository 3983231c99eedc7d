//! Wire protocol for request/response framing between peers and servers.
//!
//! Peer → server (binary layout):
//! ```text
//! ┌────────┬────────┬─────────────┬─────────────┬─────────┬─────┬─────────────────────┬───────────┬──────┐
//! │ method │ has_id │ has_headers │ request_id? │ url_len │ url │ header_len? header? │ body_type?│ body │
//! │ 1 byte │ 1 byte │ 1 byte      │ 2 bytes     │ 2 bytes │ var │ 2 bytes + JSON      │ 1 byte    │ rest │
//! └────────┴────────┴─────────────┴─────────────┴─────────┴─────┴─────────────────────┴───────────┴──────┘
//! ```
//!
//! Server → peer (binary layout):
//! ```text
//! ┌─────────────┬────────┬───────────┬────────┬─────────────┬───────────┬─────────┬─────┬─────────────────────┬───────────┬──────┐
//! │ correlation │ method │ has_reply │ status │ has_headers │ reply_to? │ url_len │ url │ header_len? header? │ body_type?│ body │
//! │ 3 bytes     │ 1 byte │ 1 byte    │ 2 bytes│ 1 byte      │ 2 bytes   │ 2 bytes │ var │ 2 bytes + JSON      │ 1 byte    │ rest │
//! └─────────────┴────────┴───────────┴────────┴─────────────┴───────────┴─────────┴─────┴─────────────────────┴───────────┴──────┘
//! ```
//!
//! Multi-byte numbers are radix 255, not 256: `high * 255 + low`. Peers in
//! the field depend on this, so it is kept as is. The largest two-byte value
//! is therefore 65 279 and the largest correlation id is 255³ − 1.
//!
//! Frames travel either in binary WebSocket messages (the layout above) or
//! as JSON objects in text messages. The choice is a [`WireFormat`] fixed at
//! construction.

pub mod binary;
pub mod text;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;

/// Largest value a two-byte field can carry.
pub const MAX_U16_FIELD: u32 = 255 * 255 + 254;

/// Number of distinct correlation ids in the three-byte prefix.
pub const CORRELATION_SPACE: u32 = 255 * 255 * 255;

/// Reserved path of the connection handshake.
pub const HANDSHAKE_PATH: &str = "/connection";

/// Longest connection or group id that fits in a channel envelope.
pub const MAX_ENVELOPE_TARGET: usize = u8::MAX as usize;

/// Request method, encoded as the first byte of a peer frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum Method {
    Get = 0,
    Post = 1,
    Put = 2,
    Patch = 3,
    Delete = 4,
    /// Connection-level control traffic (handshake and friends)
    Meta = 5,
}

impl Method {
    pub const ALL: [Method; 6] = [
        Method::Get,
        Method::Post,
        Method::Put,
        Method::Patch,
        Method::Delete,
        Method::Meta,
    ];

    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Get),
            1 => Some(Self::Post),
            2 => Some(Self::Put),
            3 => Some(Self::Patch),
            4 => Some(Self::Delete),
            5 => Some(Self::Meta),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Meta => "META",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the body bytes are to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BodyType {
    Json = 0,
    Text = 1,
    Binary = 2,
}

impl BodyType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Json),
            1 => Some(Self::Text),
            2 => Some(Self::Binary),
            _ => None,
        }
    }
}

/// Frame headers. Sorted so that encoding is deterministic.
pub type Headers = BTreeMap<String, String>;

/// A typed frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Body {
    kind: BodyType,
    data: Bytes,
}

impl Body {
    pub fn new(kind: BodyType, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    /// Serialize `value` as a JSON body.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, ProtocolError> {
        Ok(Self::new(BodyType::Json, serde_json::to_vec(value)?))
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(BodyType::Text, text.into())
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(BodyType::Binary, data)
    }

    pub fn kind(&self) -> BodyType {
        self.kind
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Body as UTF-8 text. Binary bodies are never interpreted as text.
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            BodyType::Binary => None,
            BodyType::Json | BodyType::Text => std::str::from_utf8(&self.data).ok(),
        }
    }

    /// Decode a JSON body into `T`.
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        if self.kind != BodyType::Json {
            return Err(ProtocolError::UnexpectedBody {
                expected: BodyType::Json,
                found: self.kind,
            });
        }
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// Anything that can be sent as an (optional) frame body.
pub trait IntoBody {
    fn into_body(self) -> Option<Body>;
}

impl IntoBody for Body {
    fn into_body(self) -> Option<Body> {
        Some(self)
    }
}

impl IntoBody for Option<Body> {
    fn into_body(self) -> Option<Body> {
        self
    }
}

impl IntoBody for () {
    fn into_body(self) -> Option<Body> {
        None
    }
}

impl IntoBody for &str {
    fn into_body(self) -> Option<Body> {
        Some(Body::text(self))
    }
}

impl IntoBody for String {
    fn into_body(self) -> Option<Body> {
        Some(Body::text(self))
    }
}

impl IntoBody for Vec<u8> {
    fn into_body(self) -> Option<Body> {
        Some(Body::binary(self))
    }
}

impl IntoBody for Bytes {
    fn into_body(self) -> Option<Body> {
        Some(Body::binary(self))
    }
}

impl IntoBody for serde_json::Value {
    fn into_body(self) -> Option<Body> {
        if self.is_null() {
            return None;
        }
        serde_json::to_vec(&self)
            .ok()
            .map(|data| Body::new(BodyType::Json, data))
    }
}

/// Frame sent by a peer to a server.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientFrame {
    pub method: Method,
    /// Present when the peer expects a reply.
    pub request_id: Option<u16>,
    pub url: String,
    pub headers: Option<Headers>,
    pub body: Option<Body>,
}

impl ClientFrame {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            request_id: None,
            url: url.into(),
            headers: None,
            body: None,
        }
    }

    pub fn with_request_id(mut self, id: u16) -> Self {
        self.request_id = Some(id);
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_body(mut self, body: impl IntoBody) -> Self {
        self.body = body.into_body();
        self
    }

    /// Handshake frame carrying the previous connection id, if any.
    pub fn handshake(previous_id: Option<&str>) -> Self {
        let frame = Self::new(Method::Meta, HANDSHAKE_PATH);
        match previous_id {
            Some(id) if !id.is_empty() => frame.with_body(id),
            _ => frame,
        }
    }

    pub fn is_handshake(&self) -> bool {
        self.method == Method::Meta && path_of(&self.url) == HANDSHAKE_PATH
    }
}

/// Frame sent by a server to a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerFrame {
    /// Server-assigned message id (three-byte prefix).
    pub correlation_id: u32,
    pub method: Method,
    pub status: u16,
    /// Request id of the peer frame this answers, if any.
    pub reply_to: Option<u16>,
    pub url: String,
    pub headers: Option<Headers>,
    pub body: Option<Body>,
}

impl ServerFrame {
    pub fn new(method: Method, url: impl Into<String>, status: u16) -> Self {
        Self {
            correlation_id: 0,
            method,
            status,
            reply_to: None,
            url: url.into(),
            headers: None,
            body: None,
        }
    }

    pub fn with_reply_to(mut self, request_id: Option<u16>) -> Self {
        self.reply_to = request_id;
        self
    }

    pub fn with_headers(mut self, headers: Option<Headers>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl IntoBody) -> Self {
        self.body = body.into_body();
        self
    }

    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }

    /// Status below 300.
    pub fn is_success(&self) -> bool {
        self.status < 300
    }

    pub fn is_handshake(&self) -> bool {
        self.method == Method::Meta && path_of(&self.url) == HANDSHAKE_PATH
    }
}

/// Strip the query string from a url.
pub fn path_of(url: &str) -> &str {
    url.split_once('?').map_or(url, |(path, _)| path)
}

/// Wire format of a server or transport, chosen once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// Radix-255 binary layout in binary WebSocket messages
    #[default]
    Binary,
    /// JSON objects in text WebSocket messages
    Json,
}

impl WireFormat {
    pub fn encode_client(&self, frame: &ClientFrame) -> Result<Bytes, ProtocolError> {
        match self {
            Self::Binary => binary::encode_client(frame),
            Self::Json => text::encode_client(frame),
        }
    }

    pub fn decode_client(&self, bytes: &[u8]) -> Option<ClientFrame> {
        match self {
            Self::Binary => binary::decode_client(bytes),
            Self::Json => text::decode_client(bytes),
        }
    }

    pub fn encode_server(&self, frame: &ServerFrame) -> Result<Bytes, ProtocolError> {
        match self {
            Self::Binary => binary::encode_server(frame),
            Self::Json => text::encode_server(frame),
        }
    }

    pub fn decode_server(&self, bytes: &[u8]) -> Option<ServerFrame> {
        match self {
            Self::Binary => binary::decode_server(bytes),
            Self::Json => text::decode_server(bytes),
        }
    }

    /// Wrap encoded bytes in the WebSocket message type of this format.
    pub fn to_message(&self, bytes: Bytes) -> Message {
        match self {
            Self::Binary => Message::Binary(bytes),
            Self::Json => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => Message::text(text),
                Err(_) => Message::Binary(bytes),
            },
        }
    }

    /// Frame bytes of a data message; `None` for control messages.
    pub fn payload(message: &Message) -> Option<&[u8]> {
        match message {
            Message::Binary(data) => Some(data.as_ref()),
            Message::Text(text) => Some(text.as_bytes()),
            _ => None,
        }
    }
}

impl FromStr for WireFormat {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binary" | "bin" => Ok(Self::Binary),
            "json" | "text" => Ok(Self::Json),
            other => Err(ProtocolError::UnknownWireFormat(other.to_string())),
        }
    }
}

/// Prefix an encoded frame with its target id for the distributor channel.
///
/// Layout: `[id_len:1][id][frame]`.
pub fn encode_envelope(target: &str, frame: &[u8]) -> Result<Bytes, ProtocolError> {
    let id = target.as_bytes();
    if id.len() > MAX_ENVELOPE_TARGET {
        return Err(ProtocolError::TargetTooLong(id.len()));
    }
    let mut buf = Vec::with_capacity(1 + id.len() + frame.len());
    buf.push(id.len() as u8);
    buf.extend_from_slice(id);
    buf.extend_from_slice(frame);
    Ok(Bytes::from(buf))
}

/// Split a channel message into its target id and the untouched frame bytes.
pub fn decode_envelope(message: &Bytes) -> Option<(String, Bytes)> {
    let id_len = *message.first()? as usize;
    let frame_start = 1 + id_len;
    if message.len() < frame_start {
        return None;
    }
    let id = std::str::from_utf8(&message[1..frame_start]).ok()?;
    Some((id.to_string(), message.slice(frame_start..)))
}

/// Split `value` into radix-255 `[high, low]`.
pub(crate) fn split_u16(value: usize, field: &'static str) -> Result<[u8; 2], ProtocolError> {
    if value > MAX_U16_FIELD as usize {
        return Err(ProtocolError::FieldOverflow { field, value });
    }
    Ok([(value / 255) as u8, (value % 255) as u8])
}

pub(crate) fn join_u16(high: u8, low: u8) -> u16 {
    u16::from(high) * 255 + u16::from(low)
}

/// Split a correlation id into three radix-255 digits, wrapping at 255³.
pub(crate) fn split_u24(value: u32) -> [u8; 3] {
    let value = value % CORRELATION_SPACE;
    [
        (value / (255 * 255)) as u8,
        ((value / 255) % 255) as u8,
        (value % 255) as u8,
    ]
}

pub(crate) fn join_u24(digits: [u8; 3]) -> u32 {
    u32::from(digits[0]) * 255 * 255 + u32::from(digits[1]) * 255 + u32::from(digits[2])
}

/// Parse a header object leniently: non-string scalar values are stringified.
pub(crate) fn parse_headers(json: &[u8]) -> Option<Headers> {
    let raw: BTreeMap<String, serde_json::Value> = serde_json::from_slice(json).ok()?;
    raw.into_iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(s) => Some((key, s)),
            serde_json::Value::Number(n) => Some((key, n.to_string())),
            serde_json::Value::Bool(b) => Some((key, b.to_string())),
            _ => None,
        })
        .collect()
}

/// Protocol errors. Only raised while encoding; decoding signals failure with `None`.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("{field} is {value}, above the two-byte field limit of 65279")]
    FieldOverflow { field: &'static str, value: usize },
    #[error("envelope target id is {0} bytes, the limit is 255")]
    TargetTooLong(usize),
    #[error("expected a {expected:?} body, found {found:?}")]
    UnexpectedBody { expected: BodyType, found: BodyType },
    #[error("unknown wire format: {0}")]
    UnknownWireFormat(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
