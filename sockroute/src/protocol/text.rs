//! JSON codec for text WebSocket messages.
//!
//! ```json
//! {"method":"GET","id":3,"url":"/resource/1","headers":{"a":"b"},
//!  "body":{"type":"json","data":{"n":1}}}
//! ```
//!
//! Server frames add `correlation`, `status` and `replyTo`. Binary bodies
//! are carried as arrays of byte values.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{Body, BodyType, ClientFrame, Headers, Method, ProtocolError, ServerFrame, MAX_U16_FIELD};

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextClientFrame {
    method: Method,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<u16>,
    url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    headers: Option<Headers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<TextBody>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextServerFrame {
    #[serde(default)]
    correlation: u32,
    method: Method,
    status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<u16>,
    url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    headers: Option<Headers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<TextBody>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
enum TextBody {
    Json(serde_json::Value),
    Text(String),
    Binary(Vec<u8>),
}

impl TextBody {
    fn from_body(body: &Body) -> Result<Self, ProtocolError> {
        Ok(match body.kind() {
            BodyType::Json => Self::Json(serde_json::from_slice(body.data())?),
            BodyType::Text => Self::Text(String::from_utf8_lossy(body.data()).into_owned()),
            BodyType::Binary => Self::Binary(body.data().to_vec()),
        })
    }

    fn into_body(self) -> Option<Body> {
        Some(match self {
            Self::Json(value) => Body::new(BodyType::Json, serde_json::to_vec(&value).ok()?),
            Self::Text(text) => Body::text(text),
            Self::Binary(data) => Body::binary(Bytes::from(data)),
        })
    }
}

fn check_id(id: Option<u16>, field: &'static str) -> Result<(), ProtocolError> {
    match id {
        Some(id) if u32::from(id) > MAX_U16_FIELD => Err(ProtocolError::FieldOverflow {
            field,
            value: id as usize,
        }),
        _ => Ok(()),
    }
}

pub fn encode_client(frame: &ClientFrame) -> Result<Bytes, ProtocolError> {
    check_id(frame.request_id, "request id")?;
    let wire = TextClientFrame {
        method: frame.method,
        id: frame.request_id,
        url: frame.url.clone(),
        headers: frame.headers.clone(),
        body: frame.body.as_ref().map(TextBody::from_body).transpose()?,
    };
    Ok(Bytes::from(serde_json::to_vec(&wire)?))
}

pub fn decode_client(bytes: &[u8]) -> Option<ClientFrame> {
    let wire: TextClientFrame = serde_json::from_slice(bytes).ok()?;
    let body = match wire.body {
        Some(body) => Some(body.into_body()?),
        None => None,
    };
    Some(ClientFrame {
        method: wire.method,
        request_id: wire.id,
        url: wire.url,
        headers: wire.headers,
        body,
    })
}

pub fn encode_server(frame: &ServerFrame) -> Result<Bytes, ProtocolError> {
    check_id(frame.reply_to, "reply id")?;
    let wire = TextServerFrame {
        correlation: frame.correlation_id % super::CORRELATION_SPACE,
        method: frame.method,
        status: frame.status,
        reply_to: frame.reply_to,
        url: frame.url.clone(),
        headers: frame.headers.clone(),
        body: frame.body.as_ref().map(TextBody::from_body).transpose()?,
    };
    Ok(Bytes::from(serde_json::to_vec(&wire)?))
}

pub fn decode_server(bytes: &[u8]) -> Option<ServerFrame> {
    let wire: TextServerFrame = serde_json::from_slice(bytes).ok()?;
    let body = match wire.body {
        Some(body) => Some(body.into_body()?),
        None => None,
    };
    Some(ServerFrame {
        correlation_id: wire.correlation,
        method: wire.method,
        status: wire.status,
        reply_to: wire.reply_to,
        url: wire.url,
        headers: wire.headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_json_shape() {
        let frame = ClientFrame::new(Method::Get, "/resource/1")
            .with_request_id(3)
            .with_body(Body::json(&serde_json::json!({"n": 1})).unwrap());
        let bytes = encode_client(&frame).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["method"], "GET");
        assert_eq!(value["id"], 3);
        assert_eq!(value["body"]["type"], "json");
        assert_eq!(value["body"]["data"]["n"], 1);
        assert!(value.get("headers").is_none());
    }

    #[test]
    fn test_client_decode() {
        let raw = br#"{"method":"POST","url":"/x","body":{"type":"text","data":"hi"}}"#;
        let frame = decode_client(raw).unwrap();
        assert_eq!(frame.method, Method::Post);
        assert_eq!(frame.request_id, None);
        assert_eq!(frame.body.unwrap().as_text(), Some("hi"));
    }

    #[test]
    fn test_server_frame_roundtrip() {
        let mut frame = ServerFrame::new(Method::Meta, "/connection", 200)
            .with_reply_to(Some(12))
            .with_body(Body::binary(vec![1u8, 2, 3]));
        frame.correlation_id = 42;
        let bytes = encode_server(&frame).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["replyTo"], 12);
        assert_eq!(decode_server(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(decode_client(b"{").is_none());
        assert!(decode_client(br#"{"method":"FETCH","url":"/"}"#).is_none());
        assert!(decode_client(br#"{"method":"GET","url":"/","body":{"type":"xml","data":""}}"#).is_none());
        assert!(decode_server(br#"{"method":"GET","url":"/"}"#).is_none());
    }

    #[test]
    fn test_request_id_limit() {
        let frame = ClientFrame::new(Method::Get, "/").with_request_id(65_280);
        assert!(encode_client(&frame).is_err());
    }
}
