//! Binary codec for the radix-255 frame layouts.
//!
//! Encoding computes the exact output length first and writes into a single
//! allocation. Decoding never panics: any truncation or invalid field yields
//! `None`.

use bytes::Bytes;

use super::{
    join_u16, join_u24, parse_headers, split_u16, split_u24, Body, BodyType, ClientFrame,
    Headers, Method, ProtocolError, ServerFrame,
};

const CLIENT_FIXED: usize = 3 + 2;
const SERVER_FIXED: usize = 3 + 1 + 1 + 2 + 1 + 2;

pub fn encode_client(frame: &ClientFrame) -> Result<Bytes, ProtocolError> {
    let headers = encode_headers(frame.headers.as_ref())?;
    let url = frame.url.as_bytes();
    let url_len = split_u16(url.len(), "url length")?;

    let mut len = CLIENT_FIXED + url.len() + body_len(frame.body.as_ref());
    if frame.request_id.is_some() {
        len += 2;
    }
    if let Some(h) = &headers {
        len += 2 + h.len();
    }

    let mut buf = Vec::with_capacity(len);
    buf.push(frame.method as u8);
    buf.push(frame.request_id.is_some() as u8);
    buf.push(headers.is_some() as u8);
    if let Some(id) = frame.request_id {
        buf.extend_from_slice(&split_u16(id as usize, "request id")?);
    }
    buf.extend_from_slice(&url_len);
    buf.extend_from_slice(url);
    write_tail(&mut buf, headers.as_deref(), frame.body.as_ref())?;
    debug_assert_eq!(buf.len(), len);
    Ok(Bytes::from(buf))
}

pub fn decode_client(bytes: &[u8]) -> Option<ClientFrame> {
    let mut reader = Reader::new(bytes);
    let method = Method::from_u8(reader.u8()?)?;
    let has_id = reader.flag()?;
    let has_headers = reader.flag()?;
    let request_id = if has_id { Some(reader.u16()?) } else { None };
    let url = reader.url()?;
    let headers = if has_headers { Some(reader.headers()?) } else { None };
    let body = reader.body()?;
    Some(ClientFrame {
        method,
        request_id,
        url,
        headers,
        body,
    })
}

pub fn encode_server(frame: &ServerFrame) -> Result<Bytes, ProtocolError> {
    let headers = encode_headers(frame.headers.as_ref())?;
    let url = frame.url.as_bytes();
    let url_len = split_u16(url.len(), "url length")?;
    let status = split_u16(frame.status as usize, "status")?;

    let mut len = SERVER_FIXED + url.len() + body_len(frame.body.as_ref());
    if frame.reply_to.is_some() {
        len += 2;
    }
    if let Some(h) = &headers {
        len += 2 + h.len();
    }

    let mut buf = Vec::with_capacity(len);
    buf.extend_from_slice(&split_u24(frame.correlation_id));
    buf.push(frame.method as u8);
    buf.push(frame.reply_to.is_some() as u8);
    buf.extend_from_slice(&status);
    buf.push(headers.is_some() as u8);
    if let Some(id) = frame.reply_to {
        buf.extend_from_slice(&split_u16(id as usize, "reply id")?);
    }
    buf.extend_from_slice(&url_len);
    buf.extend_from_slice(url);
    write_tail(&mut buf, headers.as_deref(), frame.body.as_ref())?;
    debug_assert_eq!(buf.len(), len);
    Ok(Bytes::from(buf))
}

pub fn decode_server(bytes: &[u8]) -> Option<ServerFrame> {
    let mut reader = Reader::new(bytes);
    let correlation_id = join_u24([reader.u8()?, reader.u8()?, reader.u8()?]);
    let method = Method::from_u8(reader.u8()?)?;
    let has_reply = reader.flag()?;
    let status = reader.u16()?;
    let has_headers = reader.flag()?;
    let reply_to = if has_reply { Some(reader.u16()?) } else { None };
    let url = reader.url()?;
    let headers = if has_headers { Some(reader.headers()?) } else { None };
    let body = reader.body()?;
    Some(ServerFrame {
        correlation_id,
        method,
        status,
        reply_to,
        url,
        headers,
        body,
    })
}

fn encode_headers(headers: Option<&Headers>) -> Result<Option<Vec<u8>>, ProtocolError> {
    headers.map(serde_json::to_vec).transpose().map_err(Into::into)
}

fn body_len(body: Option<&Body>) -> usize {
    body.map_or(0, |b| 1 + b.len())
}

fn write_tail(buf: &mut Vec<u8>, headers: Option<&[u8]>, body: Option<&Body>) -> Result<(), ProtocolError> {
    if let Some(h) = headers {
        buf.extend_from_slice(&split_u16(h.len(), "header length")?);
        buf.extend_from_slice(h);
    }
    if let Some(body) = body {
        buf.push(body.kind() as u8);
        buf.extend_from_slice(body.data());
    }
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    /// Presence flag: 0 or 1, anything else is malformed.
    fn flag(&mut self) -> Option<bool> {
        match self.u8()? {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }
    }

    fn u16(&mut self) -> Option<u16> {
        let b = self.take(2)?;
        Some(join_u16(b[0], b[1]))
    }

    fn url(&mut self) -> Option<String> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw).ok().map(str::to_owned)
    }

    fn headers(&mut self) -> Option<Headers> {
        let len = self.u16()? as usize;
        parse_headers(self.take(len)?)
    }

    /// Optional body: absent when no bytes remain.
    fn body(&mut self) -> Option<Option<Body>> {
        let Some(kind) = self.u8() else {
            return Some(None);
        };
        let kind = BodyType::from_u8(kind)?;
        let data = &self.bytes[self.pos..];
        self.pos = self.bytes.len();
        Some(Some(Body::new(kind, Bytes::copy_from_slice(data))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_minimal_client_frame_bytes() {
        let frame = ClientFrame::new(Method::Get, "/a");
        let bytes = encode_client(&frame).unwrap();
        assert_eq!(&bytes[..], &[0, 0, 0, 0, 2, b'/', b'a']);
        assert_eq!(decode_client(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_client_frame_with_id_headers_body() {
        let frame = ClientFrame::new(Method::Post, "/resource/1?x=1")
            .with_request_id(300)
            .with_headers(headers(&[("auth", "token")]))
            .with_body(Body::json(&serde_json::json!({"n": 1})).unwrap());
        let bytes = encode_client(&frame).unwrap();
        assert_eq!(&bytes[..3], &[1, 1, 1]);
        assert_eq!(&bytes[3..5], &[1, 45]);
        assert_eq!(decode_client(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_server_frame_bytes() {
        let frame = ServerFrame::new(Method::Get, "/r", 200)
            .with_reply_to(Some(7))
            .with_body("ok");
        let mut frame = frame;
        frame.correlation_id = 256;
        let bytes = encode_server(&frame).unwrap();
        // correlation 256 = [0, 1, 1], status 200 = [0, 200]
        assert_eq!(&bytes[..10], &[0, 1, 1, 0, 1, 0, 200, 0, 0, 7]);
        assert_eq!(decode_server(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_server_frame_without_reply() {
        let frame = ServerFrame::new(Method::Put, "/room/1", 404)
            .with_headers(Some(headers(&[("a", "b")])))
            .with_body(Body::binary(vec![0u8, 1, 2, 255]));
        let decoded = decode_server(&encode_server(&frame).unwrap()).unwrap();
        assert!(!decoded.is_reply());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_empty_body_differs_from_no_body() {
        let empty = ClientFrame::new(Method::Get, "/").with_body("");
        let bytes = encode_client(&empty).unwrap();
        let decoded = decode_client(&bytes).unwrap();
        assert_eq!(decoded.body.unwrap().kind(), BodyType::Text);

        let none = ClientFrame::new(Method::Get, "/");
        assert!(decode_client(&encode_client(&none).unwrap()).unwrap().body.is_none());
    }

    #[test]
    fn test_url_too_long() {
        let frame = ClientFrame::new(Method::Get, "x".repeat(65_280));
        assert!(matches!(
            encode_client(&frame),
            Err(ProtocolError::FieldOverflow { .. })
        ));
    }

    #[test]
    fn test_status_too_large() {
        let frame = ServerFrame::new(Method::Get, "/", 65_535);
        assert!(encode_server(&frame).is_err());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        // unknown method
        assert!(decode_client(&[9, 0, 0, 0, 0]).is_none());
        // truncated url
        assert!(decode_client(&[0, 0, 0, 0, 5, b'/']).is_none());
        // unknown body type
        assert!(decode_client(&[0, 0, 0, 0, 1, b'/', 7, 1]).is_none());
        // invalid utf-8 url
        assert!(decode_client(&[0, 0, 0, 0, 1, 0xFF]).is_none());
        // bad flag
        assert!(decode_client(&[0, 2, 0, 0, 0]).is_none());
        // truncated header block
        assert!(decode_client(&[0, 0, 1, 0, 1, b'/', 0, 9, b'{']).is_none());
        assert!(decode_server(&[0, 0]).is_none());
        assert!(decode_client(&[]).is_none());
    }

    #[test]
    fn test_decode_numeric_headers() {
        let json = br#"{"retry":3}"#;
        let mut bytes = vec![0, 0, 1, 0, 1, b'/', 0, json.len() as u8];
        bytes.extend_from_slice(json);
        let frame = decode_client(&bytes).unwrap();
        assert_eq!(frame.headers.unwrap()["retry"], "3");
    }

    #[test]
    fn test_correlation_wraps() {
        let mut frame = ServerFrame::new(Method::Get, "/", 200);
        frame.correlation_id = super::super::CORRELATION_SPACE + 5;
        let decoded = decode_server(&encode_server(&frame).unwrap()).unwrap();
        assert_eq!(decoded.correlation_id, 5);
    }
}
