//! Binary frame codec for Backhaul tunnel connections.
//!
//! Frames travel as MessagePack maps inside binary WebSocket messages.
//! Two reserved text messages, `"ping"` and `"pong"`, sit outside the
//! framing and never carry a request id.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Maximum message size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Marks a response header the agent made up because its local call failed.
pub const AGENT_FAILURE_HEADER: &str = "x-backhaul-agent-failure";

/// Ordered header list, duplicates preserved.
pub type HeaderList = Vec<(String, String)>;

/// Request header frame (relay → agent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestHeader {
    pub request_id: String,
    pub method: String,
    /// Path and query, never an absolute URL.
    pub path: String,
    pub headers: HeaderList,
    /// No body follows.
    pub eof: bool,
}

/// Response header frame (agent → relay).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseHeader {
    pub request_id: String,
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderList,
    pub eof: bool,
}

impl ResponseHeader {
    /// The agent's answer when its local call failed.
    pub fn bad_gateway(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: 502,
            status_text: "Bad Gateway".into(),
            headers: vec![(AGENT_FAILURE_HEADER.into(), "local call failed".into())],
            eof: true,
        }
    }
}

/// Body chunk, in either direction.
///
/// `data` with `eof == false` is a chunk, `data` with `eof == true` is the
/// final chunk, and no `data` with `eof == true` ends the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyFrame {
    pub request_id: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_bytes"
    )]
    pub data: Option<Vec<u8>>,
    pub eof: bool,
}

impl BodyFrame {
    pub fn chunk(request_id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            request_id: request_id.into(),
            data: Some(data),
            eof: false,
        }
    }

    pub fn end(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            data: None,
            eof: true,
        }
    }
}

/// Cancels the in-flight local operation for a request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortFrame {
    pub request_id: String,
}

impl AbortFrame {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
        }
    }
}

/// Frames the relay sends to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RequestFrame {
    Header(RequestHeader),
    Body(BodyFrame),
    Abort(AbortFrame),
}

/// Frames an agent sends back to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResponseFrame {
    Header(ResponseHeader),
    Body(BodyFrame),
}

/// A frame that can cross a tunnel connection.
pub trait WireFrame: Serialize + DeserializeOwned + Send + 'static {
    fn request_id(&self) -> &str;

    fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|e| Error::Encode(e.to_string()))
    }

    fn try_decode(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))
    }

    /// Decode, dropping anything that is not a well-formed frame.
    fn decode(bytes: &[u8]) -> Option<Self> {
        match Self::try_decode(bytes) {
            Ok(frame) => Some(frame),
            Err(e) => {
                debug!(len = bytes.len(), "Dropping undecodable frame: {}", e);
                None
            }
        }
    }
}

impl WireFrame for RequestFrame {
    fn request_id(&self) -> &str {
        match self {
            RequestFrame::Header(h) => &h.request_id,
            RequestFrame::Body(b) => &b.request_id,
            RequestFrame::Abort(a) => &a.request_id,
        }
    }
}

impl WireFrame for ResponseFrame {
    fn request_id(&self) -> &str {
        match self {
            ResponseFrame::Header(h) => &h.request_id,
            ResponseFrame::Body(b) => &b.request_id,
        }
    }
}

impl From<BodyFrame> for RequestFrame {
    fn from(frame: BodyFrame) -> Self {
        RequestFrame::Body(frame)
    }
}

impl From<AbortFrame> for RequestFrame {
    fn from(frame: AbortFrame) -> Self {
        RequestFrame::Abort(frame)
    }
}

impl From<BodyFrame> for ResponseFrame {
    fn from(frame: BodyFrame) -> Self {
        ResponseFrame::Body(frame)
    }
}

/// Reserved text control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Ping,
    Pong,
}

impl Control {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "ping" => Some(Control::Ping),
            "pong" => Some(Control::Pong),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Control::Ping => "ping",
            Control::Pong => "pong",
        }
    }
}

/// Render a request counter the way ids appear on the wire (base 32, `0-9a-v`).
pub fn base32_id(mut n: u64) -> String {
    const DIGITS: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::with_capacity(13);
    while n > 0 {
        out.push(DIGITS[(n % 32) as usize]);
        n /= 32;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> RequestFrame {
        RequestFrame::Header(RequestHeader {
            request_id: "r1".into(),
            method: "GET".into(),
            path: "/foo?bar=1".into(),
            headers: vec![
                ("accept".into(), "text/plain".into()),
                ("cookie".into(), "a=1".into()),
                ("cookie".into(), "b=2".into()),
            ],
            eof: true,
        })
    }

    #[test]
    fn test_reencode_is_byte_identical() {
        let frames = vec![
            sample_header(),
            RequestFrame::Body(BodyFrame::chunk("r1", b"hello".to_vec())),
            RequestFrame::Body(BodyFrame::end("r1")),
            RequestFrame::Abort(AbortFrame { request_id: "r1".into() }),
        ];
        for frame in frames {
            let bytes = frame.encode().unwrap();
            let decoded = RequestFrame::try_decode(&bytes).unwrap();
            assert_eq!(decoded, frame);
            assert_eq!(decoded.encode().unwrap(), bytes);
        }
    }

    #[test]
    fn test_duplicate_headers_preserved() {
        let bytes = sample_header().encode().unwrap();
        let RequestFrame::Header(h) = RequestFrame::try_decode(&bytes).unwrap() else {
            panic!("expected header frame");
        };
        let cookies: Vec<_> = h.headers.iter().filter(|(k, _)| k == "cookie").collect();
        assert_eq!(cookies.len(), 2);
    }

    #[test]
    fn test_wire_shape_is_tagged_map() {
        let frame = ResponseFrame::Header(ResponseHeader {
            request_id: "r1".into(),
            status: 200,
            status_text: "OK".into(),
            headers: vec![("content-type".into(), "text/plain".into())],
            eof: false,
        });
        let bytes = frame.encode().unwrap();
        let value: serde_json::Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "header");
        assert_eq!(value["requestId"], "r1");
        assert_eq!(value["statusText"], "OK");
        assert_eq!(value["headers"][0][0], "content-type");
    }

    #[test]
    fn test_absent_payload_is_omitted() {
        let bytes = ResponseFrame::Body(BodyFrame::end("r9")).encode().unwrap();
        let value: serde_json::Value = rmp_serde::from_slice(&bytes).unwrap();
        assert!(value.get("data").is_none());
        let decoded = ResponseFrame::try_decode(&bytes).unwrap();
        assert_eq!(decoded, ResponseFrame::Body(BodyFrame::end("r9")));
    }

    #[test]
    fn test_malformed_payload_is_dropped() {
        assert!(RequestFrame::decode(b"not msgpack at all").is_none());
        // A msgpack string is well-formed msgpack but not a frame.
        let bytes = rmp_serde::to_vec("ping").unwrap();
        assert!(RequestFrame::decode(&bytes).is_none());
        // Unknown tag
        let bytes = rmp_serde::to_vec_named(&serde_json::json!({"type": "nope", "requestId": "x"})).unwrap();
        assert!(ResponseFrame::decode(&bytes).is_none());
    }

    #[test]
    fn test_control_messages() {
        assert_eq!(Control::parse("ping"), Some(Control::Ping));
        assert_eq!(Control::parse("pong"), Some(Control::Pong));
        assert_eq!(Control::parse("hello"), None);
        assert_eq!(Control::Pong.as_str(), "pong");
    }

    #[test]
    fn test_bad_gateway_is_marked() {
        let header = ResponseHeader::bad_gateway("r3");
        assert_eq!(header.status, 502);
        assert!(header.eof);
        assert!(header.headers.iter().any(|(k, _)| k == AGENT_FAILURE_HEADER));
    }

    #[test]
    fn test_base32_id() {
        assert_eq!(base32_id(0), "0");
        assert_eq!(base32_id(1), "1");
        assert_eq!(base32_id(31), "v");
        assert_eq!(base32_id(32), "10");
        assert_eq!(base32_id(1025), "101");
    }
}
