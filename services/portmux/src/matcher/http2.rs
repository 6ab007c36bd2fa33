//! HTTP/2 detection.
//!
//! [`http2`] only checks the client connection preface. The header-field
//! matchers go further: after the preface they walk the frame stream, reply
//! to the client's SETTINGS if asked to (some clients, gRPC-Java among them,
//! send no HEADERS until the server's SETTINGS arrives), reassemble the first
//! header block from HEADERS and CONTINUATION frames and decode it with HPACK.
//!
//! Frame layout (RFC 9113 section 4.1):
//!
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                   |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+-------------------------------+
//! |R|                 Stream Identifier (31)                      |
//! +=+=============================================================+
//! |                   Frame Payload (0...)                      ...
//! +---------------------------------------------------------------+
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use super::Matcher;
use crate::conn::Conn;

/// The fixed HTTP/2 client connection preface.
pub const HTTP2_CLIENT_PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_HEADER_LEN: usize = 9;

/// SETTINGS_MAX_FRAME_SIZE before any SETTINGS exchange.
const DEFAULT_MAX_FRAME_SIZE: usize = 16_384;

/// Upper bound on a reassembled header block.
const MAX_HEADER_BLOCK: usize = 64 * 1024;

const FRAME_HEADERS: u8 = 0x1;
const FRAME_SETTINGS: u8 = 0x4;
const FRAME_CONTINUATION: u8 = 0x9;

const FLAG_ACK: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

/// Empty server SETTINGS frame.
const SERVER_SETTINGS: [u8; FRAME_HEADER_LEN] = [0, 0, 0, FRAME_SETTINGS, 0, 0, 0, 0, 0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    length: usize,
    kind: u8,
    flags: u8,
    stream_id: u32,
}

impl FrameHeader {
    fn parse(buf: &[u8; FRAME_HEADER_LEN]) -> Self {
        Self {
            length: (buf[0] as usize) << 16 | (buf[1] as usize) << 8 | buf[2] as usize,
            kind: buf[3],
            flags: buf[4],
            stream_id: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff,
        }
    }

    fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

async fn has_preface(conn: &mut Conn) -> bool {
    let mut buf = [0u8; HTTP2_CLIENT_PREFACE.len()];
    conn.read_exact(&mut buf).await.is_ok() && &buf == HTTP2_CLIENT_PREFACE
}

/// Matches the HTTP/2 client connection preface.
#[derive(Debug, Clone, Copy, Default)]
pub struct Http2PrefaceMatcher;

#[async_trait]
impl Matcher for Http2PrefaceMatcher {
    async fn matches(&self, conn: &mut Conn) -> bool {
        has_preface(conn).await
    }
}

/// Match HTTP/2 prior-knowledge connections by their preface.
pub fn http2() -> Http2PrefaceMatcher {
    Http2PrefaceMatcher
}

type HeaderPredicate = Arc<dyn Fn(&HashMap<String, String>) -> bool + Send + Sync>;

/// Matches on the decoded fields of the first HTTP/2 header block.
#[derive(Clone)]
pub struct Http2HeaderMatcher {
    names: Option<HashSet<String>>,
    predicate: HeaderPredicate,
    send_settings: bool,
}

impl fmt::Debug for Http2HeaderMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http2HeaderMatcher")
            .field("names", &self.names)
            .field("send_settings", &self.send_settings)
            .finish_non_exhaustive()
    }
}

impl Http2HeaderMatcher {
    /// Evaluate `predicate` over every decoded header field.
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&HashMap<String, String>) -> bool + Send + Sync + 'static,
    {
        Self {
            names: None,
            predicate: Arc::new(predicate),
            send_settings: false,
        }
    }

    /// Only collect the given header names (lowercase, as HTTP/2 requires).
    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = Some(
            names
                .into_iter()
                .map(|n| n.into().to_ascii_lowercase())
                .collect(),
        );
        self
    }

    /// Answer the client's SETTINGS with an empty server SETTINGS frame.
    pub fn send_settings(mut self, enabled: bool) -> Self {
        self.send_settings = enabled;
        self
    }

    fn evaluate(&self, block: &[u8]) -> bool {
        let mut decoder = hpack::Decoder::new();
        let fields = match decoder.decode(block) {
            Ok(fields) => fields,
            Err(e) => {
                trace!(error = ?e, "HPACK decode failed");
                return false;
            }
        };

        let mut collected = HashMap::new();
        for (name, value) in fields {
            let name = String::from_utf8_lossy(&name).to_ascii_lowercase();
            if let Some(names) = &self.names {
                if !names.contains(&name) {
                    continue;
                }
            }
            collected
                .entry(name)
                .or_insert_with(|| String::from_utf8_lossy(&value).into_owned());
        }

        (self.predicate)(&collected)
    }
}

#[async_trait]
impl Matcher for Http2HeaderMatcher {
    async fn matches(&self, conn: &mut Conn) -> bool {
        if !has_preface(conn).await {
            return false;
        }

        let mut block = Vec::new();
        let mut block_stream = None;

        loop {
            let mut raw = [0u8; FRAME_HEADER_LEN];
            if conn.read_exact(&mut raw).await.is_err() {
                return false;
            }
            let header = FrameHeader::parse(&raw);
            if header.length > DEFAULT_MAX_FRAME_SIZE {
                return false;
            }
            let mut payload = vec![0u8; header.length];
            if conn.read_exact(&mut payload).await.is_err() {
                return false;
            }

            match header.kind {
                FRAME_SETTINGS => {
                    if block_stream.is_some() {
                        return false;
                    }
                    if !header.has(FLAG_ACK) && self.send_settings {
                        if conn.write_all(&SERVER_SETTINGS).await.is_err()
                            || conn.flush().await.is_err()
                        {
                            return false;
                        }
                        trace!("Sent SETTINGS to elicit HEADERS");
                    }
                    continue;
                }
                FRAME_HEADERS => {
                    if block_stream.is_some() {
                        return false;
                    }
                    let Some(fragment) = headers_fragment(&header, &payload) else {
                        return false;
                    };
                    block.extend_from_slice(fragment);
                    block_stream = Some(header.stream_id);
                }
                FRAME_CONTINUATION => {
                    if block_stream != Some(header.stream_id) {
                        return false;
                    }
                    block.extend_from_slice(&payload);
                }
                _ => {
                    // Nothing may interleave with an open header block.
                    if block_stream.is_some() {
                        return false;
                    }
                    continue;
                }
            }

            if block.len() > MAX_HEADER_BLOCK {
                return false;
            }
            if header.has(FLAG_END_HEADERS) {
                return self.evaluate(&block);
            }
        }
    }
}

/// Strip padding and priority fields from a HEADERS payload.
fn headers_fragment<'a>(header: &FrameHeader, payload: &'a [u8]) -> Option<&'a [u8]> {
    let mut start = 0;
    let mut end = payload.len();

    if header.has(FLAG_PADDED) {
        let pad = *payload.first()? as usize;
        start += 1;
        end = end.checked_sub(pad)?;
    }
    if header.has(FLAG_PRIORITY) {
        start += 5;
    }

    if start > end {
        return None;
    }
    Some(&payload[start..end])
}

/// Match when header `name` equals `value`.
pub fn http2_header_field(name: impl Into<String>, value: impl Into<String>) -> Http2HeaderMatcher {
    field_equals(name.into(), value.into())
}

/// [`http2_header_field`] that also answers the client's SETTINGS.
pub fn http2_header_field_send_settings(
    name: impl Into<String>,
    value: impl Into<String>,
) -> Http2HeaderMatcher {
    field_equals(name.into(), value.into()).send_settings(true)
}

/// Match when header `name` starts with `prefix`.
pub fn http2_header_field_prefix(
    name: impl Into<String>,
    prefix: impl Into<String>,
) -> Http2HeaderMatcher {
    field_with(name.into(), prefix.into(), |value, prefix| {
        value.starts_with(prefix)
    })
}

/// [`http2_header_field_prefix`] that also answers the client's SETTINGS.
pub fn http2_header_field_prefix_send_settings(
    name: impl Into<String>,
    prefix: impl Into<String>,
) -> Http2HeaderMatcher {
    http2_header_field_prefix(name, prefix).send_settings(true)
}

/// Match on a caller-supplied predicate over the headers in `names`.
pub fn http2_header_field_fn<I, S, F>(names: I, predicate: F) -> Http2HeaderMatcher
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
    F: Fn(&HashMap<String, String>) -> bool + Send + Sync + 'static,
{
    Http2HeaderMatcher::new(predicate).with_names(names)
}

/// Match gRPC requests (`content-type: application/grpc`).
pub fn grpc() -> Http2HeaderMatcher {
    http2_header_field_send_settings("content-type", "application/grpc")
}

fn field_equals(name: String, expected: String) -> Http2HeaderMatcher {
    field_with(name, expected, |value, expected| value == expected)
}

fn field_with(
    name: String,
    expected: String,
    compare: fn(&str, &str) -> bool,
) -> Http2HeaderMatcher {
    let key = name.to_ascii_lowercase();
    let lookup = key.clone();
    Http2HeaderMatcher::new(move |headers| {
        headers
            .get(&lookup)
            .is_some_and(|value| compare(value, &expected))
    })
    .with_names([key])
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{conn_with, run};
    use super::*;

    const FRAME_DATA: u8 = 0x0;
    const FLAG_END_STREAM: u8 = 0x1;

    fn frame(kind: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
        let len = payload.len();
        let mut out = vec![(len >> 16) as u8, (len >> 8) as u8, len as u8, kind, flags];
        out.extend_from_slice(&stream_id.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn encode(headers: &[(&str, &str)]) -> Vec<u8> {
        let mut encoder = hpack::Encoder::new();
        encoder.encode(&headers.iter().map(|(n, v)| (n.as_bytes().to_vec(), v.as_bytes().to_vec())).collect())
    }

    fn client_settings() -> Vec<u8> {
        // SETTINGS_MAX_CONCURRENT_STREAMS = 100
        frame(FRAME_SETTINGS, 0, 0, &[0x00, 0x03, 0x00, 0x00, 0x00, 0x64])
    }

    fn grpc_request(content_type: &str) -> Vec<u8> {
        let block = encode(&[
            (":method", "POST"),
            (":scheme", "http"),
            (":path", "/helloworld.Greeter/SayHello"),
            (":authority", "localhost"),
            ("content-type", content_type),
            ("te", "trailers"),
        ]);
        let mut stream = HTTP2_CLIENT_PREFACE.to_vec();
        stream.extend(client_settings());
        stream.extend(frame(FRAME_HEADERS, FLAG_END_HEADERS, 1, &block));
        stream
    }

    #[test]
    fn test_frame_header_parse() {
        let header = FrameHeader::parse(&[0x00, 0x40, 0x00, 0x01, 0x05, 0x80, 0x00, 0x00, 0x03]);
        assert_eq!(header.length, 16_384);
        assert_eq!(header.kind, FRAME_HEADERS);
        assert!(header.has(FLAG_END_HEADERS));
        assert!(header.has(FLAG_END_STREAM));
        assert_eq!(header.stream_id, 3);
    }

    #[test]
    fn test_headers_fragment_padding_and_priority() {
        let header = FrameHeader {
            length: 0,
            kind: FRAME_HEADERS,
            flags: FLAG_PADDED | FLAG_PRIORITY,
            stream_id: 1,
        };
        let payload = [2, 0, 0, 0, 0, 16, b'a', b'b', 0, 0];
        assert_eq!(headers_fragment(&header, &payload), Some(&b"ab"[..]));

        let bad = [9, 1, 2];
        assert_eq!(headers_fragment(&header, &bad), None);
    }

    #[tokio::test]
    async fn test_http2_preface() {
        let mut conn = conn_with(HTTP2_CLIENT_PREFACE).await;
        assert!(run(&http2(), &mut conn).await);

        let mut conn = conn_with(b"GET / HTTP/1.1\r\n\r\n").await;
        assert!(!run(&http2(), &mut conn).await);
    }

    #[tokio::test]
    async fn test_header_field_matches() {
        let matcher = http2_header_field("content-type", "application/grpc");
        let mut conn = conn_with(&grpc_request("application/grpc")).await;
        assert!(run(&matcher, &mut conn).await);

        let mut conn = conn_with(&grpc_request("application/json")).await;
        assert!(!run(&matcher, &mut conn).await);
    }

    #[tokio::test]
    async fn test_header_field_prefix() {
        let matcher = http2_header_field_prefix("content-type", "application/grpc");
        let mut conn = conn_with(&grpc_request("application/grpc+proto")).await;
        assert!(run(&matcher, &mut conn).await);
    }

    #[tokio::test]
    async fn test_header_block_split_across_continuation() {
        let block = encode(&[
            (":method", "GET"),
            (":path", "/"),
            ("x-tenant", "blue"),
        ]);
        let (first, rest) = block.split_at(block.len() / 2);

        let mut stream = HTTP2_CLIENT_PREFACE.to_vec();
        stream.extend(client_settings());
        stream.extend(frame(FRAME_HEADERS, FLAG_END_STREAM, 1, first));
        stream.extend(frame(FRAME_CONTINUATION, FLAG_END_HEADERS, 1, rest));

        let matcher = http2_header_field_fn(["x-tenant"], |headers| {
            headers.get("x-tenant").map(String::as_str) == Some("blue")
                && !headers.contains_key(":path")
        });
        let mut conn = conn_with(&stream).await;
        assert!(run(&matcher, &mut conn).await);
    }

    #[tokio::test]
    async fn test_collect_all_headers() {
        let matcher = Http2HeaderMatcher::new(|headers| {
            headers.get(":method").map(String::as_str) == Some("POST") && headers.len() == 6
        });
        let mut conn = conn_with(&grpc_request("application/grpc")).await;
        assert!(run(&matcher, &mut conn).await);
    }

    #[tokio::test]
    async fn test_frame_between_headers_and_continuation_fails() {
        let block = encode(&[(":method", "GET"), (":path", "/")]);
        let mut stream = HTTP2_CLIENT_PREFACE.to_vec();
        stream.extend(frame(FRAME_HEADERS, 0, 1, &block));
        stream.extend(frame(FRAME_DATA, 0, 1, b"x"));

        let matcher = Http2HeaderMatcher::new(|_| true);
        let mut conn = conn_with(&stream).await;
        assert!(!run(&matcher, &mut conn).await);
    }

    #[tokio::test]
    async fn test_oversized_frame_fails() {
        let mut stream = HTTP2_CLIENT_PREFACE.to_vec();
        stream.extend_from_slice(&[0x01, 0x00, 0x00, FRAME_HEADERS, 0, 0, 0, 0, 1]);

        let matcher = Http2HeaderMatcher::new(|_| true);
        let mut conn = conn_with(&stream).await;
        assert!(!run(&matcher, &mut conn).await);
    }

    #[tokio::test]
    async fn test_grpc_answers_settings() {
        let block = encode(&[
            (":method", "POST"),
            (":path", "/svc/Method"),
            ("content-type", "application/grpc"),
        ]);
        let mock = tokio_test::io::Builder::new()
            .read(HTTP2_CLIENT_PREFACE)
            .read(&client_settings())
            .write(&SERVER_SETTINGS)
            .read(&frame(FRAME_HEADERS, FLAG_END_HEADERS, 1, &block))
            .build();

        let mut conn = Conn::new(mock);
        assert!(run(&grpc(), &mut conn).await);
    }

    #[tokio::test]
    async fn test_settings_ack_is_not_answered() {
        let block = encode(&[("content-type", "application/grpc")]);
        let mock = tokio_test::io::Builder::new()
            .read(HTTP2_CLIENT_PREFACE)
            .read(&frame(FRAME_SETTINGS, FLAG_ACK, 0, &[]))
            .read(&frame(FRAME_HEADERS, FLAG_END_HEADERS, 1, &block))
            .build();

        let mut conn = Conn::new(mock);
        assert!(run(&grpc(), &mut conn).await);
    }
}
