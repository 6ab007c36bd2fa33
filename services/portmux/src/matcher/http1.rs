//! HTTP/1.x request detection.
//!
//! The strict matcher parses the request line and header block within
//! [`HTTP1_MAX_READ`] bytes and accepts any `HTTP/1.x` version. The fast
//! variant only checks for a known method name at the start of the stream.

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::trace;

use super::prefix::PrefixMatcher;
use super::Matcher;
use crate::conn::Conn;

/// Maximum bytes read while looking for the end of the request head.
pub const HTTP1_MAX_READ: usize = 4096;

/// Request methods recognized by [`http1_fast`].
pub const HTTP_METHODS: &[&str] = &[
    "OPTIONS", "GET", "HEAD", "POST", "PUT", "DELETE", "TRACE", "CONNECT", "PATCH",
];

/// Parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RequestHead {
    method: String,
    target: String,
    version: (u32, u32),
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Strict HTTP/1 matcher, optionally requiring a header value.
#[derive(Debug, Clone, Default)]
pub struct Http1Matcher {
    header: Option<(String, String)>,
}

#[async_trait]
impl Matcher for Http1Matcher {
    async fn matches(&self, conn: &mut Conn) -> bool {
        let Some(raw) = read_request_head(conn).await else {
            return false;
        };
        let Some(head) = parse_request_head(&raw) else {
            return false;
        };
        trace!(
            method = %head.method,
            target = %head.target,
            major = head.version.0,
            minor = head.version.1,
            "Parsed HTTP request head"
        );
        if head.version.0 != 1 {
            return false;
        }

        match &self.header {
            None => true,
            Some((name, value)) => head.header(name) == Some(value.as_str()),
        }
    }
}

/// Match a well-formed HTTP/1.x request head.
pub fn http1() -> Http1Matcher {
    Http1Matcher::default()
}

/// Match an HTTP/1.x request carrying header `name` with exactly `value`.
///
/// Header names compare case-insensitively.
pub fn http1_header_field(name: impl Into<String>, value: impl Into<String>) -> Http1Matcher {
    Http1Matcher {
        header: Some((name.into(), value.into())),
    }
}

/// Match streams that start with a standard HTTP method name.
pub fn http1_fast() -> PrefixMatcher {
    PrefixMatcher::new(HTTP_METHODS.iter().map(|m| m.as_bytes()))
}

/// Like [`http1_fast`], also accepting `extra` method names (WebDAV etc.).
pub fn http1_fast_with<I, S>(extra: I) -> PrefixMatcher
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let methods = HTTP_METHODS
        .iter()
        .map(|m| m.to_string())
        .chain(extra.into_iter().map(|m| m.as_ref().to_string()));
    PrefixMatcher::new(methods.collect::<Vec<_>>())
}

/// Read until the blank line ending the head, the cap, or a definite reject.
async fn read_request_head(conn: &mut Conn) -> Option<Vec<u8>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if let Some(end) = find_head_end(&buf) {
            buf.truncate(end);
            return Some(buf);
        }
        if !plausible_prefix(&buf) || buf.len() >= HTTP1_MAX_READ {
            return None;
        }

        let want = (HTTP1_MAX_READ - buf.len()).min(chunk.len());
        match conn.read(&mut chunk[..want]).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Offset just past the empty line that terminates the head.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    let mut line_start = 0;
    for (i, &b) in buf.iter().enumerate() {
        if b != b'\n' {
            continue;
        }
        let line = &buf[line_start..i];
        if (line.is_empty() || line == b"\r") && line_start > 0 {
            return Some(i + 1);
        }
        line_start = i + 1;
    }
    None
}

/// Cheap early reject while the request line is still arriving.
fn plausible_prefix(buf: &[u8]) -> bool {
    let line_end = buf.iter().position(|&b| b == b'\n');
    match line_end {
        Some(end) => parse_request_line(trim_cr(&buf[..end])).is_some(),
        None => buf
            .iter()
            .all(|&b| b == b'\r' || b == b'\t' || !b.is_ascii_control()),
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Parse `METHOD SP target SP HTTP/x.y`.
fn parse_request_line(line: &[u8]) -> Option<(String, String, (u32, u32))> {
    let line = std::str::from_utf8(line).ok()?;
    let mut parts = line.split(' ');
    let method = parts.next()?;
    let target = parts.next()?;
    let version = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    if method.is_empty() || !method.bytes().all(is_token_byte) {
        return None;
    }
    if target.is_empty() {
        return None;
    }

    Some((method.to_string(), target.to_string(), parse_version(version)?))
}

fn parse_version(version: &str) -> Option<(u32, u32)> {
    match version {
        "HTTP/1.1" => return Some((1, 1)),
        "HTTP/1.0" => return Some((1, 0)),
        _ => {}
    }

    let rest = version.strip_prefix("HTTP/")?;
    let (major, minor) = rest.split_once('.')?;
    if major.is_empty()
        || minor.is_empty()
        || !major.bytes().all(|b| b.is_ascii_digit())
        || !minor.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Parse a complete request head (through the terminating blank line).
fn parse_request_head(raw: &[u8]) -> Option<RequestHead> {
    let mut lines = raw.split(|&b| b == b'\n').map(trim_cr);

    let (method, target, version) = parse_request_line(lines.next()?)?;
    let mut headers = Vec::new();

    for line in lines {
        if line.is_empty() {
            break;
        }
        if line[0] == b' ' || line[0] == b'\t' {
            return None;
        }
        let line = std::str::from_utf8(line).ok()?;
        let (name, value) = line.split_once(':')?;
        if name.is_empty() || !name.bytes().all(is_token_byte) {
            return None;
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }

    Some(RequestHead {
        method,
        target,
        version,
        headers,
    })
}
