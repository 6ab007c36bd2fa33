//! TLS detection.
//!
//! [`tls`] looks at the record header only: content type `0x16` followed by
//! a known protocol version. [`tls_sni`] reads the first record and routes on
//! the server name in the ClientHello.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::{debug, trace};

use super::Matcher;
use crate::conn::Conn;

/// Record content type of a TLS handshake.
pub const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Maximum bytes read while looking for the ClientHello server name.
const MAX_SNIFF_BYTES: usize = 8192;

const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Record-layer protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TlsVersion {
    Ssl30 = 0x0300,
    Tls10 = 0x0301,
    Tls11 = 0x0302,
    Tls12 = 0x0303,
    Tls13 = 0x0304,
}

impl TlsVersion {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0300 => Some(TlsVersion::Ssl30),
            0x0301 => Some(TlsVersion::Tls10),
            0x0302 => Some(TlsVersion::Tls11),
            0x0303 => Some(TlsVersion::Tls12),
            0x0304 => Some(TlsVersion::Tls13),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TlsVersion::Ssl30 => "SSLv3",
            TlsVersion::Tls10 => "TLS1.0",
            TlsVersion::Tls11 => "TLS1.1",
            TlsVersion::Tls12 => "TLS1.2",
            TlsVersion::Tls13 => "TLS1.3",
        };
        f.write_str(name)
    }
}

/// Every version [`tls`] accepts by default.
pub const TLS_VERSIONS: &[TlsVersion] = &[
    TlsVersion::Ssl30,
    TlsVersion::Tls10,
    TlsVersion::Tls11,
    TlsVersion::Tls12,
    TlsVersion::Tls13,
];

/// Matches a handshake record header with an allowed version.
#[derive(Debug, Clone)]
pub struct TlsMatcher {
    versions: Vec<TlsVersion>,
}

impl TlsMatcher {
    /// Restrict the accepted record versions.
    pub fn with_versions<I>(versions: I) -> Self
    where
        I: IntoIterator<Item = TlsVersion>,
    {
        Self {
            versions: versions.into_iter().collect(),
        }
    }
}

impl Default for TlsMatcher {
    fn default() -> Self {
        Self::with_versions(TLS_VERSIONS.iter().copied())
    }
}

#[async_trait]
impl Matcher for TlsMatcher {
    async fn matches(&self, conn: &mut Conn) -> bool {
        let mut header = [0u8; 3];
        if conn.read_exact(&mut header).await.is_err() {
            return false;
        }
        if header[0] != TLS_HANDSHAKE_RECORD {
            return false;
        }
        let version = u16::from_be_bytes([header[1], header[2]]);
        TlsVersion::from_u16(version).is_some_and(|v| self.versions.contains(&v))
    }
}

/// Match TLS connections of any known version.
pub fn tls() -> TlsMatcher {
    TlsMatcher::default()
}

/// Matches a ClientHello whose server name is in an allow-list.
#[derive(Debug, Clone)]
pub struct TlsSniMatcher {
    hosts: HashSet<String>,
}

#[async_trait]
impl Matcher for TlsSniMatcher {
    async fn matches(&self, conn: &mut Conn) -> bool {
        let Some(record) = read_first_record(conn).await else {
            return false;
        };
        match parse_sni(&record) {
            SniResult::Found(host) => {
                let matched = self.hosts.contains(&host);
                trace!(sni = %host, matched, "Parsed ClientHello server name");
                matched
            }
            other => {
                debug!(result = ?other, "No usable SNI in ClientHello");
                false
            }
        }
    }
}

/// Match TLS connections whose SNI is one of `hosts`.
///
/// Names compare case-insensitively, ignoring a trailing dot.
pub fn tls_sni<I, S>(hosts: I) -> TlsSniMatcher
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    TlsSniMatcher {
        hosts: hosts
            .into_iter()
            .map(|h| normalize_host(h.as_ref()))
            .collect(),
    }
}

fn normalize_host(host: &str) -> String {
    host.to_ascii_lowercase().trim_end_matches('.').to_string()
}

/// Read the first TLS record, truncated at [`MAX_SNIFF_BYTES`].
async fn read_first_record(conn: &mut Conn) -> Option<Vec<u8>> {
    let mut header = [0u8; RECORD_HEADER_LEN];
    conn.read_exact(&mut header).await.ok()?;
    if header[0] != TLS_HANDSHAKE_RECORD {
        return None;
    }
    TlsVersion::from_u16(u16::from_be_bytes([header[1], header[2]]))?;

    let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    let total = (RECORD_HEADER_LEN + record_len).min(MAX_SNIFF_BYTES);

    let mut record = vec![0u8; total];
    record[..RECORD_HEADER_LEN].copy_from_slice(&header);
    conn.read_exact(&mut record[RECORD_HEADER_LEN..]).await.ok()?;
    Some(record)
}

/// Outcome of looking for a server name in a ClientHello.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SniResult {
    /// Host name, normalized.
    Found(String),
    /// Well-formed ClientHello without a server_name extension.
    NoSni,
    /// Not a handshake record carrying a ClientHello.
    NotTls,
    /// Truncated or inconsistent.
    Malformed,
}

/// Bounds-checked cursor over handshake bytes.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(out)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| (b[0] as usize) << 16 | (b[1] as usize) << 8 | b[2] as usize)
    }

    /// Sub-reader over a length-prefixed vector.
    fn vec8(&mut self) -> Option<Reader<'a>> {
        let len = self.u8()? as usize;
        self.take(len).map(Reader::new)
    }

    fn vec16(&mut self) -> Option<Reader<'a>> {
        let len = self.u16()? as usize;
        self.take(len).map(Reader::new)
    }
}

/// Extract the server name from a record holding a ClientHello.
///
/// ```text
/// record:      type(1) version(2) length(2) fragment
/// handshake:   msg_type(1) length(3) body
/// ClientHello: version(2) random(32) session_id<1> cipher_suites<2>
///              compression_methods<1> extensions<2>
/// ```
fn parse_sni(data: &[u8]) -> SniResult {
    let mut record = Reader::new(data);
    match record.u8() {
        Some(TLS_HANDSHAKE_RECORD) => {}
        Some(_) => return SniResult::NotTls,
        None => return SniResult::Malformed,
    }
    if record.take(4).is_none() {
        return SniResult::Malformed;
    }

    match record.u8() {
        Some(HANDSHAKE_CLIENT_HELLO) => {}
        Some(_) => return SniResult::NotTls,
        None => return SniResult::Malformed,
    }
    let Some(body_len) = record.u24() else {
        return SniResult::Malformed;
    };
    // The record may be cut at the sniff cap; parse what arrived.
    let body_len = body_len.min(record.remaining());
    let Some(body) = record.take(body_len) else {
        return SniResult::Malformed;
    };

    parse_client_hello(Reader::new(body)).unwrap_or(SniResult::Malformed)
}

fn parse_client_hello(mut hello: Reader<'_>) -> Option<SniResult> {
    hello.take(2 + 32)?;
    hello.vec8()?;
    hello.vec16()?;
    hello.vec8()?;

    if hello.remaining() == 0 {
        return Some(SniResult::NoSni);
    }
    // Cut records still carry the leading extensions, server_name included.
    let extensions_len = (hello.u16()? as usize).min(hello.remaining());
    let mut extensions = Reader::new(hello.take(extensions_len)?);

    while extensions.remaining() >= 4 {
        let kind = extensions.u16()?;
        let mut ext = extensions.vec16()?;
        if kind == EXTENSION_SERVER_NAME {
            return Some(parse_server_name(&mut ext).unwrap_or(SniResult::Malformed));
        }
    }
    Some(SniResult::NoSni)
}

fn parse_server_name(ext: &mut Reader<'_>) -> Option<SniResult> {
    let mut names = ext.vec16()?;
    while names.remaining() > 0 {
        let name_type = names.u8()?;
        let name = names.vec16()?;
        if name_type == NAME_TYPE_HOST_NAME {
            let host = std::str::from_utf8(name.data).ok()?;
            return Some(SniResult::Found(normalize_host(host)));
        }
    }
    Some(SniResult::NoSni)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::super::test_support::{conn_with, open_conn, run};
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn vec16(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    /// A minimal TLS 1.2 ClientHello, optionally carrying `sni`.
    pub(crate) fn client_hello(sni: Option<&str>) -> Vec<u8> {
        client_hello_padded(sni, 16)
    }

    /// ClientHello whose server_name is followed by `padding` bytes of padding.
    fn client_hello_padded(sni: Option<&str>, padding: usize) -> Vec<u8> {
        let mut extensions = Vec::new();
        if let Some(host) = sni {
            let mut entry = vec![NAME_TYPE_HOST_NAME];
            entry.extend(vec16(host.as_bytes()));
            extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
            extensions.extend(vec16(&vec16(&entry)));
        }
        // padding extension
        extensions.extend_from_slice(&[0x00, 0x15]);
        extensions.extend(vec16(&vec![0u8; padding]));

        let mut hello = vec![0x03, 0x03];
        hello.extend_from_slice(&[0u8; 32]);
        hello.push(0x00);
        hello.extend(vec16(&[0x00, 0x2f]));
        hello.extend_from_slice(&[0x01, 0x00]);
        hello.extend(vec16(&extensions));

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
        handshake.extend(hello);

        let mut record = vec![TLS_HANDSHAKE_RECORD, 0x03, 0x01];
        record.extend(vec16(&handshake));
        record
    }

    #[test]
    fn test_parse_sni_found() {
        assert_eq!(
            parse_sni(&client_hello(Some("Example.COM."))),
            SniResult::Found("example.com".into())
        );
    }

    #[test]
    fn test_parse_sni_absent() {
        assert_eq!(parse_sni(&client_hello(None)), SniResult::NoSni);
    }

    #[test]
    fn test_parse_not_tls() {
        assert_eq!(
            parse_sni(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n"),
            SniResult::NotTls
        );
    }

    #[test]
    fn test_parse_truncated() {
        assert_eq!(parse_sni(&[0x16, 0x03, 0x01]), SniResult::Malformed);

        let hello = client_hello(Some("example.com"));
        assert_eq!(parse_sni(&hello[..60]), SniResult::Malformed);
    }

    #[test]
    fn test_parse_sni_from_record_cut_at_sniff_cap() {
        let hello = client_hello_padded(Some("big.example.com"), 12_000);
        assert!(hello.len() > MAX_SNIFF_BYTES);
        assert_eq!(
            parse_sni(&hello[..MAX_SNIFF_BYTES]),
            SniResult::Found("big.example.com".into())
        );

        let hello = client_hello_padded(None, 12_000);
        assert_eq!(parse_sni(&hello[..MAX_SNIFF_BYTES]), SniResult::Malformed);
    }

    #[test]
    fn test_version_roundtrip() {
        for version in TLS_VERSIONS {
            assert_eq!(TlsVersion::from_u16(version.as_u16()), Some(*version));
        }
        assert_eq!(TlsVersion::from_u16(0x0305), None);
        assert_eq!(TlsVersion::Tls13.to_string(), "TLS1.3");
    }

    #[tokio::test]
    async fn test_tls_record_header() {
        let mut conn = conn_with(&[0x16, 0x03, 0x01, 0x00, 0x05]).await;
        assert!(run(&tls(), &mut conn).await);

        let mut conn = conn_with(&[0x16, 0x03, 0x09]).await;
        assert!(!run(&tls(), &mut conn).await);

        let mut conn = conn_with(&[0x17, 0x03, 0x03]).await;
        assert!(!run(&tls(), &mut conn).await);
    }

    #[tokio::test]
    async fn test_tls_restricted_versions() {
        let modern = TlsMatcher::with_versions([TlsVersion::Tls12, TlsVersion::Tls13]);
        let mut conn = conn_with(&[0x16, 0x03, 0x03]).await;
        assert!(run(&modern, &mut conn).await);

        let mut conn = conn_with(&[0x16, 0x03, 0x00]).await;
        assert!(!run(&modern, &mut conn).await);
    }

    #[tokio::test]
    async fn test_tls_reads_only_three_bytes() {
        let (mut conn, mut client) = open_conn();
        client.write_all(&[0x16, 0x03, 0x01]).await.unwrap();
        assert!(run(&tls(), &mut conn).await);
    }

    #[tokio::test]
    async fn test_tls_sni_allow_list() {
        let matcher = tls_sni(["api.example.com", "WWW.example.com"]);

        let mut conn = conn_with(&client_hello(Some("www.example.com"))).await;
        assert!(run(&matcher, &mut conn).await);

        let mut conn = conn_with(&client_hello(Some("other.example.com"))).await;
        assert!(!run(&matcher, &mut conn).await);

        let mut conn = conn_with(&client_hello(None)).await;
        assert!(!run(&matcher, &mut conn).await);
    }
}
