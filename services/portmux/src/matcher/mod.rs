//! Protocol matchers.
//!
//! A matcher inspects the first bytes of a connection and decides whether it
//! belongs to a protocol. Matchers always run against a [`Conn`] in capture
//! mode, so whatever they read is replayed to the next matcher and to the
//! eventual handler. Read failures (EOF, reset, deadline) count as "no match".
//!
//! Only handshake-driven matchers write (see [`Http2HeaderMatcher`] with
//! settings enabled).
//!
//! | Constructor            | Reads                                   |
//! |------------------------|-----------------------------------------|
//! | [`any`]                | nothing                                 |
//! | [`prefix`]             | up to the longest pattern               |
//! | [`http1_fast`]         | up to the longest method name           |
//! | [`http1`]              | request line + headers, 4096 byte cap   |
//! | [`http2`]              | the 24 byte client preface              |
//! | [`http2_header_field`] | preface, frames until END_HEADERS       |
//! | [`grpc`]               | same as above, with SETTINGS handshake  |
//! | [`tls`]                | 3 byte record header prefix             |
//! | [`tls_sni`]            | one TLS record, 8 KiB cap               |

use std::sync::Arc;

use async_trait::async_trait;

use crate::conn::Conn;

mod http1;
mod http2;
mod prefix;
mod tls;

pub use http1::{
    http1, http1_fast, http1_fast_with, http1_header_field, Http1Matcher, HTTP1_MAX_READ,
    HTTP_METHODS,
};
pub use http2::{
    grpc, http2, http2_header_field, http2_header_field_fn, http2_header_field_prefix,
    http2_header_field_prefix_send_settings, http2_header_field_send_settings, Http2HeaderMatcher,
    Http2PrefaceMatcher, HTTP2_CLIENT_PREFACE,
};
pub use prefix::{prefix, PrefixMatcher};
pub use tls::{
    tls, tls_sni, TlsMatcher, TlsSniMatcher, TlsVersion, TLS_HANDSHAKE_RECORD, TLS_VERSIONS,
};

/// Predicate over the initial bytes of a connection.
#[async_trait]
pub trait Matcher: Send + Sync {
    /// Whether `conn` belongs to this matcher's protocol.
    ///
    /// `conn` is in capture mode; reads are replayed afterwards.
    async fn matches(&self, conn: &mut Conn) -> bool;

    /// Box this matcher, for use with [`any_of`].
    fn boxed(self) -> Box<dyn Matcher>
    where
        Self: Sized + 'static,
    {
        Box::new(self)
    }
}

#[async_trait]
impl<M: Matcher + ?Sized> Matcher for Box<M> {
    async fn matches(&self, conn: &mut Conn) -> bool {
        (**self).matches(conn).await
    }
}

#[async_trait]
impl<M: Matcher + ?Sized> Matcher for Arc<M> {
    async fn matches(&self, conn: &mut Conn) -> bool {
        (**self).matches(conn).await
    }
}

/// Catch-all matcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyMatcher;

#[async_trait]
impl Matcher for AnyMatcher {
    async fn matches(&self, _conn: &mut Conn) -> bool {
        true
    }
}

/// Match every connection without reading.
pub fn any() -> AnyMatcher {
    AnyMatcher
}

/// Matches when any of its sub-matchers does.
pub struct AnyOf {
    matchers: Vec<Box<dyn Matcher>>,
}

#[async_trait]
impl Matcher for AnyOf {
    async fn matches(&self, conn: &mut Conn) -> bool {
        for matcher in &self.matchers {
            // Each attempt starts again from the first unconsumed byte.
            conn.sniff(false);
            conn.sniff(true);
            let matched = matcher.matches(conn).await;
            conn.sniff(false);
            if matched {
                return true;
            }
        }
        false
    }
}

/// Try `matchers` in order, each in its own capture cycle.
pub fn any_of<I>(matchers: I) -> AnyOf
where
    I: IntoIterator<Item = Box<dyn Matcher>>,
{
    AnyOf {
        matchers: matchers.into_iter().collect(),
    }
}

/// Predicate form of a matcher, for one-off protocols.
pub struct MatchFn<F>(F);

#[async_trait]
impl<F> Matcher for MatchFn<F>
where
    F: for<'a> Fn(&'a mut Conn) -> futures_util::future::BoxFuture<'a, bool> + Send + Sync,
{
    async fn matches(&self, conn: &mut Conn) -> bool {
        (self.0)(conn).await
    }
}

/// Build a matcher from an async closure returning a boxed future.
pub fn match_fn<F>(f: F) -> MatchFn<F>
where
    F: for<'a> Fn(&'a mut Conn) -> futures_util::future::BoxFuture<'a, bool> + Send + Sync,
{
    MatchFn(f)
}


#[cfg(test)]
mod tests {
    use super::test_support::{conn_with, run};
    use super::*;
    use futures_util::FutureExt;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_any_reads_nothing() {
        let mut conn = conn_with(b"abc").await;
        assert!(run(&any(), &mut conn).await);

        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"abc");
    }

    #[tokio::test]
    async fn test_any_of_isolates_failed_attempts() {
        let mut conn = conn_with(b"GET / HTTP/1.1\r\n\r\n").await;
        let matcher = any_of([tls().boxed(), http2().boxed(), http1_fast().boxed()]);
        assert!(run(&matcher, &mut conn).await);

        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"GET / HTTP/1.1\r\n\r\n");
    }

    #[tokio::test]
    async fn test_any_of_none_match() {
        let mut conn = conn_with(b"SSH-2.0-OpenSSH_9.6\r\n").await;
        let matcher = any_of([tls().boxed(), http1_fast().boxed()]);
        assert!(!run(&matcher, &mut conn).await);
    }

    #[tokio::test]
    async fn test_match_fn() {
        let ssh = match_fn(|conn: &mut Conn| {
            async move {
                let mut buf = [0u8; 4];
                conn.read_exact(&mut buf).await.is_ok() && &buf == b"SSH-"
            }
            .boxed()
        });

        let mut conn = conn_with(b"SSH-2.0-OpenSSH_9.6\r\n").await;
        assert!(run(&ssh, &mut conn).await);
        let mut conn = conn_with(b"GET / HTTP/1.1\r\n").await;
        assert!(!run(&ssh, &mut conn).await);
    }
}
