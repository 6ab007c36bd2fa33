//! portmux configuration.
//!
//! Everything comes from `PORTMUX_*` environment variables. Upstreams are
//! optional; a protocol without one falls through to the next match.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Certificate and key used to terminate TLS in front of the mux.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// portmux configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to accept connections on.
    pub listen_addr: SocketAddr,

    /// Classification deadline; `None` disables it.
    pub sniff_timeout: Option<Duration>,

    /// Upstream for HTTP/1.x requests.
    pub http_upstream: Option<SocketAddr>,

    /// Upstream for gRPC (HTTP/2 with `content-type: application/grpc`).
    pub grpc_upstream: Option<SocketAddr>,

    /// Upstream for other HTTP/2 prior-knowledge connections.
    pub http2_upstream: Option<SocketAddr>,

    /// Upstream for TLS passthrough.
    pub tls_upstream: Option<SocketAddr>,

    /// Upstream for anything unmatched. Without one, unmatched connections
    /// get a 404 and are closed.
    pub fallback_upstream: Option<SocketAddr>,

    /// Terminate TLS before classification.
    pub tls: Option<TlsFiles>,

    /// How long Ctrl-C waits for connections to drain.
    pub shutdown_grace: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = lookup("PORTMUX_LISTEN_ADDR")
            .unwrap_or_else(|| "[::]:8080".to_string())
            .parse()
            .context("PORTMUX_LISTEN_ADDR must be a socket address.")?;

        let sniff_timeout_ms: u64 = lookup("PORTMUX_SNIFF_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("PORTMUX_SNIFF_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(1000);
        let sniff_timeout = (sniff_timeout_ms > 0).then(|| Duration::from_millis(sniff_timeout_ms));

        let upstream = |key: &str| -> Result<Option<SocketAddr>> {
            lookup(key)
                .filter(|v| !v.is_empty())
                .map(|v| v.parse())
                .transpose()
                .with_context(|| format!("{key} must be a socket address."))
        };

        let tls = match (
            lookup("PORTMUX_TLS_CERT_FILE"),
            lookup("PORTMUX_TLS_KEY_FILE"),
        ) {
            (Some(cert_file), Some(key_file)) => Some(TlsFiles {
                cert_file: cert_file.into(),
                key_file: key_file.into(),
            }),
            (None, None) => None,
            _ => bail!("PORTMUX_TLS_CERT_FILE and PORTMUX_TLS_KEY_FILE must be set together."),
        };

        let shutdown_grace_ms: u64 = lookup("PORTMUX_SHUTDOWN_GRACE_MS")
            .map(|v| v.parse())
            .transpose()
            .context("PORTMUX_SHUTDOWN_GRACE_MS must be an integer (milliseconds).")?
            .unwrap_or(10_000);

        let log_level = lookup("PORTMUX_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            sniff_timeout,
            http_upstream: upstream("PORTMUX_HTTP_UPSTREAM")?,
            grpc_upstream: upstream("PORTMUX_GRPC_UPSTREAM")?,
            http2_upstream: upstream("PORTMUX_HTTP2_UPSTREAM")?,
            tls_upstream: upstream("PORTMUX_TLS_UPSTREAM")?,
            fallback_upstream: upstream("PORTMUX_FALLBACK_UPSTREAM")?,
            tls,
            shutdown_grace: Duration::from_millis(shutdown_grace_ms),
            log_level,
        })
    }
}
