//! Error types for the connection multiplexer.
//!
//! Sentinel variants (`ListenerClosed`, `ServerClosed`, `Hijacked`) are
//! returned as-is so callers can `matches!` on them.

use std::io;

use thiserror::Error;

/// Errors surfaced by listeners, the accept loop and connection lifecycle.
#[derive(Debug, Error)]
pub enum MuxError {
    /// `accept` was called on a listener after it was closed.
    #[error("listener closed")]
    ListenerClosed,

    /// The server is shutting down or has been closed.
    #[error("server closed")]
    ServerClosed,

    /// The connection has already been hijacked by its handler.
    #[error("connection hijacked")]
    Hijacked,

    /// Graceful shutdown did not finish within its grace period.
    #[error("shutdown deadline exceeded")]
    ShutdownTimeout,

    /// I/O error from the networking layer.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// TLS configuration or handshake failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// Certificate file could not be read.
    #[error("failed to load certificates from {path}: {message}")]
    CertificateLoad { path: String, message: String },

    /// Private key file could not be read.
    #[error("failed to load private key from {path}: {message}")]
    PrivateKeyLoad { path: String, message: String },

    /// Certificate file contained no certificates.
    #[error("no certificates found in {0}")]
    NoCertificates(String),

    /// Key file contained no private key.
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
}

impl MuxError {
    /// Whether this error is transient and accepting should be retried.
    pub fn is_temporary(&self) -> bool {
        match self {
            MuxError::Io(e) => is_temporary_io(e),
            _ => false,
        }
    }
}

/// Classify an accept error as transient.
///
/// Covers aborted handshakes and resource exhaustion (fd limits, buffer
/// space), which clear up on their own.
pub fn is_temporary_io(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset => true,
        _ => matches!(
            err.raw_os_error(),
            Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
        ),
    }
}

/// Panic payload that aborts a handler without a stack trace being logged.
///
/// Raise it with [`abort_handler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("abort handler")]
pub struct AbortHandler;

/// Abort the current connection handler.
///
/// The connection is closed (unless hijacked) and the panic is logged at
/// debug level only.
pub fn abort_handler() -> ! {
    std::panic::panic_any(AbortHandler)
}

/// Result alias for multiplexer operations.
pub type MuxResult<T> = Result<T, MuxError>;
