//! TCP passthrough destination.
//!
//! [`UpstreamProxy`] connects each classified connection to a fixed
//! upstream and splices bytes both ways. Because the connection is still in
//! replay mode, the bytes the matchers peeked at go upstream first.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::conn::Conn;
use crate::mux::Handler;

/// Default upstream connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const COPY_BUFFER_SIZE: usize = 8192;

/// Handler forwarding connections to one upstream address.
#[derive(Debug, Clone)]
pub struct UpstreamProxy {
    upstream: SocketAddr,
    connect_timeout: Duration,
    idle_timeout: Option<Duration>,
}

impl UpstreamProxy {
    pub fn new(upstream: SocketAddr) -> Self {
        Self {
            upstream,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Fail a direction that reads nothing for `timeout`.
    ///
    /// Each direction is timed on its own, so a stream that only flows one
    /// way still ends once the silent side times out.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.upstream))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream connect timed out"))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Handler for UpstreamProxy {
    async fn serve_conn(&self, mut conn: Conn) {
        let mut upstream = match self.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(upstream = %self.upstream, error = %e, "Upstream connect failed");
                return;
            }
        };
        debug!(upstream = %self.upstream, "Connected to upstream");

        match proxy_bidirectional(&mut conn, &mut upstream, self.idle_timeout).await {
            Ok((to_upstream, from_upstream)) => debug!(
                bytes_to_upstream = to_upstream,
                bytes_from_upstream = from_upstream,
                "Proxy finished"
            ),
            Err(e) => debug!(error = %e, "Proxy failed"),
        }
    }
}

/// Copy data both ways until each side has sent EOF.
///
/// Returns `(bytes a->b, bytes b->a)`, or the error of the first direction
/// that failed once both have stopped.
pub async fn proxy_bidirectional<A, B>(
    a: &mut A,
    b: &mut B,
    idle_timeout: Option<Duration>,
) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let (a_result, b_result) = tokio::join!(
        copy_half(a_read, b_write, idle_timeout),
        copy_half(b_read, a_write, idle_timeout),
    );

    Ok((a_result?, b_result?))
}

async fn copy_half<R, W>(
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    idle_timeout: Option<Duration>,
) -> io::Result<u64>
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let read = match idle_timeout {
            Some(timeout) => tokio::time::timeout(timeout, reader.read(&mut buf))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "idle timeout"))?,
            None => reader.read(&mut buf).await,
        };
        match read? {
            0 => break,
            n => {
                writer.write_all(&buf[..n]).await?;
                total += n as u64;
            }
        }
    }
    writer.shutdown().await?;
    Ok(total)
}
