//! Shared fixtures for portmux integration tests.
//!
//! Provides a server bound to an ephemeral loopback port, a recording
//! handler, plain and TLS clients, and throwaway certificate files.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use portmux::{handler_fn, Conn, Handler, Listener, MuxResult, ServeMux, Server, TcpAcceptor};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

/// What a [`recorder`] saw: its tag and every byte the client sent.
pub type Seen = (&'static str, Vec<u8>);

/// A running [`Server`] accepting on `127.0.0.1`.
#[allow(dead_code)]
pub struct MuxHandle {
    pub addr: SocketAddr,
    pub server: Server,
    serve: Option<JoinHandle<MuxResult<()>>>,
}

#[allow(dead_code)]
impl MuxHandle {
    pub async fn spawn(mux: ServeMux) -> io::Result<Self> {
        Self::spawn_server(Server::new(mux)).await
    }

    pub async fn spawn_server(server: Server) -> io::Result<Self> {
        let listener = TcpAcceptor::bind("127.0.0.1:0").await?;
        let addr = local_addr(&listener)?;

        let serve = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        Ok(Self {
            addr,
            server,
            serve: Some(serve),
        })
    }

    /// Serve with TLS terminated in front of the mux, loading `certs` from disk.
    pub async fn spawn_tls(server: Server, certs: &TestCerts) -> io::Result<Self> {
        let listener = TcpAcceptor::bind("127.0.0.1:0").await?;
        let addr = local_addr(&listener)?;

        let cert_path = certs.cert_file.path().to_path_buf();
        let key_path = certs.key_file.path().to_path_buf();
        let serve = {
            let server = server.clone();
            tokio::spawn(async move { server.serve_tls(listener, None, cert_path, key_path).await })
        };

        Ok(Self {
            addr,
            server,
            serve: Some(serve),
        })
    }

    /// Wait for the serve task to return.
    pub async fn join(mut self) -> MuxResult<()> {
        let serve = self.serve.take().expect("serve task already joined");
        tokio::time::timeout(Duration::from_secs(2), serve)
            .await
            .expect("serve did not return")
            .expect("serve task panicked")
    }
}

impl Drop for MuxHandle {
    fn drop(&mut self) {
        let _ = self.server.close();
    }
}

fn local_addr(listener: &TcpAcceptor) -> io::Result<SocketAddr> {
    Listener::local_addr(listener)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "listener has no address"))
}

/// Handler that reads the connection to EOF, reports the bytes under `tag`
/// and answers with `tag`.
#[allow(dead_code)]
pub fn recorder(tag: &'static str, seen: mpsc::UnboundedSender<Seen>) -> impl Handler {
    handler_fn(move |mut conn: Conn| {
        let seen = seen.clone();
        async move {
            let mut bytes = Vec::new();
            let _ = conn.read_to_end(&mut bytes).await;
            let _ = seen.send((tag, bytes));
            let _ = conn.write_all(tag.as_bytes()).await;
            let _ = conn.shutdown().await;
        }
    })
}

/// Handler that reads exactly `len` bytes and answers with `tag`.
///
/// Used where the client cannot half-close, e.g. over TLS.
#[allow(dead_code)]
pub fn responder(tag: &'static str, len: usize) -> impl Handler {
    handler_fn(move |mut conn: Conn| async move {
        let mut request = vec![0u8; len];
        if conn.read_exact(&mut request).await.is_ok() {
            let _ = conn.write_all(tag.as_bytes()).await;
        }
        let _ = conn.shutdown().await;
    })
}

/// Send `payload`, half-close, and collect the reply.
#[allow(dead_code)]
pub async fn exchange(addr: SocketAddr, payload: &[u8]) -> io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(payload).await?;
    stream.shutdown().await?;
    read_reply(&mut stream).await
}

/// Read until EOF, bounded so a stuck server fails the test instead of
/// hanging it.
#[allow(dead_code)]
pub async fn read_reply<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut reply))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no reply within 2s"))??;
    Ok(reply)
}

/// Self-signed certificate for `localhost`, written to temp PEM files.
#[allow(dead_code)]
pub struct TestCerts {
    pub cert_file: NamedTempFile,
    pub key_file: NamedTempFile,
    pub cert_der: CertificateDer<'static>,
}

#[allow(dead_code)]
impl TestCerts {
    pub fn generate() -> Self {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("generate certificate");

        let cert_file = NamedTempFile::new().expect("create cert file");
        std::fs::write(cert_file.path(), certified.cert.pem()).expect("write cert");
        let key_file = NamedTempFile::new().expect("create key file");
        std::fs::write(key_file.path(), certified.key_pair.serialize_pem()).expect("write key");

        Self {
            cert_file,
            key_file,
            cert_der: certified.cert.der().clone(),
        }
    }

    /// Client trusting only this certificate.
    pub fn connector(&self) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert_der.clone()).expect("add root certificate");

        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_root_certificates(roots)
        .with_no_client_auth();

        TlsConnector::from(Arc::new(config))
    }
}

/// TLS handshake to `addr` as `localhost`, send `payload`, collect the reply.
#[allow(dead_code)]
pub async fn tls_exchange(
    addr: SocketAddr,
    connector: &TlsConnector,
    payload: &[u8],
) -> io::Result<Vec<u8>> {
    let stream = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from("localhost")
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut tls = tokio::time::timeout(
        Duration::from_secs(2),
        connector.connect(server_name, stream),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"))??;

    tls.write_all(payload).await?;
    tls.flush().await?;
    read_reply(&mut tls).await
}
