//! Connection sources.
//!
//! A [`Listener`] hands out [`Conn`]s. [`TcpAcceptor`] wraps a bound socket,
//! [`SubListener`] is fed by a [`ServeMux`](crate::ServeMux) entry, and
//! [`OnceCloseListener`] makes any listener safe to close repeatedly.
//!
//! Every listener returns [`MuxError::ListenerClosed`] from `accept` once
//! closed, including accepts that were already waiting.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::conn::Conn;
use crate::error::{MuxError, MuxResult};

/// Queue depth of a sub-listener before the serving task waits.
pub const SUB_LISTENER_BACKLOG: usize = 1024;

/// Source of accepted connections.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next connection.
    async fn accept(&self) -> MuxResult<Conn>;

    /// Stop accepting. Pending and later `accept` calls fail with
    /// [`MuxError::ListenerClosed`].
    fn close(&self) -> MuxResult<()>;

    /// Bound address, if the listener has one.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

#[async_trait]
impl<L: Listener + ?Sized> Listener for Arc<L> {
    async fn accept(&self) -> MuxResult<Conn> {
        (**self).accept().await
    }

    fn close(&self) -> MuxResult<()> {
        (**self).close()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        (**self).local_addr()
    }
}

#[async_trait]
impl<L: Listener + ?Sized> Listener for Box<L> {
    async fn accept(&self) -> MuxResult<Conn> {
        (**self).accept().await
    }

    fn close(&self) -> MuxResult<()> {
        (**self).close()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        (**self).local_addr()
    }
}

/// Close signal shared by the listeners in this module.
struct CloseSignal {
    closed: AtomicBool,
    tx: watch::Sender<bool>,
}

impl CloseSignal {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            closed: AtomicBool::new(false),
            tx,
        }
    }

    /// Returns `true` only for the first caller.
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.tx.send_replace(true);
        true
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// TCP socket listener.
pub struct TcpAcceptor {
    listener: Mutex<Option<Arc<TcpListener>>>,
    local_addr: Option<SocketAddr>,
    signal: CloseSignal,
}

impl TcpAcceptor {
    /// Bind a new TCP listener.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let acceptor = Self::from_listener(listener);
        if let Some(addr) = acceptor.local_addr {
            info!(bind_addr = %addr, "Listener bound");
        }
        Ok(acceptor)
    }

    /// Wrap an already bound listener.
    pub fn from_listener(listener: TcpListener) -> Self {
        Self {
            local_addr: listener.local_addr().ok(),
            listener: Mutex::new(Some(Arc::new(listener))),
            signal: CloseSignal::new(),
        }
    }

    fn socket(&self) -> Option<Arc<TcpListener>> {
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl From<TcpListener> for TcpAcceptor {
    fn from(listener: TcpListener) -> Self {
        Self::from_listener(listener)
    }
}

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&self) -> MuxResult<Conn> {
        let socket = self.socket().ok_or(MuxError::ListenerClosed)?;
        tokio::select! {
            biased;
            _ = self.signal.wait() => Err(MuxError::ListenerClosed),
            res = socket.accept() => {
                let (stream, peer_addr) = res?;
                Ok(Conn::with_addrs(stream, Some(peer_addr), self.local_addr))
            }
        }
    }

    fn close(&self) -> MuxResult<()> {
        if self.signal.close() {
            // Waiting accepts drop their clone once woken.
            self.listener
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            debug!(bind_addr = ?self.local_addr, "Listener closed");
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

/// Listener fed by a [`ServeMux`](crate::ServeMux) entry.
///
/// Connections arrive already hijacked from the server: the caller owns them
/// outright and must close them. Serving the listener with another
/// [`Server`](crate::Server) hands each one to that server's lifecycle.
#[derive(Clone)]
pub struct SubListener {
    inner: Arc<SubInner>,
}

struct SubInner {
    tx: flume::Sender<Conn>,
    rx: flume::Receiver<Conn>,
    signal: CloseSignal,
}

impl SubListener {
    pub(crate) fn new() -> Self {
        let (tx, rx) = flume::bounded(SUB_LISTENER_BACKLOG);
        Self {
            inner: Arc::new(SubInner {
                tx,
                rx,
                signal: CloseSignal::new(),
            }),
        }
    }

    /// Queue a classified connection, waiting for room.
    ///
    /// Hands the connection back if the listener is closed.
    pub(crate) async fn push(&self, conn: Conn) -> Result<(), Conn> {
        if self.inner.signal.is_closed() {
            return Err(conn);
        }
        let send = self.inner.tx.send_async(conn);
        tokio::select! {
            res = send => {
                if let Err(flume::SendError(conn)) = res {
                    return Err(conn);
                }
            }
            _ = self.inner.signal.wait() => {
                // The send was cancelled with the connection in it.
                return Ok(());
            }
        }
        // Lost a race with close; it may have drained before our send.
        if self.inner.signal.is_closed() {
            self.drain();
        }
        Ok(())
    }

    /// Connections queued and not yet accepted.
    pub fn queued(&self) -> usize {
        self.inner.rx.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.signal.is_closed()
    }

    fn drain(&self) {
        let dropped = self.inner.rx.try_iter().count();
        if dropped > 0 {
            debug!(dropped, "Dropped queued connections on sub-listener close");
        }
    }
}

#[async_trait]
impl Listener for SubListener {
    async fn accept(&self) -> MuxResult<Conn> {
        if self.inner.signal.is_closed() {
            return Err(MuxError::ListenerClosed);
        }
        tokio::select! {
            biased;
            _ = self.inner.signal.wait() => Err(MuxError::ListenerClosed),
            res = self.inner.rx.recv_async() => res.map_err(|_| MuxError::ListenerClosed),
        }
    }

    fn close(&self) -> MuxResult<()> {
        if self.inner.signal.close() {
            self.drain();
        }
        Ok(())
    }
}

/// Wrapper that closes its inner listener at most once.
pub struct OnceCloseListener {
    inner: Arc<dyn Listener>,
    signal: CloseSignal,
}

impl OnceCloseListener {
    pub fn new(inner: Arc<dyn Listener>) -> Self {
        Self {
            inner,
            signal: CloseSignal::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }
}

#[async_trait]
impl Listener for OnceCloseListener {
    async fn accept(&self) -> MuxResult<Conn> {
        if self.signal.is_closed() {
            return Err(MuxError::ListenerClosed);
        }
        tokio::select! {
            biased;
            _ = self.signal.wait() => Err(MuxError::ListenerClosed),
            res = self.inner.accept() => res,
        }
    }

    fn close(&self) -> MuxResult<()> {
        if self.signal.close() {
            return self.inner.close();
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }
}
