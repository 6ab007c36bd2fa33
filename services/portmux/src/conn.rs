//! Connections and their lifecycle.
//!
//! A [`Conn`] is an accepted byte stream behind a [`SniffStream`], so matchers
//! can peek at it and the chosen handler still sees every byte.
//!
//! Connections served by a [`Server`](crate::Server) also carry a lifecycle:
//!
//! ```text
//! New -> Active -> Idle <-> Active
//!           |  \
//!           |   -> Hijacked (terminal, no longer tracked)
//!           -> Closed (terminal)
//! ```
//!
//! Every transition stores a packed `(millis since accept << 8) | state` word
//! so the shutdown sweep can inspect it without locking, and fires the
//! optional state hook on the calling task. Ages come from the monotonic
//! clock; wall-clock steps do not affect them.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::task::AtomicWaker;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::error::MuxError;
use crate::sniff::SniffStream;

/// Byte stream a connection can be built from.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased connection stream.
pub type BoxedIo = Box<dyn Io>;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnState {
    /// Accepted, not yet classified.
    New = 0,
    /// Being classified or served.
    Active = 1,
    /// Handler finished a request cycle and keeps the connection open.
    Idle = 2,
    /// Handler took permanent ownership.
    Hijacked = 3,
    /// Closed.
    Closed = 4,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::New,
            1 => ConnState::Active,
            2 => ConnState::Idle,
            3 => ConnState::Hijacked,
            _ => ConnState::Closed,
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnState::Hijacked | ConnState::Closed)
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::New => "new",
            ConnState::Active => "active",
            ConnState::Idle => "idle",
            ConnState::Hijacked => "hijacked",
            ConnState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Identity of a connection, as seen by state hooks and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnInfo {
    pub id: u64,
    pub peer_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
}

/// Observer invoked on every lifecycle transition.
pub type ConnStateHook = Arc<dyn Fn(&ConnInfo, ConnState) + Send + Sync>;

/// Server-side registry of live connection lifecycles.
#[derive(Default)]
pub(crate) struct ConnRegistry {
    conns: Mutex<HashMap<u64, Arc<Lifecycle>>>,
}

impl ConnRegistry {
    pub(crate) fn insert(&self, lifecycle: Arc<Lifecycle>) {
        self.lock().insert(lifecycle.info.id, lifecycle);
    }

    pub(crate) fn remove(&self, id: u64) -> Option<Arc<Lifecycle>> {
        self.lock().remove(&id)
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Lifecycle>> {
        self.lock().values().cloned().collect()
    }

    pub(crate) fn drain(&self) -> Vec<Arc<Lifecycle>> {
        self.lock().drain().map(|(_, lc)| lc).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<Lifecycle>>> {
        // A panicking holder cannot leave the map half-updated.
        self.conns.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Per-connection lifecycle shared by the server, the serving task and the
/// [`Conn`] itself.
pub(crate) struct Lifecycle {
    info: ConnInfo,
    created: Instant,
    packed: AtomicU64,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    read_waker: AtomicWaker,
    write_waker: AtomicWaker,
    hook: Option<ConnStateHook>,
    registry: Weak<ConnRegistry>,
}

impl Lifecycle {
    pub(crate) fn new(
        info: ConnInfo,
        hook: Option<ConnStateHook>,
        registry: Weak<ConnRegistry>,
    ) -> Arc<Self> {
        let (close_tx, _) = watch::channel(false);
        Arc::new(Self {
            info,
            created: Instant::now(),
            packed: AtomicU64::new(ConnState::New as u64),
            closed: AtomicBool::new(false),
            close_tx,
            read_waker: AtomicWaker::new(),
            write_waker: AtomicWaker::new(),
            hook,
            registry,
        })
    }

    pub(crate) fn info(&self) -> &ConnInfo {
        &self.info
    }

    /// Record a transition and notify the hook.
    pub(crate) fn set_state(&self, state: ConnState) {
        let since = self.created.elapsed().as_millis() as u64;
        self.packed.store(pack(state, since), Ordering::Release);
        if let Some(hook) = &self.hook {
            hook(&self.info, state);
        }
    }

    /// Current state and when it was entered.
    pub(crate) fn state(&self) -> (ConnState, Instant) {
        let (state, since) = unpack(self.packed.load(Ordering::Acquire));
        (state, self.created + Duration::from_millis(since))
    }

    /// Mark hijacked and stop server tracking. Fails on the second call.
    fn hijack(&self) -> Result<(), MuxError> {
        let (state, _) = self.state();
        if state == ConnState::Hijacked {
            return Err(MuxError::Hijacked);
        }
        self.set_state(ConnState::Hijacked);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.info.id);
        }
        debug!(conn_id = self.info.id, "Connection hijacked");
        Ok(())
    }

    /// Force-close: fail pending and future I/O and wake the serving task.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.read_waker.wake();
        self.write_waker.wake();
        self.close_tx.send_replace(true);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once [`Lifecycle::close`] has been called.
    pub(crate) async fn closed(&self) {
        let mut rx = self.close_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

fn pack(state: ConnState, since_ms: u64) -> u64 {
    (since_ms << 8) | state as u64
}

fn unpack(packed: u64) -> (ConnState, u64) {
    (ConnState::from_u8((packed & 0xff) as u8), packed >> 8)
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed by server")
}

/// An accepted connection.
pub struct Conn {
    stream: SniffStream<BoxedIo>,
    info: ConnInfo,
    lifecycle: Option<Arc<Lifecycle>>,
    hijacked: bool,
}

impl Conn {
    /// Wrap a stream with unknown addresses.
    pub fn new<T: Io>(io: T) -> Self {
        Self::with_addrs(io, None, None)
    }

    /// Wrap a stream, recording its endpoints.
    pub fn with_addrs<T: Io>(
        io: T,
        peer_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            stream: SniffStream::new(Box::new(io)),
            info: ConnInfo {
                id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
                peer_addr,
                local_addr,
            },
            lifecycle: None,
            hijacked: false,
        }
    }

    /// Wrap a stream under an existing identity (e.g. after a TLS handshake).
    pub(crate) fn with_info<T: Io>(io: T, info: ConnInfo) -> Self {
        Self {
            stream: SniffStream::new(Box::new(io)),
            info,
            lifecycle: None,
            hijacked: false,
        }
    }

    /// Connection identity.
    pub fn info(&self) -> &ConnInfo {
        &self.info
    }

    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.info.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.info.local_addr
    }

    /// Toggle capture (`true`) or replay (`false`) mode on the stream.
    pub fn sniff(&mut self, enabled: bool) {
        self.stream.sniff(enabled);
    }

    /// Arm or clear the read deadline.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.stream.set_read_deadline(deadline);
    }

    /// Current lifecycle state, if the connection is server-tracked.
    pub fn state(&self) -> Option<ConnState> {
        if self.hijacked {
            return Some(ConnState::Hijacked);
        }
        self.lifecycle.as_ref().map(|lc| lc.state().0)
    }

    /// Report that a request cycle finished and the connection is idle.
    ///
    /// Idle connections are closed by a graceful shutdown.
    pub fn set_idle(&self) {
        self.transition(ConnState::Idle);
    }

    /// Report that the connection is busy again after being idle.
    pub fn set_active(&self) {
        self.transition(ConnState::Active);
    }

    fn transition(&self, state: ConnState) {
        if let Some(lc) = &self.lifecycle {
            if !lc.state().0.is_terminal() {
                lc.set_state(state);
            }
        }
    }

    /// Take permanent ownership of the connection.
    ///
    /// After this the server stops tracking it: shutdown does not wait for it
    /// and `close` does not touch it. Fails with [`MuxError::Hijacked`] when
    /// called twice.
    pub fn hijack(&mut self) -> Result<(), MuxError> {
        if self.hijacked {
            return Err(MuxError::Hijacked);
        }
        if let Some(lc) = self.lifecycle.take() {
            lc.hijack()?;
        }
        self.hijacked = true;
        Ok(())
    }

    /// Whether [`Conn::hijack`] has been called.
    pub fn is_hijacked(&self) -> bool {
        self.hijacked
    }

    /// Hand the connection to a new owner's lifecycle.
    ///
    /// A connection hijacked away from one server (e.g. delivered through a
    /// sub-listener) starts over when another server accepts it.
    pub(crate) fn attach(&mut self, lifecycle: Arc<Lifecycle>) {
        self.lifecycle = Some(lifecycle);
        self.hijacked = false;
    }

    pub(crate) fn detach(&mut self) -> Option<Arc<Lifecycle>> {
        self.lifecycle.take()
    }

    fn check_open(
        lc: &Option<Arc<Lifecycle>>,
        waker: fn(&Lifecycle) -> &AtomicWaker,
        cx: &Context<'_>,
    ) -> bool {
        match lc {
            Some(lc) => {
                waker(lc).register(cx.waker());
                !lc.is_closed()
            }
            None => true,
        }
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("info", &self.info)
            .field("state", &self.state())
            .field("buffered", &self.stream.buffered_len())
            .finish()
    }
}

impl From<TcpStream> for Conn {
    fn from(stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        let local_addr = stream.local_addr().ok();
        Conn::with_addrs(stream, peer_addr, local_addr)
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !Conn::check_open(&this.lifecycle, |lc| &lc.read_waker, cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if !Conn::check_open(&this.lifecycle, |lc| &lc.write_waker, cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !Conn::check_open(&this.lifecycle, |lc| &lc.write_waker, cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
