//! Accept loop and graceful shutdown.
//!
//! A [`Server`] drives one or more listeners into a shared [`ServeMux`].
//! Each accepted connection is tracked from `New` until it closes or is
//! hijacked, so [`Server::shutdown`] can wait for in-flight work and
//! [`Server::close`] can tear everything down at once.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::time::Duration;

use futures_util::FutureExt;
use rustls::ServerConfig;
use tokio::net::ToSocketAddrs;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::conn::{Conn, ConnInfo, ConnRegistry, ConnState, ConnStateHook, Lifecycle};
use crate::error::{AbortHandler, MuxError, MuxResult};
use crate::listener::{Listener, OnceCloseListener, TcpAcceptor};
use crate::mux::ServeMux;

/// Default interval between idle sweeps during graceful shutdown.
pub const DEFAULT_SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A connection still `New` after this long counts as idle at shutdown.
pub const NEW_CONN_IDLE_AFTER: Duration = Duration::from_secs(5);

/// Decides whether the accept loop keeps going after an error.
pub type ErrorPolicy = Arc<dyn Fn(&MuxError) -> bool + Send + Sync>;

type ShutdownCallback = Arc<dyn Fn() + Send + Sync>;

/// Exponential backoff for transient accept errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Connection multiplexing server.
///
/// Cheap to clone; clones share listeners, connections and shutdown state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    mux: Arc<ServeMux>,
    listeners: Mutex<HashMap<u64, Arc<OnceCloseListener>>>,
    next_listener_id: AtomicU64,
    conns: Arc<ConnRegistry>,
    in_shutdown: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    on_shutdown: Mutex<Vec<ShutdownCallback>>,
    error_policy: Mutex<ErrorPolicy>,
    conn_state_hook: Mutex<Option<ConnStateHook>>,
    cancel: Mutex<Option<watch::Receiver<bool>>>,
    backoff: Mutex<BackoffPolicy>,
    shutdown_poll_ms: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Server {
    pub fn new(mux: impl Into<Arc<ServeMux>>) -> Self {
        install_panic_hook();
        let (shutdown_tx, _) = watch::channel(false);
        let error_policy: ErrorPolicy = Arc::new(MuxError::is_temporary);
        Self {
            inner: Arc::new(ServerInner {
                mux: mux.into(),
                listeners: Mutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
                conns: Arc::new(ConnRegistry::default()),
                in_shutdown: AtomicBool::new(false),
                shutdown_tx,
                on_shutdown: Mutex::new(Vec::new()),
                error_policy: Mutex::new(error_policy),
                conn_state_hook: Mutex::new(None),
                cancel: Mutex::new(None),
                backoff: Mutex::new(BackoffPolicy::default()),
                shutdown_poll_ms: AtomicU64::new(
                    DEFAULT_SHUTDOWN_POLL_INTERVAL.as_millis() as u64,
                ),
            }),
        }
    }

    /// The classifier connections are served through.
    pub fn mux(&self) -> &Arc<ServeMux> {
        &self.inner.mux
    }

    /// Stop accept loops once `cancel` turns `true`.
    ///
    /// Connections already being served are left alone.
    pub fn with_cancel_signal(self, cancel: watch::Receiver<bool>) -> Self {
        *lock(&self.inner.cancel) = Some(cancel);
        self
    }

    /// Replace the accept-error policy. Returning `true` retries with backoff.
    ///
    /// The default retries only errors where [`MuxError::is_temporary`] holds.
    pub fn handle_error<F>(&self, policy: F)
    where
        F: Fn(&MuxError) -> bool + Send + Sync + 'static,
    {
        *lock(&self.inner.error_policy) = Arc::new(policy);
    }

    /// Observe lifecycle transitions of connections accepted from now on.
    pub fn set_conn_state_hook<F>(&self, hook: F)
    where
        F: Fn(&ConnInfo, ConnState) + Send + Sync + 'static,
    {
        let hook: ConnStateHook = Arc::new(hook);
        *lock(&self.inner.conn_state_hook) = Some(hook);
    }

    /// Run `f` on its own task when shutdown begins.
    pub fn register_on_shutdown<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.inner.on_shutdown).push(Arc::new(f));
    }

    pub fn set_backoff(&self, backoff: BackoffPolicy) {
        *lock(&self.inner.backoff) = backoff;
    }

    pub fn set_shutdown_poll_interval(&self, interval: Duration) {
        self.inner
            .shutdown_poll_ms
            .store(interval.as_millis().max(1) as u64, Ordering::Relaxed);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.in_shutdown.load(Ordering::Acquire)
    }

    /// Connections currently tracked (not closed, not hijacked).
    pub fn active_connections(&self) -> usize {
        self.inner.conns.len()
    }

    /// Accept connections from `listener` until it fails or the server
    /// shuts down. Always returns an error; [`MuxError::ServerClosed`]
    /// after shutdown.
    pub async fn serve<L>(&self, listener: L) -> MuxResult<()>
    where
        L: Listener + 'static,
    {
        self.serve_inner(Arc::new(listener), None).await
    }

    /// Like [`Server::serve`], terminating TLS before classification.
    ///
    /// `cert_file` and `key_file` are only read when `config` is `None`.
    pub async fn serve_tls<L>(
        &self,
        listener: L,
        config: Option<Arc<ServerConfig>>,
        cert_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
    ) -> MuxResult<()>
    where
        L: Listener + 'static,
    {
        if self.is_shutting_down() {
            return Err(MuxError::ServerClosed);
        }
        let config = match config {
            Some(config) => config,
            None => crate::tls::server_config(cert_file, key_file)?,
        };
        self.serve_inner(Arc::new(listener), Some(TlsAcceptor::from(config)))
            .await
    }

    /// Bind `addr` and serve it.
    pub async fn listen_and_serve(&self, addr: impl ToSocketAddrs) -> MuxResult<()> {
        if self.is_shutting_down() {
            return Err(MuxError::ServerClosed);
        }
        let listener = TcpAcceptor::bind(addr).await?;
        self.serve(listener).await
    }

    /// Bind `addr` and serve it over TLS.
    pub async fn listen_and_serve_tls(
        &self,
        addr: impl ToSocketAddrs,
        cert_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
    ) -> MuxResult<()> {
        if self.is_shutting_down() {
            return Err(MuxError::ServerClosed);
        }
        let config = crate::tls::server_config(cert_file, key_file)?;
        let listener = TcpAcceptor::bind(addr).await?;
        self.serve_inner(Arc::new(listener), Some(TlsAcceptor::from(config)))
            .await
    }

    async fn serve_inner(
        &self,
        listener: Arc<dyn Listener>,
        tls: Option<TlsAcceptor>,
    ) -> MuxResult<()> {
        let listener = Arc::new(OnceCloseListener::new(listener));
        let Some(listener_id) = self.track_listener(&listener) else {
            let _ = listener.close();
            return Err(MuxError::ServerClosed);
        };

        let bind_addr = listener.local_addr();
        if self.inner.mux.read_timeout().is_none() {
            warn!(
                bind_addr = ?bind_addr,
                "Serving without a read timeout; silent peers can stall classification"
            );
        }
        info!(bind_addr = ?bind_addr, tls = tls.is_some(), "Serving");

        let result = self.accept_loop(&listener, tls).await;

        lock(&self.inner.listeners).remove(&listener_id);
        let _ = listener.close();
        debug!(bind_addr = ?bind_addr, result = ?result, "Accept loop finished");
        result
    }

    /// Register `listener`, unless shutdown has already started.
    fn track_listener(&self, listener: &Arc<OnceCloseListener>) -> Option<u64> {
        let mut listeners = lock(&self.inner.listeners);
        if self.is_shutting_down() {
            return None;
        }
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        listeners.insert(id, Arc::clone(listener));
        Some(id)
    }

    async fn accept_loop(
        &self,
        listener: &OnceCloseListener,
        tls: Option<TlsAcceptor>,
    ) -> MuxResult<()> {
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let mut cancel = lock(&self.inner.cancel).clone();
        let backoff = *lock(&self.inner.backoff);
        let mut attempt = 0u32;

        loop {
            if self.is_shutting_down() {
                return Err(MuxError::ServerClosed);
            }

            let accepted = tokio::select! {
                biased;
                _ = signalled(&mut shutdown_rx) => return Err(MuxError::ServerClosed),
                _ = cancelled(&mut cancel) => {
                    debug!("Cancel signal received");
                    return Err(MuxError::ServerClosed);
                }
                res = listener.accept() => res,
            };

            let conn = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    if self.is_shutting_down() {
                        return Err(MuxError::ServerClosed);
                    }
                    let policy = Arc::clone(&*lock(&self.inner.error_policy));
                    if !policy(&e) {
                        error!(error = %e, "Accept failed");
                        return Err(e);
                    }

                    let delay = backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Accept error; retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = signalled(&mut shutdown_rx) => return Err(MuxError::ServerClosed),
                    }
                    continue;
                }
            };

            attempt = 0;
            self.spawn_conn(conn, tls.clone());
        }
    }

    fn spawn_conn(&self, mut conn: Conn, tls: Option<TlsAcceptor>) {
        let info = *conn.info();
        let hook = lock(&self.inner.conn_state_hook).clone();
        let lifecycle = Lifecycle::new(info, hook, Arc::downgrade(&self.inner.conns));
        self.inner.conns.insert(Arc::clone(&lifecycle));
        lifecycle.set_state(ConnState::New);
        conn.attach(Arc::clone(&lifecycle));

        let mux = Arc::clone(&self.inner.mux);
        let conns = Arc::clone(&self.inner.conns);
        let span = info_span!("connection", id = info.id, peer = ?info.peer_addr);

        tokio::spawn(
            async move {
                debug!("Accepted connection");
                let mut serve = std::pin::pin!(serve_conn(&mux, conn, &lifecycle, tls));
                let serve = std::future::poll_fn(|cx| {
                    let _scope = ServingScope::enter();
                    serve.as_mut().poll(cx)
                });
                let outcome = tokio::select! {
                    res = AssertUnwindSafe(serve).catch_unwind() => res,
                    _ = lifecycle.closed() => {
                        debug!("Connection closed by server");
                        Ok(())
                    }
                };
                if let Err(payload) = outcome {
                    log_panic(payload);
                }

                let (state, _) = lifecycle.state();
                if state != ConnState::Hijacked {
                    if state != ConnState::Closed {
                        lifecycle.set_state(ConnState::Closed);
                    }
                    lifecycle.close();
                }
                conns.remove(info.id);
            }
            .instrument(span),
        );
    }

    /// Stop accepting and wait for tracked connections to go idle.
    ///
    /// Closes every listener (including the mux's sub-listeners), starts the
    /// shutdown callbacks, then sweeps connections every poll interval,
    /// closing idle ones, until none are left. Hijacked connections are
    /// not waited for.
    pub async fn shutdown(&self) -> MuxResult<()> {
        self.begin_shutdown();
        let result = self.close_listeners();

        let callbacks = lock(&self.inner.on_shutdown).clone();
        for callback in callbacks {
            tokio::spawn(async move { callback() });
        }
        self.inner.mux.close_listeners();

        let interval = Duration::from_millis(self.inner.shutdown_poll_ms.load(Ordering::Relaxed));
        loop {
            if self.close_idle_conns() {
                info!("Shutdown complete");
                return result;
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// [`Server::shutdown`] bounded by `grace`.
    ///
    /// Fails with [`MuxError::ShutdownTimeout`] if connections are still
    /// busy when `grace` runs out; they are left open for [`Server::close`].
    pub async fn shutdown_timeout(&self, grace: Duration) -> MuxResult<()> {
        match tokio::time::timeout(grace, self.shutdown()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    remaining = self.active_connections(),
                    "Shutdown grace period elapsed"
                );
                Err(MuxError::ShutdownTimeout)
            }
        }
    }

    /// Close every listener and every tracked connection immediately.
    pub fn close(&self) -> MuxResult<()> {
        self.begin_shutdown();
        let result = self.close_listeners();
        self.inner.mux.close_listeners();

        let conns = self.inner.conns.drain();
        if !conns.is_empty() {
            info!(count = conns.len(), "Force-closing connections");
        }
        for lifecycle in conns {
            lifecycle.close();
        }
        result
    }

    fn begin_shutdown(&self) {
        if !self.inner.in_shutdown.swap(true, Ordering::AcqRel) {
            info!("Shutting down");
        }
        self.inner.shutdown_tx.send_replace(true);
    }

    /// Close tracked listeners, returning the first error.
    fn close_listeners(&self) -> MuxResult<()> {
        let listeners: Vec<_> = lock(&self.inner.listeners).values().cloned().collect();
        let mut result = Ok(());
        for listener in listeners {
            if let Err(e) = listener.close() {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Close idle connections. `true` once no busy connection remains.
    fn close_idle_conns(&self) -> bool {
        let mut quiescent = true;
        for lifecycle in self.inner.conns.snapshot() {
            let (state, since) = lifecycle.state();
            if is_idle(state, since) {
                lifecycle.close();
            } else {
                quiescent = false;
            }
        }
        quiescent
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("mux", &self.inner.mux)
            .field("listeners", &lock(&self.inner.listeners).len())
            .field("connections", &self.inner.conns.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

/// Optional TLS handshake, then classification and the handler.
async fn serve_conn(
    mux: &ServeMux,
    mut conn: Conn,
    lifecycle: &Arc<Lifecycle>,
    tls: Option<TlsAcceptor>,
) {
    lifecycle.set_state(ConnState::Active);

    if let Some(acceptor) = tls {
        let info = *conn.info();
        conn.detach();
        let handshake = acceptor.accept(conn);
        let stream = match mux.read_timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, handshake).await {
                Ok(res) => res,
                Err(_) => {
                    debug!("TLS handshake timed out");
                    return;
                }
            },
            None => handshake.await,
        };
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                debug!(error = %e, "TLS handshake failed");
                return;
            }
        };
        conn = Conn::with_info(stream, info);
        conn.attach(Arc::clone(lifecycle));
    }

    mux.serve_conn(conn).await;
}

fn is_idle(state: ConnState, since: Instant) -> bool {
    match state {
        ConnState::Idle => true,
        ConnState::New => since.elapsed() > NEW_CONN_IDLE_AFTER,
        _ => false,
    }
}

async fn signalled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|set| *set).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Resolves when the cancel signal fires; never if there is none.
async fn cancelled(rx: &mut Option<watch::Receiver<bool>>) {
    match rx {
        Some(rx) => signalled(rx).await,
        None => std::future::pending().await,
    }
}

thread_local! {
    static SERVING: Cell<bool> = const { Cell::new(false) };
    static PANIC_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain onto the process panic hook, once.
///
/// [`abort_handler`](crate::abort_handler) panics are not reported at all.
/// Other panics raised while a connection task is being polled leave their
/// backtrace behind for [`log_panic`], captured before unwinding starts.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<AbortHandler>().is_some() {
                return;
            }
            if SERVING.with(Cell::get) {
                let backtrace = Backtrace::force_capture();
                PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
            }
            previous(info);
        }));
    });
}

/// Marks the current thread as polling a connection task.
struct ServingScope {
    outer: bool,
}

impl ServingScope {
    fn enter() -> Self {
        Self {
            outer: SERVING.with(|serving| serving.replace(true)),
        }
    }
}

impl Drop for ServingScope {
    fn drop(&mut self) {
        SERVING.with(|serving| serving.set(self.outer));
    }
}

fn take_panic_backtrace() -> Option<Backtrace> {
    PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take())
}

fn log_panic(payload: Box<dyn Any + Send>) {
    if payload.downcast_ref::<AbortHandler>().is_some() {
        debug!("Handler aborted");
        return;
    }
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    let backtrace = take_panic_backtrace()
        .map(|bt| bt.to_string())
        .unwrap_or_else(|| "unavailable".to_string());
    error!(panic = %message, backtrace = %backtrace, "Panic serving connection");
}
