//! Connection classifier.
//!
//! [`ServeMux`] holds an ordered list of `(matcher, destination)` entries.
//! For each connection the entries are tried front to back, each matcher in
//! its own capture cycle, and the first match wins. Connections nobody
//! claims go to the not-found handler.
//!
//! Registration can happen while serving: classification works on a
//! snapshot of the entry list taken when it starts.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::conn::Conn;
use crate::listener::{Listener, SubListener};
use crate::matcher::Matcher;

/// Response written to connections no matcher accepted.
pub const NOT_FOUND_RESPONSE: &[u8] =
    b"HTTP/1.1 404 Not Found\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

/// Destination that takes over a classified connection.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Serve `conn`. The connection is closed when this returns, unless
    /// it was hijacked.
    async fn serve_conn(&self, conn: Conn);
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn serve_conn(&self, conn: Conn) {
        (**self).serve_conn(conn).await
    }
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Box<H> {
    async fn serve_conn(&self, conn: Conn) {
        (**self).serve_conn(conn).await
    }
}

/// Adapter turning an async closure into a [`Handler`].
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Conn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn serve_conn(&self, conn: Conn) {
        (self.0)(conn).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Conn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    HandlerFn(f)
}

/// Default destination: a bare HTTP 404, then close.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotFound;

#[async_trait]
impl Handler for NotFound {
    async fn serve_conn(&self, mut conn: Conn) {
        debug!(
            conn_id = conn.id(),
            peer_addr = ?conn.peer_addr(),
            "Rejecting unmatched connection"
        );
        if conn.write_all(NOT_FOUND_RESPONSE).await.is_ok() {
            let _ = conn.shutdown().await;
        }
    }
}

/// Destination that queues connections on a [`SubListener`].
struct Forward {
    listener: SubListener,
}

#[async_trait]
impl Handler for Forward {
    async fn serve_conn(&self, mut conn: Conn) {
        // The sub-listener's consumer owns the connection from here on.
        if let Err(e) = conn.hijack() {
            debug!(conn_id = conn.id(), error = %e, "Cannot forward connection");
            return;
        }
        let conn_id = conn.id();
        if self.listener.push(conn).await.is_err() {
            debug!(conn_id, "Sub-listener closed, dropping connection");
        }
    }
}

#[derive(Clone)]
struct Entry {
    matcher: Arc<dyn Matcher>,
    handler: Arc<dyn Handler>,
}

#[derive(Clone)]
struct Routes {
    entries: Vec<Entry>,
    read_timeout: Option<Duration>,
    not_found: Arc<dyn Handler>,
}

/// Ordered protocol classifier.
pub struct ServeMux {
    routes: ArcSwap<Routes>,
    listeners: Mutex<Vec<SubListener>>,
}

impl Default for ServeMux {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServeMux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let routes = self.routes.load();
        f.debug_struct("ServeMux")
            .field("entries", &routes.entries.len())
            .field("read_timeout", &routes.read_timeout)
            .finish_non_exhaustive()
    }
}

impl ServeMux {
    /// An empty mux with no read timeout and [`NotFound`] as the default.
    pub fn new() -> Self {
        Self {
            routes: ArcSwap::from_pointee(Routes {
                entries: Vec::new(),
                read_timeout: None,
                not_found: Arc::new(NotFound),
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register a handler for connections `matcher` accepts.
    pub fn handle<M, H>(&self, matcher: M, handler: H)
    where
        M: Matcher + 'static,
        H: Handler + 'static,
    {
        let entry = Entry {
            matcher: Arc::new(matcher),
            handler: Arc::new(handler),
        };
        self.routes.rcu(|routes| {
            let mut routes = Routes::clone(routes);
            routes.entries.push(entry.clone());
            routes
        });
    }

    /// Register an async closure for connections `matcher` accepts.
    pub fn handle_fn<M, F, Fut>(&self, matcher: M, f: F)
    where
        M: Matcher + 'static,
        F: Fn(Conn) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handle(matcher, handler_fn(f));
    }

    /// Route connections `matcher` accepts to a new sub-listener.
    pub fn handle_listener<M>(&self, matcher: M) -> SubListener
    where
        M: Matcher + 'static,
    {
        let listener = SubListener::new();
        self.lock_listeners().push(listener.clone());
        self.handle(
            matcher,
            Forward {
                listener: listener.clone(),
            },
        );
        listener
    }

    /// Bound the whole classification phase of each connection.
    ///
    /// `None` (the default) lets a silent peer hold classification open
    /// indefinitely.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.routes.rcu(|routes| {
            let mut routes = Routes::clone(routes);
            routes.read_timeout = timeout;
            routes
        });
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.routes.load().read_timeout
    }

    /// Replace the destination for unmatched connections.
    pub fn set_not_found<H: Handler + 'static>(&self, handler: H) {
        let handler: Arc<dyn Handler> = Arc::new(handler);
        self.routes.rcu(|routes| {
            let mut routes = Routes::clone(routes);
            routes.not_found = Arc::clone(&handler);
            routes
        });
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.routes.load().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Classify `conn` and return its destination.
    ///
    /// On return the stream is in replay mode positioned at byte 0 and the
    /// read deadline is cleared.
    pub async fn handler(&self, conn: &mut Conn) -> Arc<dyn Handler> {
        let routes = self.routes.load_full();
        if let Some(timeout) = routes.read_timeout {
            conn.set_read_deadline(Some(Instant::now() + timeout));
        }

        for (index, entry) in routes.entries.iter().enumerate() {
            conn.sniff(true);
            let matched = entry.matcher.matches(conn).await;
            conn.sniff(false);
            if matched {
                conn.set_read_deadline(None);
                trace!(conn_id = conn.id(), entry = index, "Connection matched");
                return Arc::clone(&entry.handler);
            }
        }

        conn.set_read_deadline(None);
        debug!(
            conn_id = conn.id(),
            entries = routes.entries.len(),
            "No matcher accepted connection"
        );
        Arc::clone(&routes.not_found)
    }

    /// Classify `conn` and hand it to the chosen destination.
    pub async fn serve_conn(&self, mut conn: Conn) {
        let handler = self.handler(&mut conn).await;
        handler.serve_conn(conn).await;
    }

    /// Close every sub-listener created by [`ServeMux::handle_listener`].
    pub fn close_listeners(&self) {
        for listener in self.lock_listeners().iter() {
            let _ = listener.close();
        }
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<SubListener>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Handler for ServeMux {
    async fn serve_conn(&self, conn: Conn) {
        ServeMux::serve_conn(self, conn).await
    }
}
