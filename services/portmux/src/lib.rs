//! Connection multiplexer.
//!
//! Serves several protocols on one listening socket by looking at the first
//! bytes of each connection:
//!
//! ```no_run
//! use portmux::{matcher, ServeMux, Server, UpstreamProxy};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), portmux::MuxError> {
//! let mux = ServeMux::new();
//! mux.set_read_timeout(Some(Duration::from_secs(1)));
//! mux.handle(matcher::grpc(), UpstreamProxy::new("127.0.0.1:9000".parse().unwrap()));
//! mux.handle(matcher::http1_fast(), UpstreamProxy::new("127.0.0.1:9001".parse().unwrap()));
//! let _ssh = mux.handle_listener(matcher::prefix(["SSH-"]));
//!
//! let server = Server::new(mux);
//! server.listen_and_serve("[::]:8080").await
//! # }
//! ```
//!
//! Peeked bytes are never lost: every destination reads the stream from its
//! first byte.

pub mod conn;
pub mod error;
pub mod listener;
pub mod matcher;
pub mod mux;
pub mod proxy;
pub mod server;
pub mod sniff;
pub mod tls;

pub use conn::{Conn, ConnInfo, ConnState, ConnStateHook, Io};
pub use error::{abort_handler, AbortHandler, MuxError, MuxResult};
pub use listener::{Listener, OnceCloseListener, SubListener, TcpAcceptor};
pub use matcher::Matcher;
pub use mux::{handler_fn, Handler, HandlerFn, NotFound, ServeMux};
pub use proxy::UpstreamProxy;
pub use server::{BackoffPolicy, ErrorPolicy, Server};
pub use sniff::SniffStream;
