//! Replayable peeking over a byte stream.
//!
//! [`SniffStream`] wraps a reader and toggles between two modes:
//!
//! - **capture** (`sniff(true)`): reads walk the already-buffered bytes from
//!   the start, then continue into the source; fresh source bytes are teed
//!   into the active buffer.
//! - **replay** (`sniff(false)`): reads drain the history segments oldest
//!   first, then the active buffer, then the source. Drained bytes are gone.
//!
//! The unconsumed stream is always `history ++ active ++ unread source`, so
//! peeked bytes are delivered to the eventual reader exactly once no matter
//! how many capture cycles ran before it.
//!
//! ```text
//!            capture cursor
//!                 v
//! [ history seg ][ history seg ][ active ] | source ...
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

/// Reader decorator with capture/replay modes and an optional read deadline.
#[derive(Debug)]
pub struct SniffStream<S> {
    inner: S,
    /// Previously captured segments, in stream order.
    history: VecDeque<Bytes>,
    /// Bytes teed from the source during the current capture cycle.
    active: BytesMut,
    /// Offset into `history` for capture-mode reads.
    cursor: usize,
    sniffing: bool,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> SniffStream<S> {
    /// Wrap `inner` in replay mode with nothing buffered.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            history: VecDeque::new(),
            active: BytesMut::new(),
            cursor: 0,
            sniffing: false,
            deadline: None,
        }
    }

    /// Switch between capture (`true`) and replay (`false`) mode.
    ///
    /// Entering capture folds any leftover active bytes into the history and
    /// rewinds the capture cursor to the first unconsumed byte. Requesting
    /// the current mode is a no-op.
    pub fn sniff(&mut self, enabled: bool) {
        if self.sniffing == enabled {
            return;
        }
        self.sniffing = enabled;

        if enabled {
            if !self.active.is_empty() {
                let segment = self.active.split().freeze();
                self.history.push_back(segment);
            }
            self.cursor = 0;
        }
    }

    /// Whether the stream is in capture mode.
    pub fn is_sniffing(&self) -> bool {
        self.sniffing
    }

    /// Bytes read from the source that have not been consumed yet.
    pub fn buffered_len(&self) -> usize {
        self.history.iter().map(Bytes::len).sum::<usize>() + self.active.len()
    }

    /// Arm or clear the read deadline.
    ///
    /// Past the deadline, any read that has to touch the source fails with
    /// [`io::ErrorKind::TimedOut`]. Buffered bytes are still served. Must be
    /// called from within a tokio runtime.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        match (deadline, self.deadline.as_mut()) {
            (None, _) => self.deadline = None,
            (Some(at), Some(sleep)) => sleep.as_mut().reset(at),
            (Some(at), None) => self.deadline = Some(Box::pin(tokio::time::sleep_until(at))),
        }
    }

    /// Shared access to the wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Mutable access to the wrapped stream.
    ///
    /// Reading from it directly bypasses the buffers.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Serve capture-mode bytes from history without consuming them.
    fn read_history(&mut self, buf: &mut ReadBuf<'_>) -> usize {
        let mut skip = self.cursor;
        for segment in &self.history {
            if skip >= segment.len() {
                skip -= segment.len();
                continue;
            }
            let n = (segment.len() - skip).min(buf.remaining());
            buf.put_slice(&segment[skip..skip + n]);
            self.cursor += n;
            return n;
        }
        0
    }

    /// Serve replay-mode bytes, evicting whatever is consumed.
    fn read_replay(&mut self, buf: &mut ReadBuf<'_>) -> usize {
        while let Some(front) = self.history.front_mut() {
            if front.is_empty() {
                self.history.pop_front();
                continue;
            }
            let n = front.len().min(buf.remaining());
            buf.put_slice(&front[..n]);
            front.advance(n);
            if front.is_empty() {
                self.history.pop_front();
            }
            return n;
        }

        if !self.active.is_empty() {
            let n = self.active.len().min(buf.remaining());
            buf.put_slice(&self.active[..n]);
            self.active.advance(n);
            if self.active.is_empty() {
                // Release the capture allocation once fully replayed.
                self.active = BytesMut::new();
            }
            return n;
        }

        0
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SniffStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let served = if this.sniffing {
            this.read_history(buf)
        } else {
            this.read_replay(buf)
        };
        if served > 0 {
            return Poll::Ready(Ok(()));
        }

        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "read deadline exceeded",
                )));
            }
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if this.sniffing {
            this.active.extend_from_slice(&buf.filled()[before..]);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SniffStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
