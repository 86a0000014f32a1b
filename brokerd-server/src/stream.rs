//! Stream abstraction with an out-of-band close switch.
//!
//! A session loop owns its stream exclusively, so nothing else can close the
//! socket directly. Instead every stream is wrapped in a [`ClosableStream`]
//! whose [`CloseHandle`] can be triggered from any task: the next (or
//! currently pending) read or write then fails with
//! `io::ErrorKind::ConnectionAborted`, the loop returns, and dropping the
//! stream closes the socket.

use futures_util::task::AtomicWaker;
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Any bidirectional async byte stream a connection can run on.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased stream, so TCP sockets and in-memory pipes share one type.
pub type BoxedStream = Box<dyn AsyncStream>;

#[derive(Debug, Default)]
struct CloseSignal {
    closed: AtomicBool,
    waker: AtomicWaker,
}

/// Cloneable handle that force-closes a [`ClosableStream`].
#[derive(Debug, Clone)]
pub struct CloseHandle {
    signal: Arc<CloseSignal>,
}

impl CloseHandle {
    fn new() -> Self {
        Self {
            signal: Arc::new(CloseSignal::default()),
        }
    }

    /// Marks the stream closed and wakes the task blocked on it.
    ///
    /// Returns `false` if the stream was already closed.
    pub fn close(&self) -> bool {
        let first = !self.signal.closed.swap(true, Ordering::SeqCst);
        self.signal.waker.wake();
        first
    }

    pub fn is_closed(&self) -> bool {
        self.signal.closed.load(Ordering::SeqCst)
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed by server")
}

pin_project! {
    /// A stream that fails all further I/O once its [`CloseHandle`] fires.
    pub struct ClosableStream<S> {
        #[pin]
        inner: S,
        handle: CloseHandle,
    }
}

impl<S> ClosableStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            handle: CloseHandle::new(),
        }
    }

    /// Returns a handle that can close this stream from another task.
    pub fn close_handle(&self) -> CloseHandle {
        self.handle.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

impl CloseHandle {
    /// Registers the current task for wake-up and reports whether the
    /// stream is closed. The flag is checked again after registering so a
    /// concurrent `close` cannot slip between the check and the park.
    fn poll_closed(&self, cx: &mut Context<'_>) -> bool {
        if self.is_closed() {
            return true;
        }
        self.signal.waker.register(cx.waker());
        self.is_closed()
    }
}

impl<S: AsyncRead> AsyncRead for ClosableStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if this.handle.poll_closed(cx) {
            return Poll::Ready(Err(closed_error()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for ClosableStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        if this.handle.poll_closed(cx) {
            return Poll::Ready(Err(closed_error()));
        }
        this.inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        if this.handle.poll_closed(cx) {
            return Poll::Ready(Err(closed_error()));
        }
        this.inner.poll_flush(cx)
    }

    // Shutdown still reaches the socket after a close so the peer gets a FIN.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
