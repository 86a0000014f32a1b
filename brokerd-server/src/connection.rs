//! Accepted client connections.

use crate::stream::{BoxedStream, ClosableStream, CloseHandle};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Lifecycle state of a connection.
///
/// ```text
/// Accepted -> Negotiating -> Rejected ---------> Closed
///                         \-> Active -----------/
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Just returned by `accept`.
    Accepted,
    /// Waiting for the protocol magic.
    Negotiating,
    /// Magic was unreadable or unknown.
    Rejected,
    /// A protocol handler owns the connection.
    Active,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Returns whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Accepted, Negotiating)
                | (Accepted, Closed)
                | (Negotiating, Rejected)
                | (Negotiating, Active)
                | (Negotiating, Closed)
                | (Rejected, Closed)
                | (Active, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Accepted => "accepted",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Rejected => "rejected",
            ConnectionState::Active => "active",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A client connection.
///
/// Identified by its remote address for registry purposes; `id` is unique
/// for the life of the process and disambiguates reconnects from the same
/// address.
pub struct Connection {
    id: u64,
    remote_addr: SocketAddr,
    state: ConnectionState,
    stream: ClosableStream<BoxedStream>,
}

impl Connection {
    /// Wraps an accepted stream.
    pub fn new(id: u64, remote_addr: SocketAddr, stream: BoxedStream) -> Self {
        Self {
            id,
            remote_addr,
            state: ConnectionState::Accepted,
            stream: ClosableStream::new(stream),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Advances the lifecycle state. Illegal transitions are ignored and
    /// logged; states are never revisited.
    pub fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                "[{}] Ignoring illegal state transition {} -> {}",
                self.remote_addr,
                self.state,
                next
            );
            return;
        }
        tracing::trace!("[{}] {} -> {}", self.remote_addr, self.state, next);
        self.state = next;
    }

    /// Returns a handle that force-closes this connection from another task.
    pub fn close_handle(&self) -> CloseHandle {
        self.stream.close_handle()
    }

    /// Returns whether the connection was force-closed.
    pub fn is_closed(&self) -> bool {
        self.stream.is_closed()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.set_state(ConnectionState::Closed);
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
