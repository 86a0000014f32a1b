//! Server error types.

use brokerd_protocol::ProtocolMagic;
use std::net::SocketAddr;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] brokerd_protocol::ProtocolError),

    #[error("failed to read protocol magic: {0}")]
    HandshakeRead(#[source] std::io::Error),

    #[error("timed out waiting for protocol magic")]
    HandshakeTimeout,

    #[error("bad protocol magic '{0}'")]
    UnsupportedProtocol(ProtocolMagic),

    #[error("connection from {0} is already registered")]
    DuplicateConnection(SocketAddr),

    #[error("invalid command {0}")]
    InvalidCommand(String),

    #[error("command exceeds {0} bytes")]
    CommandTooLong(usize),

    #[error("idle timeout")]
    IdleTimeout,

    #[error("server shutting down")]
    ShuttingDown,
}

/// Coarse classification of a failure, used for logging and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The peer closed, errored or stalled before sending a full magic.
    HandshakeRead,
    /// The peer sent a magic nobody registered.
    UnsupportedProtocol,
    /// The connection could not be registered.
    Registry,
    /// The protocol handler's session loop failed.
    Session,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::HandshakeRead => "handshake_read",
            ErrorKind::UnsupportedProtocol => "unsupported_protocol",
            ErrorKind::Registry => "registry",
            ErrorKind::Session => "session",
        }
    }
}

impl ServerError {
    /// Returns the failure class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::HandshakeRead(_) | ServerError::HandshakeTimeout => {
                ErrorKind::HandshakeRead
            }
            ServerError::UnsupportedProtocol(_) => ErrorKind::UnsupportedProtocol,
            ServerError::DuplicateConnection(_) | ServerError::ShuttingDown => {
                ErrorKind::Registry
            }
            ServerError::Io(_)
            | ServerError::Protocol(_)
            | ServerError::InvalidCommand(_)
            | ServerError::CommandTooLong(_)
            | ServerError::IdleTimeout => ErrorKind::Session,
        }
    }

    /// Returns whether the error came from the connection being force-closed
    /// locally rather than from the peer.
    pub fn is_local_close(&self) -> bool {
        matches!(self, ServerError::Io(e) if e.kind() == std::io::ErrorKind::ConnectionAborted)
    }
}
