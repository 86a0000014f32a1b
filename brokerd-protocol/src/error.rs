//! Protocol error types and error codes.

use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur while framing or parsing.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown frame type: {0}")]
    UnknownFrameType(i32),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("frame too small: size field {0} cannot hold a frame type")]
    FrameTooSmall(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable error codes written at the start of error frame bodies.
///
/// Clients of every protocol version match on these strings, so they must
/// never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The client sent a protocol magic the server does not speak.
    BadProtocol,
    /// The client sent a malformed or unknown command.
    Invalid,
}

impl ErrorCode {
    /// Returns the wire representation of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadProtocol => "E_BAD_PROTOCOL",
            ErrorCode::Invalid => "E_INVALID",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
