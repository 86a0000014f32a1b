//! Protocol magic: the fixed 4-byte token a client sends before anything else.
//!
//! The token names the wire-protocol version the client wants to speak.
//! Version tokens are ASCII, left-padded with spaces (`"  V2"`).

use std::fmt;

/// Length of the protocol magic in bytes.
pub const MAGIC_LEN: usize = 4;

/// Magic for protocol version 2.
pub const MAGIC_V2: ProtocolMagic = ProtocolMagic(*b"  V2");

/// The raw 4-byte magic read from a freshly accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolMagic([u8; MAGIC_LEN]);

impl ProtocolMagic {
    pub const fn new(bytes: [u8; MAGIC_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds a magic from a slice, returning `None` unless it is exactly
    /// [`MAGIC_LEN`] bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; MAGIC_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; MAGIC_LEN] {
        &self.0
    }
}

impl From<[u8; MAGIC_LEN]> for ProtocolMagic {
    fn from(bytes: [u8; MAGIC_LEN]) -> Self {
        Self(bytes)
    }
}

/// Renders the magic for logs. Non-printable bytes are escaped so a garbage
/// handshake cannot corrupt log output.
impl fmt::Display for ProtocolMagic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{}", std::ascii::escape_default(b))?;
        }
        Ok(())
    }
}
