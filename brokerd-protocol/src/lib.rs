//! # brokerd-protocol
//!
//! Wire primitives shared by every brokerd protocol version.
//!
//! This crate provides:
//! - The 4-byte protocol magic sent first by every client
//! - Length-prefixed framed responses (response, error, message)
//! - A buffering decoder for reading frames back
//! - Stable error codes carried in error frames

pub mod codec;
pub mod error;
pub mod frame;
pub mod magic;

pub use codec::{Decoder, Encoder};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, FrameType, FRAME_SIZE_LEN, FRAME_TYPE_LEN};
pub use magic::{ProtocolMagic, MAGIC_LEN, MAGIC_V2};

/// Default TCP port for brokerd.
pub const DEFAULT_TCP_PORT: u16 = 4150;

/// Maximum frame size (16 MiB), counting the frame type and body.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
