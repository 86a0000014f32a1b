//! Framed responses shared by all protocol versions.
//!
//! Frame layout (8 bytes header + body):
//!
//! ```text
//! +-----------+------------+------------------+
//! | size      | frame_type | body             |
//! | 4 bytes   | 4 bytes    | size - 4 bytes   |
//! +-----------+------------+------------------+
//! ```
//!
//! `size` is big-endian and counts the frame type plus the body. The frame
//! type is a big-endian signed 32-bit integer.

use crate::error::{ErrorCode, ProtocolError};
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix in bytes.
pub const FRAME_SIZE_LEN: usize = 4;

/// Size of the frame type field in bytes.
pub const FRAME_TYPE_LEN: usize = 4;

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Response,
    Error,
    Message,
}

impl FrameType {
    pub fn as_i32(self) -> i32 {
        match self {
            FrameType::Response => 0,
            FrameType::Error => 1,
            FrameType::Message => 2,
        }
    }
}

impl TryFrom<i32> for FrameType {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(FrameType::Response),
            1 => Ok(FrameType::Error),
            2 => Ok(FrameType::Message),
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }
}

/// A single framed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub body: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, body: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            body: body.into(),
        }
    }

    /// Creates a response frame.
    pub fn response(body: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Response, body)
    }

    /// Creates an error frame whose body is the code, optionally followed by
    /// a space and a human-readable detail.
    pub fn error(code: ErrorCode, detail: Option<&str>) -> Self {
        let body = match detail {
            Some(detail) => format!("{} {}", code, detail),
            None => code.as_str().to_string(),
        };
        Self::new(FrameType::Error, body)
    }

    /// Returns the value of the size field for this frame.
    pub fn size(&self) -> usize {
        FRAME_TYPE_LEN + self.body.len()
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let size = self.size();
        if size > MAX_FRAME_SIZE as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: size.min(u32::MAX as usize) as u32,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_SIZE_LEN + size);
        buf.put_u32(size as u32);
        buf.put_i32(self.frame_type.as_i32());
        buf.put_slice(&self.body);
        Ok(buf)
    }

    /// Decodes a frame from bytes.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on malformed input.
    /// Nothing is consumed unless a whole frame is available.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_SIZE_LEN {
            return Ok(None);
        }

        let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if (size as usize) < FRAME_TYPE_LEN {
            return Err(ProtocolError::FrameTooSmall(size));
        }
        if size > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: MAX_FRAME_SIZE,
            });
        }

        let total_len = FRAME_SIZE_LEN + size as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let raw_type = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let frame_type = FrameType::try_from(raw_type)?;

        buf.advance(FRAME_SIZE_LEN + FRAME_TYPE_LEN);
        let body = buf.split_to(size as usize - FRAME_TYPE_LEN).freeze();

        Ok(Some(Self { frame_type, body }))
    }

    /// Returns the error code at the start of an error frame body, if the
    /// body is valid UTF-8.
    pub fn error_code(&self) -> Option<&str> {
        if self.frame_type != FrameType::Error {
            return None;
        }
        let text = std::str::from_utf8(&self.body).ok()?;
        text.split(' ').next()
    }
}
