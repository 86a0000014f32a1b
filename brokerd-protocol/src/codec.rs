//! Encoder and decoder for framed responses.

use crate::error::{ErrorCode, ProtocolError};
use crate::frame::Frame;
use bytes::{Bytes, BytesMut};

/// Encodes framed responses.
pub struct Encoder;

impl Encoder {
    /// Encodes a response frame with the given body.
    pub fn encode_response(body: impl Into<Bytes>) -> Result<BytesMut, ProtocolError> {
        Frame::response(body).encode()
    }

    /// Encodes an error frame carrying `code` and an optional detail.
    pub fn encode_error(code: ErrorCode, detail: Option<&str>) -> Result<BytesMut, ProtocolError> {
        Frame::error(code, detail).encode()
    }
}

/// Accumulates bytes read from a stream and yields complete frames.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameType;

    #[test]
    fn test_decoder_byte_at_a_time() {
        let encoded = Encoder::encode_error(ErrorCode::BadProtocol, None).unwrap();
        let mut decoder = Decoder::new();

        for (i, byte) in encoded.iter().enumerate() {
            decoder.extend(&[*byte]);
            let frame = decoder.decode_frame().unwrap();
            if i + 1 < encoded.len() {
                assert!(frame.is_none());
            } else {
                let frame = frame.unwrap();
                assert_eq!(frame.frame_type, FrameType::Error);
                assert_eq!(frame.body.as_ref(), b"E_BAD_PROTOCOL");
            }
        }
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_clear() {
        let mut decoder = Decoder::default();
        decoder.extend(b"\x00\x00");
        assert_eq!(decoder.buffered(), 2);
        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_encode_response() {
        let encoded = Encoder::encode_response("CLOSE_WAIT").unwrap();
        assert_eq!(encoded.len(), 8 + "CLOSE_WAIT".len());
    }
}
