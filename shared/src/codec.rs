//! Length-prefixed codec for stream transports
//!
//! Every message is framed as:
//! ```text
//! [ 4 bytes: length (u32, big-endian) ][ N bytes: protobuf Message ]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message as _;
use thiserror::Error;

use crate::Message;

/// Maximum frame size (4 MB); bundles are referenced, never inlined
pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("Invalid frame length prefix: {0}")]
    InvalidLength(u32),

    #[error("Protobuf decode error: {0}")]
    DecodeError(#[from] prost::DecodeError),

    #[error("Protobuf encode error: {0}")]
    EncodeError(#[from] prost::EncodeError),
}

/// Encode a message into a length-prefixed frame
pub fn encode(message: &Message) -> Result<Bytes, CodecError> {
    let len = message.encoded_len();
    if len > MAX_FRAME_SIZE as usize {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mut buf = BytesMut::with_capacity(4 + len);
    buf.put_u32(len as u32);
    message.encode(&mut buf)?;

    Ok(buf.freeze())
}

/// Try to decode one frame from the front of `buf`
///
/// Returns `Ok(None)` and leaves `buf` untouched when the frame is incomplete.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>, CodecError> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::InvalidLength(len));
    }

    if buf.len() < 4 + len as usize {
        return Ok(None);
    }

    buf.advance(4);
    let frame = buf.split_to(len as usize);

    Ok(Some(Message::decode(frame)?))
}

/// Accumulates stream reads and yields complete frames
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Add data read from the stream
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Call repeatedly until it returns `Ok(None)` to drain all complete frames
    pub fn decode_next(&mut self) -> Result<Option<Message>, CodecError> {
        decode(&mut self.buffer)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
