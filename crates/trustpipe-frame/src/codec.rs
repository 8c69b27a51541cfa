use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: little-endian payload length (4 bytes).
pub const HEADER_SIZE: usize = 4;

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// A single framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The message payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Whether this frame is the zero-length close sentinel.
    ///
    /// The codec decodes it like any other frame; the connection layer treats it
    /// as an orderly close and never as an empty message.
    pub fn is_close_sentinel(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Encode a payload into the wire format.
///
/// Wire format:
/// ```text
/// ┌────────────┬─────────────────┐
/// │ Length     │ Payload         │
/// │ (4B LE)    │ (Length bytes)  │
/// └────────────┴─────────────────┘
/// ```
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u32_le(len);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    let Some(payload_len) = peek_length(src) else {
        return Ok(None);
    };

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame { payload }))
}

/// Classify leftover bytes at end of stream.
///
/// `None` means the stream ended cleanly on a frame boundary.
pub fn truncation(src: &BytesMut) -> Option<FrameError> {
    if src.is_empty() {
        return None;
    }
    match peek_length(src) {
        None => Some(FrameError::TruncatedFrame {
            expected: HEADER_SIZE,
            received: src.len(),
        }),
        Some(len) => Some(FrameError::TruncatedFrame {
            expected: len,
            received: src.len() - HEADER_SIZE,
        }),
    }
}

fn peek_length(src: &BytesMut) -> Option<usize> {
    let header: [u8; HEADER_SIZE] = src.get(..HEADER_SIZE)?.try_into().ok()?;
    Some(u32::from_le_bytes(header) as usize)
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl FrameConfig {
    /// A configuration that only enforces the wire format's own `u32` limit.
    pub fn unlimited() -> Self {
        Self {
            max_payload_size: u32::MAX as usize,
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}
