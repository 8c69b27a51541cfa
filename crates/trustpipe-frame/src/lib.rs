//! Length-prefixed message framing for trustpipe.
//!
//! Every message on the pipe is a 4-byte little-endian payload length followed
//! by exactly that many payload bytes. A zero length at the prefix position is
//! the orderly-close sentinel.
//!
//! No partial reads, no buffer management in user code.

pub mod codec;
pub mod error;
pub mod pipe_codec;

pub use codec::{
    decode_frame, encode_frame, truncation, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use pipe_codec::PipeCodec;
