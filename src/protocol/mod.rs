//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary framing layer:
//! - 8-byte header encoding/decoding (host byte order)
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{frame_message, Frame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{Header, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE, RESPONSE_FLAG};
