//! Wire format encoding and decoding.
//!
//! Implements the 8-byte frame header:
//!
//! ```text
//! ┌──────────────┬──────────────┐
//! │ Handle       │ Body size    │
//! │ 4 bytes      │ 4 bytes      │
//! │ uint32 host  │ uint32 host  │
//! └──────────────┴──────────────┘
//! ```
//!
//! Both fields use the host's native byte order: peers are co-located
//! (local transport) or on loopback with the same architecture. A
//! portable revision would switch to network order.
//!
//! The `handle` field encodes the frame kind:
//! - `0` — one-way message
//! - nonzero, high bit clear — invocation request with that promise id
//! - nonzero, high bit set — response to `handle & !RESPONSE_FLAG`

use crate::error::{FramewireError, Result};

/// Header size in bytes (fixed, exactly 8).
pub const HEADER_SIZE: usize = 8;

/// High bit of the handle field marks a frame as an invocation response.
pub const RESPONSE_FLAG: u32 = 0x8000_0000;

/// Default maximum body size (1 GiB). A header claiming more than this
/// is treated as a protocol violation and tears the connection down.
pub const DEFAULT_MAX_BODY_SIZE: u32 = 1_073_741_824;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Invocation id, possibly OR'd with [`RESPONSE_FLAG`]. Zero for
    /// one-way messages.
    pub handle: u32,
    /// Body length in bytes.
    pub body_size: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(handle: u32, body_size: u32) -> Self {
        Self { handle, body_size }
    }

    /// Encode header to bytes (host byte order).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.handle.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.body_size.to_ne_bytes());
        buf
    }

    /// Decode header from bytes (host byte order).
    ///
    /// Returns `None` if the buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            handle: u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]),
            body_size: u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    /// Validate the body size against a maximum.
    pub fn validate(&self, max_body_size: u32) -> Result<()> {
        if self.body_size > max_body_size {
            return Err(FramewireError::Protocol(format!(
                "Body size {} exceeds maximum {}",
                self.body_size, max_body_size
            )));
        }
        Ok(())
    }

    /// Check if this frame is a one-way message.
    #[inline]
    pub fn is_message(&self) -> bool {
        self.handle == 0
    }

    /// Check if this frame is an invocation response.
    #[inline]
    pub fn is_response(&self) -> bool {
        self.handle & RESPONSE_FLAG != 0
    }

    /// Check if this frame is an invocation request.
    #[inline]
    pub fn is_request(&self) -> bool {
        self.handle != 0 && !self.is_response()
    }

    /// The invocation id with the response flag cleared.
    #[inline]
    pub fn promise_id(&self) -> u32 {
        self.handle & !RESPONSE_FLAG
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(42 | RESPONSE_FLAG, 100);
        let encoded = original.encode();
        let decoded = Header::decode(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_host_byte_order() {
        let header = Header::new(0x0102_0304, 0x0506_0708);
        let bytes = header.encode();

        assert_eq!(&bytes[0..4], &0x0102_0304u32.to_ne_bytes());
        assert_eq!(&bytes[4..8], &0x0506_0708u32.to_ne_bytes());
    }

    #[test]
    fn test_header_size_is_exactly_8() {
        assert_eq!(HEADER_SIZE, 8);
        let header = Header::new(1, 0);
        assert_eq!(header.encode().len(), 8);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; 7]; // One byte short
        assert!(Header::decode(&buf).is_none());
    }

    #[test]
    fn test_frame_kind_classification() {
        assert!(Header::new(0, 0).is_message());
        assert!(!Header::new(0, 0).is_request());
        assert!(!Header::new(0, 0).is_response());

        let request = Header::new(7, 10);
        assert!(request.is_request());
        assert!(!request.is_response());
        assert_eq!(request.promise_id(), 7);

        let response = Header::new(7 | RESPONSE_FLAG, 10);
        assert!(response.is_response());
        assert!(!response.is_request());
        assert!(!response.is_message());
        assert_eq!(response.promise_id(), 7);
    }

    #[test]
    fn test_validate_body_too_large() {
        let header = Header::new(1, 1_000_000);
        let result = header.validate(100);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_validate_at_limit() {
        let header = Header::new(1, 100);
        assert!(header.validate(100).is_ok());
    }

    #[test]
    fn test_response_flag_value() {
        assert_eq!(RESPONSE_FLAG, 0x8000_0000);
        // The largest assignable promise id still clears the flag.
        assert_eq!((RESPONSE_FLAG - 1) & RESPONSE_FLAG, 0);
    }
}
