//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame with header and body.
//! Uses `bytes::Bytes` for zero-copy body sharing.
//!
//! # Example
//!
//! ```
//! use framewire::protocol::{Frame, Header, RESPONSE_FLAG};
//! use framewire::Bytes;
//!
//! let header = Header::new(42 | RESPONSE_FLAG, 5);
//! let frame = Frame::new(header, Bytes::from_static(b"hello"));
//!
//! assert!(frame.is_response());
//! assert_eq!(frame.promise_id(), 42);
//! assert_eq!(frame.body(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::Header;

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Body bytes (zero-copy via `bytes::Bytes`).
    pub body: Bytes,
}

impl Frame {
    /// Create a new frame from header and body.
    pub fn new(header: Header, body: Bytes) -> Self {
        Self { header, body }
    }

    /// Get a reference to the body bytes.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Get the body length.
    #[inline]
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Get the raw handle field (promise id, possibly with the
    /// response flag set).
    #[inline]
    pub fn handle(&self) -> u32 {
        self.header.handle
    }

    /// Check if this is a one-way message.
    #[inline]
    pub fn is_message(&self) -> bool {
        self.header.is_message()
    }

    /// Check if this is an invocation response.
    #[inline]
    pub fn is_response(&self) -> bool {
        self.header.is_response()
    }

    /// Check if this is an invocation request.
    #[inline]
    pub fn is_request(&self) -> bool {
        self.header.is_request()
    }

    /// The invocation id with the response flag cleared.
    #[inline]
    pub fn promise_id(&self) -> u32 {
        self.header.promise_id()
    }
}

/// Frame an outbound body in place: splice the 8-byte header onto the
/// front of the caller-provided vector and return it.
///
/// The returned vector is what the write queue owns and what the loop
/// thread hands to the socket in a single write.
pub fn frame_message(handle: u32, mut body: Vec<u8>) -> Vec<u8> {
    let header = Header::new(handle, body.len() as u32);
    body.splice(0..0, header.encode());
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HEADER_SIZE, RESPONSE_FLAG};

    #[test]
    fn test_frame_creation() {
        let header = Header::new(42, 5);
        let frame = Frame::new(header, Bytes::from_static(b"hello"));

        assert_eq!(frame.handle(), 42);
        assert_eq!(frame.body(), b"hello");
        assert_eq!(frame.body_len(), 5);
        assert!(frame.is_request());
    }

    #[test]
    fn test_frame_empty_body() {
        let frame = Frame::new(Header::new(0, 0), Bytes::new());

        assert_eq!(frame.body_len(), 0);
        assert!(frame.body().is_empty());
        assert!(frame.is_message());
    }

    #[test]
    fn test_frame_kind_accessors() {
        let message = Frame::new(Header::new(0, 0), Bytes::new());
        assert!(message.is_message());
        assert!(!message.is_request());
        assert!(!message.is_response());

        let request = Frame::new(Header::new(9, 0), Bytes::new());
        assert!(request.is_request());
        assert_eq!(request.promise_id(), 9);

        let response = Frame::new(Header::new(9 | RESPONSE_FLAG, 0), Bytes::new());
        assert!(response.is_response());
        assert_eq!(response.promise_id(), 9);
    }

    #[test]
    fn test_frame_message_prepends_header() {
        let framed = frame_message(42, b"hello".to_vec());

        assert_eq!(framed.len(), HEADER_SIZE + 5);
        let header = Header::decode(&framed).unwrap();
        assert_eq!(header.handle, 42);
        assert_eq!(header.body_size, 5);
        assert_eq!(&framed[HEADER_SIZE..], b"hello");
    }

    #[test]
    fn test_frame_message_empty_body() {
        let framed = frame_message(0, Vec::new());

        assert_eq!(framed.len(), HEADER_SIZE);
        let header = Header::decode(&framed).unwrap();
        assert_eq!(header.handle, 0);
        assert_eq!(header.body_size, 0);
    }

    #[test]
    fn test_frame_message_roundtrip() {
        use super::super::FrameBuffer;

        let framed = frame_message(123 | RESPONSE_FLAG, b"0123456789".to_vec());

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&framed).unwrap();

        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_response());
        assert_eq!(frames[0].promise_id(), 123);
        assert_eq!(frames[0].body(), b"0123456789");
    }
}
