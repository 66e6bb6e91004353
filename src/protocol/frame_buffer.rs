//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management and a state
//! machine for handling fragmented frames:
//! - `WaitingForHeader`: need at least 8 bytes
//! - `WaitingForBody`: header parsed, need N more body bytes
//!
//! Each connection's receive side owns one of these. Reading is
//! idempotent under arbitrary chunking: multiple frames in one read
//! and frames split across reads are both handled, and a completed
//! body is handed upward with a single `split_to().freeze()` move.

use bytes::{Bytes, BytesMut};

use super::wire_format::{Header, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::{FramewireError, Result};

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for a complete header (need 8 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for body bytes.
    WaitingForBody { header: Header },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed body size.
    max_body_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max body: 1GiB.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// Create a new frame buffer with a custom max body size.
    pub fn with_max_body(max_body_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_body_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns a vector of complete frames. If data is fragmented,
    /// partial data is buffered internally for the next push.
    ///
    /// # Errors
    ///
    /// Returns an error if a header claims a body larger than the
    /// configured maximum; the connection should be torn down.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Try to extract a single frame from the buffer.
    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        match &self.state {
            State::WaitingForHeader => {
                if self.buffer.len() < HEADER_SIZE {
                    return Ok(None);
                }

                let header = match Header::decode(&self.buffer[..HEADER_SIZE]) {
                    Some(h) => h,
                    None => return Ok(None),
                };

                if header.body_size > self.max_body_size {
                    return Err(FramewireError::Protocol(format!(
                        "Body size {} exceeds maximum {}",
                        header.body_size, self.max_body_size
                    )));
                }

                let _ = self.buffer.split_to(HEADER_SIZE);

                if header.body_size == 0 {
                    return Ok(Some(Frame::new(header, Bytes::new())));
                }

                self.state = State::WaitingForBody { header };
                self.try_extract_one()
            }

            State::WaitingForBody { header } => {
                let wanted = header.body_size as usize;
                if self.buffer.len() < wanted {
                    return Ok(None);
                }

                let body = self.buffer.split_to(wanted).freeze();
                let header = *header;
                self.state = State::WaitingForHeader;

                Ok(Some(Frame::new(header, body)))
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame_message;

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let bytes = frame_message(42, b"hello".to_vec());

        let frames = buffer.push(&bytes).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].handle(), 42);
        assert_eq!(frames[0].body(), b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();

        let mut combined = Vec::new();
        combined.extend_from_slice(&frame_message(1, b"first".to_vec()));
        combined.extend_from_slice(&frame_message(2, b"second".to_vec()));
        combined.extend_from_slice(&frame_message(3, b"third".to_vec()));

        let frames = buffer.push(&combined).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].handle(), 1);
        assert_eq!(frames[1].handle(), 2);
        assert_eq!(frames[2].handle(), 3);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_header() {
        let mut buffer = FrameBuffer::new();
        let bytes = frame_message(42, b"test".to_vec());

        let frames = buffer.push(&bytes[..5]).unwrap();
        assert!(frames.is_empty());
        assert_eq!(buffer.state_name(), "WaitingForHeader");

        let frames = buffer.push(&bytes[5..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].handle(), 42);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_body() {
        let mut buffer = FrameBuffer::new();
        let body = b"this is a longer body that will be fragmented";
        let bytes = frame_message(42, body.to_vec());

        let partial = HEADER_SIZE + 10;
        let frames = buffer.push(&bytes[..partial]).unwrap();
        assert!(frames.is_empty());
        assert_eq!(buffer.state_name(), "WaitingForBody");

        let frames = buffer.push(&bytes[partial..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].body(), body);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_empty_body() {
        let mut buffer = FrameBuffer::new();
        let bytes = frame_message(42, Vec::new());

        let frames = buffer.push(&bytes).unwrap();

        assert_eq!(frames.len(), 1);
        assert!(frames[0].body().is_empty());
        assert_eq!(frames[0].header.body_size, 0);
    }

    #[test]
    fn test_large_body() {
        let mut buffer = FrameBuffer::new();
        let body = vec![0xAB; 1024 * 1024]; // 1MB
        let bytes = frame_message(42, body.clone());

        let frames = buffer.push(&bytes).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].body_len(), 1024 * 1024);
        assert!(frames[0].body.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_max_body_validation() {
        let mut buffer = FrameBuffer::with_max_body(100);

        // Header claiming a 1000-byte body.
        let header = Header::new(1, 1000);
        let result = buffer.push(&header.encode());

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = FrameBuffer::new();
        let bytes = frame_message(42, b"test".to_vec());

        buffer.push(&bytes[..HEADER_SIZE]).unwrap();
        assert_eq!(buffer.state_name(), "WaitingForBody");

        buffer.clear();

        assert_eq!(buffer.state_name(), "WaitingForHeader");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_mixed_complete_and_partial() {
        let mut buffer = FrameBuffer::new();

        let frame1 = frame_message(1, b"first".to_vec());
        let frame2 = frame_message(2, b"second".to_vec());

        let mut data = frame1.clone();
        data.extend_from_slice(&frame2[..5]);

        let frames = buffer.push(&data).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].handle(), 1);

        let frames = buffer.push(&frame2[5..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].handle(), 2);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let bytes = frame_message(42, b"hi".to_vec());

        let mut all_frames = Vec::new();
        for byte in &bytes {
            all_frames.extend(buffer.push(&[*byte]).unwrap());
        }

        assert_eq!(all_frames.len(), 1);
        assert_eq!(all_frames[0].handle(), 42);
        assert_eq!(all_frames[0].body(), b"hi");
    }

    #[test]
    fn test_boundary_sizes_preserved() {
        // Sizes around the header boundary must come through intact.
        for size in [0usize, 1, HEADER_SIZE - 1, HEADER_SIZE, HEADER_SIZE + 1] {
            let body: Vec<u8> = (0..size).map(|i| i as u8).collect();
            let mut buffer = FrameBuffer::new();
            let frames = buffer.push(&frame_message(1, body.clone())).unwrap();
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].body(), &body[..]);
        }
    }
}
