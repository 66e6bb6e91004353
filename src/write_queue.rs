//! Thread-safe FIFO of outbound frames.
//!
//! Any thread may enqueue; the transport's loop thread drains after
//! being woken through the cross-thread notify primitive. Framing (the
//! in-place header prepend) happens at enqueue time, so a queued entry
//! is exactly the bytes that will hit the socket.
//!
//! A drain takes at most the number of entries present when it starts,
//! so a producer that keeps enqueueing cannot starve the loop's other
//! duties.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::protocol::{frame_message, Header};
use crate::Handle;

/// A framed message waiting to be written.
#[derive(Debug)]
pub(crate) struct QueuedFrame {
    /// Target connection (zero = the client's single peer).
    pub conn: Handle,
    /// Header + body, ready for a single write.
    pub bytes: Vec<u8>,
}

impl QueuedFrame {
    /// Decode the header back out of the framed bytes.
    pub fn header(&self) -> Header {
        // A queued frame always starts with a full header.
        Header::decode(&self.bytes).unwrap_or(Header {
            handle: 0,
            body_size: 0,
        })
    }
}

/// Mutex-guarded FIFO of outbound frames.
#[derive(Default)]
pub(crate) struct WriteQueue {
    entries: Mutex<VecDeque<QueuedFrame>>,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame `body` with `handle` and append it for `conn`.
    pub fn push(&self, conn: Handle, handle: u32, body: Vec<u8>) {
        let frame = QueuedFrame {
            conn,
            bytes: frame_message(handle, body),
        };
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(frame);
    }

    /// Take everything queued at this moment, preserving order.
    ///
    /// Entries pushed while the batch is being written wait for the
    /// next wakeup.
    pub fn take_batch(&self) -> Vec<QueuedFrame> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let n = entries.len();
        entries.drain(..n).collect()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }
}
