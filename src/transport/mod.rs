//! Transport module - event-loop transports and platform plumbing.
//!
//! Each transport owns one loop thread running a current-thread tokio
//! runtime; every socket-touching operation happens on that thread.
//! Other threads communicate with the loop through the write queue and
//! its [`Notify`](tokio::sync::Notify) wake primitive, and receive
//! frames and lifecycle changes back through [`TransportEvents`].

mod client;
mod endpoint;
mod server;
mod stream;

pub use endpoint::Endpoint;

pub(crate) use client::ClientTransport;
pub(crate) use server::ServerTransport;

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;

use crate::session::LogLevel;
use crate::Handle;

/// Read chunk size for the loop thread's receive buffer.
pub(crate) const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Callbacks a transport raises toward its session façade.
///
/// All of these are invoked on the transport's loop thread; the
/// session forwards user-visible work to its delivery queue.
pub(crate) struct TransportEvents {
    /// A peer connection is up.
    pub on_connect: Box<dyn Fn(Handle) + Send + Sync>,
    /// A peer connection went away (remote EOF, local request, or
    /// fatal write error).
    pub on_disconnect: Box<dyn Fn(Handle) + Send + Sync>,
    /// A complete frame arrived: `(connection, wire handle, body)`.
    pub on_data: Box<dyn Fn(Handle, u32, Bytes) + Send + Sync>,
    /// An invocation request was queued for a connection that no
    /// longer exists: `(connection, promise id)`.
    pub on_orphaned_invoke: Box<dyn Fn(Handle, Handle) + Send + Sync>,
    /// Fatal transport error.
    pub on_error: Box<dyn Fn(Handle) + Send + Sync>,
    /// Structured log record from the loop thread.
    pub on_log: Box<dyn Fn(Handle, LogLevel, String) + Send + Sync>,
}

/// Next connection handle from `counter`, skipping zero on wrap.
pub(crate) fn next_connection_handle(counter: &AtomicU32) -> Handle {
    let handle = counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    if handle != 0 {
        handle
    } else {
        counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

/// `true` for write/read errors that mean the peer went away rather
/// than anything being wrong locally.
pub(crate) fn is_peer_gone(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_handles_skip_zero() {
        let counter = AtomicU32::new(0);
        assert_eq!(next_connection_handle(&counter), 1);
        assert_eq!(next_connection_handle(&counter), 2);
    }

    #[test]
    fn test_connection_handles_skip_zero_on_wrap() {
        let counter = AtomicU32::new(u32::MAX);
        assert_eq!(next_connection_handle(&counter), 1);
    }

    #[test]
    fn test_peer_gone_classification() {
        use std::io::{Error, ErrorKind};

        assert!(is_peer_gone(&Error::from(ErrorKind::BrokenPipe)));
        assert!(is_peer_gone(&Error::from(ErrorKind::ConnectionReset)));
        assert!(is_peer_gone(&Error::from(ErrorKind::NotConnected)));
        assert!(!is_peer_gone(&Error::from(ErrorKind::PermissionDenied)));
        assert!(!is_peer_gone(&Error::from(ErrorKind::OutOfMemory)));
    }
}
