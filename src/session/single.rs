//! Single-connection server session façade.
//!
//! An adapter over [`ServerSession`] with the latest-connection-only
//! accept policy: each new accept evicts whatever peer came before,
//! so the surface can look like a client session's, implicitly
//! addressed to the newest peer. The adapter remembers that peer's
//! handle from the most recent connect callback and filters out
//! events from any stale handle.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use super::{InvokeResult, LogLevel, ResultFn, ServerSession, SessionConfig};
use crate::error::Result;
use crate::transport::Endpoint;
use crate::Handle;

/// A listening endpoint that serves one peer at a time, evicting the
/// previous peer on every new accept.
pub struct SingleServerSession {
    inner: ServerSession,
    current: Arc<AtomicU32>,
}

impl SingleServerSession {
    /// Single-connection server for the platform-local transport.
    pub fn local(name: &str) -> Self {
        Self::new(Endpoint::local(name), SessionConfig::default())
    }

    /// Single-connection server for TCP.
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self::new(Endpoint::tcp(addr), SessionConfig::default())
    }

    pub fn new(endpoint: Endpoint, config: SessionConfig) -> Self {
        let config = SessionConfig {
            latest_connection_only: true,
            ..config
        };
        let inner = ServerSession::new(endpoint, config);
        let current = Arc::new(AtomicU32::new(0));

        let tracker = current.clone();
        inner.on_connect(move |conn| {
            tracker.store(conn, Ordering::SeqCst);
        });

        Self { inner, current }
    }

    fn current(&self) -> Handle {
        self.current.load(Ordering::SeqCst)
    }

    /// Bind and start listening. See [`ServerSession::listen`].
    pub fn listen(&self) -> Result<()> {
        self.inner.listen()
    }

    /// Stop listening and disconnect the peer.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Number of peers currently admitted (0 or 1). See
    /// [`ServerSession::active_connections`].
    pub fn active_connections(&self) -> usize {
        self.inner.active_connections()
    }

    /// Send a one-way message to the current peer, if any.
    pub fn send(&self, body: impl Into<Vec<u8>>) {
        let conn = self.current();
        if conn != 0 {
            self.inner.send(conn, body);
        }
    }

    /// Send an invocation to the current peer. Returns the promise id,
    /// or zero when no peer is connected.
    pub fn invoke(&self, body: impl Into<Vec<u8>>) -> Handle {
        let conn = self.current();
        if conn != 0 {
            self.inner.invoke(conn, body)
        } else {
            0
        }
    }

    /// Send an invocation to the current peer and register its
    /// completion. While listening with no peer connected, the frame
    /// has nowhere to go and the completion fires with
    /// [`InvokeResult::RemoteDisconnect`]; when not listening at all
    /// it fires with [`InvokeResult::LocalDisconnect`].
    pub fn invoke_with(
        &self,
        body: impl Into<Vec<u8>>,
        on_result: impl FnOnce(InvokeResult, Bytes) + Send + 'static,
    ) {
        self.inner.invoke_with(self.current(), body, on_result);
    }

    /// Answer an invocation. Discarded when `conn` is not the current
    /// peer.
    pub fn send_result(&self, conn: Handle, promise_id: Handle, body: impl Into<Vec<u8>>) {
        let current = self.current();
        if current != 0 && current == conn {
            self.inner.send_result(current, promise_id, body);
        }
    }

    /// Install the one-way message handler. Messages from a stale peer
    /// are dropped.
    pub fn on_received(&self, handler: impl Fn(Bytes) + Send + Sync + 'static) {
        let current = self.current.clone();
        self.inner.on_received(move |conn, body| {
            if current.load(Ordering::SeqCst) == conn {
                handler(body);
            }
        });
    }

    /// Install the promise-id invoked handler. See
    /// [`ServerSession::on_invoked_promise_id`].
    pub fn on_invoked_promise_id(
        &self,
        handler: impl Fn(Handle, Handle, Bytes) + Send + Sync + 'static,
    ) {
        let current = self.current.clone();
        self.inner.on_invoked_promise_id(move |conn, promise_id, body| {
            if current.load(Ordering::SeqCst) == conn {
                handler(conn, promise_id, body);
            }
        });
    }

    /// Install the immediate invoked handler `(body) -> body`.
    pub fn on_invoked_immediate(
        &self,
        handler: impl Fn(Bytes) -> Vec<u8> + Send + Sync + 'static,
    ) {
        let current = self.current.clone();
        self.inner.on_invoked_immediate(move |conn, body| {
            if current.load(Ordering::SeqCst) == conn {
                handler(body)
            } else {
                Vec::new()
            }
        });
    }

    /// Install the callback invoked handler `(body, result_fn)`.
    pub fn on_invoked_callback(
        &self,
        handler: impl Fn(Bytes, ResultFn) + Send + Sync + 'static,
    ) {
        let current = self.current.clone();
        self.inner.on_invoked_callback(move |conn, body, result_fn| {
            if current.load(Ordering::SeqCst) == conn {
                handler(body, result_fn);
            }
        });
    }

    /// Install the global handler for unmatched responses.
    pub fn on_result(&self, handler: impl Fn(Handle, Bytes) + Send + Sync + 'static) {
        let current = self.current.clone();
        self.inner.on_result(move |conn, promise_id, body| {
            if current.load(Ordering::SeqCst) == conn {
                handler(promise_id, body);
            }
        });
    }

    pub fn on_connect(&self, handler: impl Fn() + Send + Sync + 'static) {
        let tracker = self.current.clone();
        self.inner.on_connect(move |conn| {
            tracker.store(conn, Ordering::SeqCst);
            handler();
        });
    }

    /// Install the disconnect handler. Fires for every peer that goes
    /// away, including ones evicted by a newer accept.
    pub fn on_disconnect(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.on_disconnect(move |_conn| handler());
    }

    pub fn on_error(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.on_error(move |_conn| handler());
    }

    /// Install the log sink. See [`ServerSession::on_log`].
    pub fn on_log(
        &self,
        handler: impl Fn(LogLevel, String, String) + Send + Sync + 'static,
        level: LogLevel,
    ) {
        self.inner.on_log(
            move |_conn, level, message, category| handler(level, message, category),
            level,
        );
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.inner.set_log_level(level);
    }
}
