//! Multi-connection server session façade.
//!
//! Any number of peers, addressed by connection handle. The surface
//! mirrors [`ClientSession`](super::ClientSession) with a connection
//! handle on every operation, plus `broadcast` and
//! `active_connections`.
//!
//! # Example
//!
//! ```ignore
//! use framewire::ServerSession;
//!
//! let session = ServerSession::local("my-service");
//! session.on_invoked_immediate(|_conn, body| body.to_vec());
//! session.listen()?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use super::callbacks::{ServerCallbacks, ServerInvokeHandler};
use super::{
    InvokeResult, LogLevel, ResultFn, SessionConfig, Shield, CONNECTION_CATEGORY,
    TRANSPORT_CATEGORY,
};
use crate::delivery::DeliveryQueue;
use crate::error::{FramewireError, Result};
use crate::pending::{PendingInvokes, PromiseIds};
use crate::protocol::RESPONSE_FLAG;
use crate::transport::{Endpoint, ServerTransport, TransportEvents};
use crate::Handle;

/// A listening endpoint of one IPC session, serving many peers.
///
/// Dropping the session blocks new work, completes every pending
/// invocation with [`InvokeResult::LocalDisconnect`], stops the
/// transport loop and the delivery worker, and waits out any user
/// closure still holding the session's lifetime token.
pub struct ServerSession {
    shared: Arc<ServerShared>,
}

struct ServerShared {
    endpoint: Endpoint,
    config: SessionConfig,
    transport: Mutex<Option<ServerTransport>>,
    shutting_down: AtomicBool,
    pending: PendingInvokes,
    promise_ids: PromiseIds,
    delivery: DeliveryQueue,
    callbacks: Mutex<ServerCallbacks>,
    log_level: Mutex<LogLevel>,
    shield: Shield,
}

impl ServerSession {
    /// Server for the platform-local transport (named pipe / Unix
    /// domain socket) under `name`.
    pub fn local(name: &str) -> Self {
        Self::new(Endpoint::local(name), SessionConfig::default())
    }

    /// Server for TCP, `host:port` with an optional host (empty host
    /// binds `0.0.0.0`).
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self::new(Endpoint::tcp(addr), SessionConfig::default())
    }

    pub fn new(endpoint: Endpoint, config: SessionConfig) -> Self {
        let log_level = config.log_level;
        Self {
            shared: Arc::new(ServerShared {
                endpoint,
                config,
                transport: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
                pending: PendingInvokes::new(),
                promise_ids: PromiseIds::new(),
                delivery: DeliveryQueue::new(),
                callbacks: Mutex::new(ServerCallbacks::default()),
                log_level: Mutex::new(log_level),
                shield: Shield::new(),
            }),
        }
    }

    /// Bind and start listening. Blocks until the transport loop
    /// reports whether the endpoint came up.
    ///
    /// Calling this on an already-listening session is a no-op.
    pub fn listen(&self) -> Result<()> {
        let shared = &self.shared;
        log_event(shared, 0, LogLevel::Info, || "`listen`".to_string());

        if let Err(message) = shared.endpoint.validate() {
            log_event(shared, 0, LogLevel::Error, || message.clone());
            return Err(FramewireError::InvalidEndpoint(message));
        }

        let mut transport = shared.transport.lock().unwrap_or_else(|e| e.into_inner());
        if shared.shutting_down.load(Ordering::SeqCst) {
            log_event(shared, 0, LogLevel::Debug, || {
                "`listen` called but already shutting down".to_string()
            });
            return Err(FramewireError::ConnectionClosed);
        }
        if transport.is_some() {
            log_event(shared, 0, LogLevel::Debug, || {
                "`listen` called but already listening".to_string()
            });
            return Ok(());
        }

        let level = *shared.log_level.lock().unwrap_or_else(|e| e.into_inner());
        let (new_transport, outcome) = ServerTransport::listen(
            shared.endpoint.clone(),
            shared.config.latest_connection_only,
            shared.config.allow_multiuser_access,
            transport_events(shared),
            level,
        );
        match outcome {
            Ok(()) => {
                *transport = Some(new_transport);
                Ok(())
            }
            Err(error) => {
                log_event(shared, 0, LogLevel::Error, || {
                    "Failed to start server".to_string()
                });
                drop(new_transport);
                handle_error(shared, 0);
                Err(error)
            }
        }
    }

    /// Stop listening and disconnect every peer. Pending invocations
    /// complete with [`InvokeResult::LocalDisconnect`].
    pub fn disconnect(&self) {
        let shared = &self.shared;
        log_event(shared, 0, LogLevel::Info, || "`disconnect`".to_string());
        if shared.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let expired;
        {
            let mut transport = shared.transport.lock().unwrap_or_else(|e| e.into_inner());
            let taken = transport.take();
            // Drained before the transport goes away so the loop's
            // disconnect events find nothing to expire as remote.
            expired = shared.pending.drain_all();
            drop(taken);
        }
        for callback in expired {
            callback(InvokeResult::LocalDisconnect, Bytes::new());
        }
    }

    /// Number of peers currently admitted.
    pub fn active_connections(&self) -> usize {
        let shared = &self.shared;
        let transport = shared.transport.lock().unwrap_or_else(|e| e.into_inner());
        match transport.as_ref() {
            Some(transport) if !shared.shutting_down.load(Ordering::SeqCst) => {
                transport.active_connections()
            }
            _ => 0,
        }
    }

    /// Send a one-way message to every currently admitted peer.
    pub fn broadcast(&self, body: impl Into<Vec<u8>>) {
        let shared = &self.shared;
        let transport = shared.transport.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(transport) = transport.as_ref() {
            if !shared.shutting_down.load(Ordering::SeqCst) {
                transport.broadcast(body.into());
            }
        }
    }

    /// Send a one-way message to `conn`. Discarded (with a debug log)
    /// when the connection no longer exists.
    pub fn send(&self, conn: Handle, body: impl Into<Vec<u8>>) {
        let shared = &self.shared;
        let body = body.into();
        log_event(shared, conn, LogLevel::Debug, || {
            format!("Sending message of length {}", body.len())
        });
        let transport = shared.transport.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(transport) = transport.as_ref() {
            if !shared.shutting_down.load(Ordering::SeqCst) {
                transport.send(conn, 0, body);
            }
        }
    }

    /// Send an invocation to `conn` without registering a completion;
    /// the response reaches the global [`on_result`](Self::on_result)
    /// handler. Returns the promise id.
    pub fn invoke(&self, conn: Handle, body: impl Into<Vec<u8>>) -> Handle {
        let shared = &self.shared;
        let body = body.into();
        log_event(shared, conn, LogLevel::Debug, || {
            format!("Sending invoke of length {}", body.len())
        });
        let promise_id = shared.promise_ids.next();
        let transport = shared.transport.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(transport) = transport.as_ref() {
            if !shared.shutting_down.load(Ordering::SeqCst) {
                transport.send(conn, promise_id, body);
            }
        }
        promise_id
    }

    /// Send an invocation to `conn` and register its completion
    /// callback. The callback fires exactly once: `Good`,
    /// `RemoteDisconnect`, or `LocalDisconnect`.
    pub fn invoke_with(
        &self,
        conn: Handle,
        body: impl Into<Vec<u8>>,
        on_result: impl FnOnce(InvokeResult, Bytes) + Send + 'static,
    ) {
        let shared = &self.shared;
        let body = body.into();
        log_event(shared, conn, LogLevel::Debug, || {
            format!("Sending invoke of length {}", body.len())
        });

        let promise_id = shared.promise_ids.next();
        let guard = shared.transport.lock().unwrap_or_else(|e| e.into_inner());
        let shutting_down = shared.shutting_down.load(Ordering::SeqCst);

        if guard.is_some() && !shutting_down {
            if let Some(stale) = shared.pending.register(conn, promise_id, Box::new(on_result)) {
                log_event(shared, conn, LogLevel::Debug, || {
                    format!("Promise id {} rolled over onto a pending invoke", promise_id)
                });
                shared
                    .delivery
                    .enqueue(move || stale(InvokeResult::LocalDisconnect, Bytes::new()));
            }
            if let Some(transport) = guard.as_ref() {
                transport.send(conn, promise_id, body);
            }
        } else {
            drop(guard);
            if !shutting_down {
                on_result(InvokeResult::LocalDisconnect, Bytes::new());
            }
        }
    }

    /// Answer an invocation received through the promise-id handler.
    /// Stale ids (the peer already disconnected) are discarded.
    pub fn send_result(&self, conn: Handle, promise_id: Handle, body: impl Into<Vec<u8>>) {
        let shared = &self.shared;
        let body = body.into();
        log_event(shared, conn, LogLevel::Debug, || {
            format!("Sending invoke result of length {}", body.len())
        });
        send_response(shared, conn, promise_id, body);
    }

    /// Install the one-way message handler: `(conn, body)`.
    pub fn on_received(&self, handler: impl Fn(Handle, Bytes) + Send + Sync + 'static) {
        self.callbacks().received = Some(Arc::new(handler));
    }

    /// Install the promise-id invoked handler; the user answers later
    /// through [`send_result`](Self::send_result). Clears the other
    /// invoked-handler shapes.
    pub fn on_invoked_promise_id(
        &self,
        handler: impl Fn(Handle, Handle, Bytes) + Send + Sync + 'static,
    ) {
        self.callbacks().invoked = Some(ServerInvokeHandler::PromiseId(Arc::new(handler)));
    }

    /// Install the immediate invoked handler `(conn, body) -> body`.
    /// Clears the other invoked-handler shapes.
    pub fn on_invoked_immediate(
        &self,
        handler: impl Fn(Handle, Bytes) -> Vec<u8> + Send + Sync + 'static,
    ) {
        self.callbacks().invoked = Some(ServerInvokeHandler::Immediate(Arc::new(handler)));
    }

    /// Install the callback invoked handler `(conn, body, result_fn)`.
    /// Clears the other invoked-handler shapes.
    pub fn on_invoked_callback(
        &self,
        handler: impl Fn(Handle, Bytes, ResultFn) + Send + Sync + 'static,
    ) {
        self.callbacks().invoked = Some(ServerInvokeHandler::WithCallback(Arc::new(handler)));
    }

    /// Install the global handler for responses whose promise id has
    /// no registered completion: `(conn, promise id, body)`.
    pub fn on_result(&self, handler: impl Fn(Handle, Handle, Bytes) + Send + Sync + 'static) {
        self.callbacks().result = Some(Arc::new(handler));
    }

    pub fn on_connect(&self, handler: impl Fn(Handle) + Send + Sync + 'static) {
        self.callbacks().connect = Some(Arc::new(handler));
    }

    pub fn on_disconnect(&self, handler: impl Fn(Handle) + Send + Sync + 'static) {
        self.callbacks().disconnect = Some(Arc::new(handler));
    }

    pub fn on_error(&self, handler: impl Fn(Handle) + Send + Sync + 'static) {
        self.callbacks().error = Some(Arc::new(handler));
    }

    /// Install the log sink with a minimum level.
    ///
    /// Passing [`LogLevel::None`] while no level was previously set
    /// promotes the level to `Warning`: installing a sink that can
    /// never fire is never what the caller meant.
    pub fn on_log(
        &self,
        handler: impl Fn(Handle, LogLevel, String, String) + Send + Sync + 'static,
        level: LogLevel,
    ) {
        {
            let mut min = self
                .shared
                .log_level
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if level != LogLevel::None {
                *min = level;
            } else if *min == LogLevel::None {
                *min = LogLevel::Warning;
            }
        }
        self.propagate_log_level();
        self.callbacks().log = Some(Arc::new(handler));
    }

    pub fn set_log_level(&self, level: LogLevel) {
        *self
            .shared
            .log_level
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = level;
        self.propagate_log_level();
    }

    fn propagate_log_level(&self) {
        let level = *self
            .shared
            .log_level
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let transport = self
            .shared
            .transport
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(transport) = transport.as_ref() {
            transport.set_log_level(level);
        }
    }

    fn callbacks(&self) -> std::sync::MutexGuard<'_, ServerCallbacks> {
        self.shared
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        let shared = &self.shared;
        shared.shutting_down.store(true, Ordering::SeqCst);
        shared.shield.clear();

        let taken = shared
            .transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let expired = shared.pending.drain_all();
        drop(taken);

        for callback in expired {
            callback(InvokeResult::LocalDisconnect, Bytes::new());
        }
        shared.delivery.stop();
    }
}

/// Wire the transport's loop-thread events to the session. The
/// closures hold weak references; a session mid-teardown simply stops
/// receiving events.
fn transport_events(shared: &Arc<ServerShared>) -> TransportEvents {
    let weak = Arc::downgrade(shared);
    TransportEvents {
        on_connect: Box::new({
            let weak = weak.clone();
            move |conn| {
                if let Some(shared) = weak.upgrade() {
                    handle_remote_connected(&shared, conn);
                }
            }
        }),
        on_disconnect: Box::new({
            let weak = weak.clone();
            move |conn| {
                if let Some(shared) = weak.upgrade() {
                    handle_remote_disconnected(&shared, conn);
                }
            }
        }),
        on_data: Box::new({
            let weak = weak.clone();
            move |conn, handle, body| {
                if let Some(shared) = weak.upgrade() {
                    handle_data(&shared, conn, handle, body);
                }
            }
        }),
        on_orphaned_invoke: Box::new({
            let weak = weak.clone();
            move |conn, promise_id| {
                if let Some(shared) = weak.upgrade() {
                    handle_orphaned_invoke(&shared, conn, promise_id);
                }
            }
        }),
        on_error: Box::new({
            let weak = weak.clone();
            move |conn| {
                if let Some(shared) = weak.upgrade() {
                    handle_error(&shared, conn);
                }
            }
        }),
        on_log: Box::new(move |conn, level, message| {
            if let Some(shared) = weak.upgrade() {
                log_record(&shared, conn, level, TRANSPORT_CATEGORY, message);
            }
        }),
    }
}

fn handle_remote_connected(shared: &Arc<ServerShared>, conn: Handle) {
    log_event(shared, conn, LogLevel::Info, || {
        "`onConnect` called".to_string()
    });
    let inner = shared.clone();
    shared.delivery.enqueue(move || {
        let handler = inner
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .connect
            .clone();
        if let Some(handler) = handler {
            handler(conn);
        }
    });
}

fn handle_remote_disconnected(shared: &Arc<ServerShared>, conn: Handle) {
    log_event(shared, conn, LogLevel::Info, || {
        "`onDisconnect` called".to_string()
    });
    // Expired on the loop thread, delivered in order: completions
    // first, then the user's disconnect handler.
    let expired = shared.pending.drain(conn);
    let inner = shared.clone();
    shared.delivery.enqueue(move || {
        for callback in expired {
            callback(InvokeResult::RemoteDisconnect, Bytes::new());
        }
        let handler = inner
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .disconnect
            .clone();
        if let Some(handler) = handler {
            handler(conn);
        }
    });
}

fn handle_data(shared: &Arc<ServerShared>, conn: Handle, handle: u32, body: Bytes) {
    let inner = shared.clone();
    shared.delivery.enqueue(move || {
        if handle == 0 {
            let handler = inner
                .callbacks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .received
                .clone();
            if let Some(handler) = handler {
                handler(conn, body);
            }
        } else if handle & RESPONSE_FLAG != 0 {
            let promise_id = handle & !RESPONSE_FLAG;
            if let Some(callback) = inner.pending.take(conn, promise_id) {
                log_event(&inner, conn, LogLevel::Debug, || {
                    format!(
                        "Processing invoke result {} of length {}",
                        promise_id,
                        body.len()
                    )
                });
                callback(InvokeResult::Good, body);
                return;
            }
            let handler = inner
                .callbacks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .result
                .clone();
            if let Some(handler) = handler {
                log_event(&inner, conn, LogLevel::Debug, || {
                    format!(
                        "Processing invoke result {} of length {} with global handler",
                        promise_id,
                        body.len()
                    )
                });
                handler(conn, promise_id, body);
            } else {
                log_event(&inner, conn, LogLevel::Debug, || {
                    format!("Could not process invoke result {}", promise_id)
                });
            }
        } else {
            let promise_id = handle;
            let invoked = inner
                .callbacks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .invoked
                .clone();
            if invoked.is_some() {
                log_event(&inner, conn, LogLevel::Debug, || {
                    format!(
                        "Received invoke request {} of length {}",
                        promise_id,
                        body.len()
                    )
                });
            }
            match invoked {
                Some(ServerInvokeHandler::PromiseId(handler)) => {
                    handler(conn, promise_id, body);
                }
                Some(ServerInvokeHandler::Immediate(handler)) => {
                    let result = handler(conn, body);
                    log_event(&inner, conn, LogLevel::Debug, || {
                        format!(
                            "Sending invoke result {} of length {}",
                            promise_id,
                            result.len()
                        )
                    });
                    send_response(&inner, conn, promise_id, result);
                }
                Some(ServerInvokeHandler::WithCallback(handler)) => {
                    let result_fn = make_result_fn(&inner, conn, promise_id);
                    handler(conn, body, result_fn);
                }
                None => {}
            }
        }
    });
}

fn handle_orphaned_invoke(shared: &Arc<ServerShared>, conn: Handle, promise_id: Handle) {
    if let Some(callback) = shared.pending.take(conn, promise_id) {
        log_event(shared, conn, LogLevel::Debug, || {
            "Rejecting invoke for missing client".to_string()
        });
        shared
            .delivery
            .enqueue(move || callback(InvokeResult::RemoteDisconnect, Bytes::new()));
    }
}

fn handle_error(shared: &Arc<ServerShared>, conn: Handle) {
    let inner = shared.clone();
    shared.delivery.enqueue(move || {
        let handler = inner
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .error
            .clone();
        if let Some(handler) = handler {
            handler(conn);
        }
    });
}

fn send_response(shared: &Arc<ServerShared>, conn: Handle, promise_id: Handle, body: Vec<u8>) {
    let transport = shared.transport.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(transport) = transport.as_ref() {
        if !shared.shutting_down.load(Ordering::SeqCst) {
            transport.send(conn, promise_id | RESPONSE_FLAG, body);
        }
    }
}

/// Build a result function for the callback-shaped invoked handler.
/// Captures the lifetime token weakly; once the session is gone, the
/// function is a no-op.
fn make_result_fn(shared: &Arc<ServerShared>, conn: Handle, promise_id: Handle) -> ResultFn {
    let shield = shared.shield.weak();
    let inner = shared.clone();
    Arc::new(move |body: Vec<u8>| {
        let Some(_guard) = shield.upgrade() else {
            return;
        };
        log_event(&inner, conn, LogLevel::Debug, || {
            format!(
                "Sending invoke result {} of length {}",
                promise_id,
                body.len()
            )
        });
        send_response(&inner, conn, promise_id, body);
    })
}

/// Emit a session-category log record, building the message only when
/// a sink could take it.
fn log_event(
    shared: &Arc<ServerShared>,
    conn: Handle,
    level: LogLevel,
    message: impl FnOnce() -> String,
) {
    let min = *shared.log_level.lock().unwrap_or_else(|e| e.into_inner());
    if level < min {
        return;
    }
    if shared
        .callbacks
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .log
        .is_none()
    {
        return;
    }
    log_record(shared, conn, level, CONNECTION_CATEGORY, message());
}

fn log_record(
    shared: &Arc<ServerShared>,
    conn: Handle,
    level: LogLevel,
    category: &'static str,
    message: String,
) {
    {
        let min = *shared.log_level.lock().unwrap_or_else(|e| e.into_inner());
        if level < min {
            return;
        }
    }
    let inner = shared.clone();
    shared.delivery.enqueue(move || {
        // The filter may have changed since this was enqueued.
        let min = *inner.log_level.lock().unwrap_or_else(|e| e.into_inner());
        let handler = inner
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .log
            .clone();
        if let Some(handler) = handler {
            if level >= min {
                handler(conn, level, message, category.to_string());
            }
        }
    });
}
