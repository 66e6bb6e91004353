//! Client session façade.
//!
//! One remote peer. Composes the client transport, frame codec, write
//! queue, delivery queue and pending-invoke registry into the public
//! contract: `send` for one-way messages, `invoke`/`invoke_with` for
//! request/reply, `send_result` to answer the peer's invocations, and
//! a set of handlers that all run on the delivery thread.
//!
//! # Example
//!
//! ```ignore
//! use framewire::ClientSession;
//!
//! let session = ClientSession::local("my-service");
//! session.on_received(|body| println!("got {} bytes", body.len()));
//! session.connect();
//! session.send(b"hello".to_vec());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use super::callbacks::{ClientCallbacks, ClientInvokeHandler};
use super::{
    ConnectStatus, InvokeResult, LogLevel, ResultFn, SessionConfig, Shield, CONNECTION_CATEGORY,
    TRANSPORT_CATEGORY,
};
use crate::delivery::DeliveryQueue;
use crate::pending::{PendingInvokes, PromiseIds};
use crate::protocol::RESPONSE_FLAG;
use crate::transport::{ClientTransport, Endpoint, TransportEvents};
use crate::Handle;

/// A client endpoint of one IPC session.
///
/// Dropping the session blocks new work, completes every pending
/// invocation with [`InvokeResult::LocalDisconnect`], stops the
/// transport loop and the delivery worker, and waits out any user
/// closure still holding the session's lifetime token.
pub struct ClientSession {
    shared: Arc<ClientShared>,
}

struct ClientShared {
    endpoint: Endpoint,
    transport: Mutex<Option<ClientTransport>>,
    shutting_down: AtomicBool,
    pending: PendingInvokes,
    promise_ids: PromiseIds,
    delivery: DeliveryQueue,
    callbacks: Mutex<ClientCallbacks>,
    log_level: Mutex<LogLevel>,
    shield: Shield,
}

impl ClientSession {
    /// Client for the platform-local transport (named pipe / Unix
    /// domain socket) under `name`.
    pub fn local(name: &str) -> Self {
        Self::new(Endpoint::local(name), SessionConfig::default())
    }

    /// Client for TCP on loopback, `host:port` with an optional host.
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self::new(Endpoint::tcp(addr), SessionConfig::default())
    }

    pub fn new(endpoint: Endpoint, config: SessionConfig) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                endpoint,
                transport: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
                pending: PendingInvokes::new(),
                promise_ids: PromiseIds::new(),
                delivery: DeliveryQueue::new(),
                callbacks: Mutex::new(ClientCallbacks::default()),
                log_level: Mutex::new(config.log_level),
                shield: Shield::new(),
            }),
        }
    }

    /// Start connecting. Blocks only until the transport loop reports
    /// the outcome of the first attempt; failures after that are
    /// absorbed into the reconnect backoff.
    ///
    /// Calling this on an already-connected session is a no-op that
    /// returns the current status.
    pub fn connect(&self) -> ConnectStatus {
        let shared = &self.shared;
        log_event(shared, LogLevel::Info, || "`connect`".to_string());

        if let Err(message) = shared.endpoint.validate() {
            log_event(shared, LogLevel::Error, || message.clone());
            return ConnectStatus::Failed;
        }

        let mut transport = shared.transport.lock().unwrap_or_else(|e| e.into_inner());
        if shared.shutting_down.load(Ordering::SeqCst) {
            log_event(shared, LogLevel::Debug, || {
                "`connect` called but already shutting down".to_string()
            });
            return ConnectStatus::ShuttingDown;
        }
        if let Some(existing) = transport.as_ref() {
            log_event(shared, LogLevel::Debug, || {
                "`connect` called but already connected".to_string()
            });
            return existing.status();
        }

        let level = *shared.log_level.lock().unwrap_or_else(|e| e.into_inner());
        let (new_transport, status) =
            ClientTransport::connect(shared.endpoint.clone(), transport_events(shared), level);
        match status {
            ConnectStatus::Connected => {
                log_event(shared, LogLevel::Info, || "Connected immediately".to_string());
                *transport = Some(new_transport);
            }
            ConnectStatus::Connecting => {
                log_event(shared, LogLevel::Info, || "Waiting to connect".to_string());
                *transport = Some(new_transport);
            }
            ConnectStatus::ShuttingDown => {
                log_event(shared, LogLevel::Info, || "Connect cancelled.".to_string());
            }
            ConnectStatus::Failed => {
                log_event(shared, LogLevel::Warning, || "Connect failed.".to_string());
            }
        }
        status
    }

    /// Disconnect and cancel reconnect attempts. Pending invocations
    /// complete with [`InvokeResult::LocalDisconnect`].
    pub fn disconnect(&self) {
        let shared = &self.shared;
        log_event(shared, LogLevel::Info, || "`disconnect`".to_string());
        if shared.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let expired;
        {
            let mut transport = shared.transport.lock().unwrap_or_else(|e| e.into_inner());
            let taken = transport.take();
            // Drained before the transport goes away so the loop's
            // disconnect event finds nothing to expire as remote.
            expired = shared.pending.drain_all();
            drop(taken);
        }
        for callback in expired {
            callback(InvokeResult::LocalDisconnect, Bytes::new());
        }
    }

    /// Send a one-way message. Discarded (with a debug log) when the
    /// session is not connected.
    pub fn send(&self, body: impl Into<Vec<u8>>) {
        let shared = &self.shared;
        let body = body.into();
        log_event(shared, LogLevel::Debug, || {
            format!("Sending message of length {}", body.len())
        });
        let transport = shared.transport.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(transport) = transport.as_ref() {
            if !shared.shutting_down.load(Ordering::SeqCst) {
                transport.send(0, 0, body);
            }
        }
    }

    /// Send an invocation without registering a completion; the
    /// response reaches the global [`on_result`](Self::on_result)
    /// handler. Returns the promise id.
    pub fn invoke(&self, body: impl Into<Vec<u8>>) -> Handle {
        let shared = &self.shared;
        let body = body.into();
        let promise_id = shared.promise_ids.next();
        log_event(shared, LogLevel::Debug, || {
            format!("Sending invoke of length {}", body.len())
        });
        let transport = shared.transport.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(transport) = transport.as_ref() {
            if !shared.shutting_down.load(Ordering::SeqCst) {
                transport.send(0, promise_id, body);
            }
        }
        promise_id
    }

    /// Send an invocation and register its completion callback.
    ///
    /// The callback fires exactly once, with `Good` when the response
    /// arrives, `RemoteDisconnect` when the peer vanishes first, or
    /// `LocalDisconnect` when this session disconnects first (or was
    /// never connected).
    pub fn invoke_with(
        &self,
        body: impl Into<Vec<u8>>,
        on_result: impl FnOnce(InvokeResult, Bytes) + Send + 'static,
    ) {
        let shared = &self.shared;
        let body = body.into();
        log_event(shared, LogLevel::Debug, || {
            format!("Sending invoke of length {}", body.len())
        });

        let promise_id = shared.promise_ids.next();
        let guard = shared.transport.lock().unwrap_or_else(|e| e.into_inner());
        let shutting_down = shared.shutting_down.load(Ordering::SeqCst);

        if guard.is_some() && !shutting_down {
            if let Some(stale) = shared.pending.register(0, promise_id, Box::new(on_result)) {
                log_event(shared, LogLevel::Debug, || {
                    format!("Promise id {} rolled over onto a pending invoke", promise_id)
                });
                shared
                    .delivery
                    .enqueue(move || stale(InvokeResult::LocalDisconnect, Bytes::new()));
            }
            if let Some(transport) = guard.as_ref() {
                transport.send(0, promise_id, body);
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
        log_event(shared, LogLevel::Debug, || {
            format!(
                "Sending invoke result {} of length {}",
                promise_id,
                body.len()
            )
        });
        send_response(shared, conn, promise_id, body);
    }

    /// Install the one-way message handler.
    pub fn on_received(&self, handler: impl Fn(Bytes) + Send + Sync + 'static) {
        self.callbacks().received = Some(Arc::new(handler));
    }

    /// Install the promise-id invoked handler; the user answers later
    /// through [`send_result`](Self::send_result). Clears the other
    /// invoked-handler shapes.
    pub fn on_invoked_promise_id(
        &self,
        handler: impl Fn(Handle, Handle, Bytes) + Send + Sync + 'static,
    ) {
        self.callbacks().invoked = Some(ClientInvokeHandler::PromiseId(Arc::new(handler)));
    }

    /// Install the immediate invoked handler; the return value is sent
    /// back as the response. Clears the other invoked-handler shapes.
    pub fn on_invoked_immediate(
        &self,
        handler: impl Fn(Bytes) -> Vec<u8> + Send + Sync + 'static,
    ) {
        self.callbacks().invoked = Some(ClientInvokeHandler::Immediate(Arc::new(handler)));
    }

    /// Install the callback invoked handler; the handler receives a
    /// [`ResultFn`] it may fire later from any thread. Clears the
    /// other invoked-handler shapes.
    pub fn on_invoked_callback(
        &self,
        handler: impl Fn(Bytes, ResultFn) + Send + Sync + 'static,
    ) {
        self.callbacks().invoked = Some(ClientInvokeHandler::WithCallback(Arc::new(handler)));
    }

    /// Install the global handler for responses whose promise id has
    /// no registered completion.
    pub fn on_result(&self, handler: impl Fn(Handle, Bytes) + Send + Sync + 'static) {
        self.callbacks().result = Some(Arc::new(handler));
    }

    pub fn on_connect(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.callbacks().connect = Some(Arc::new(handler));
    }

    pub fn on_disconnect(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.callbacks().disconnect = Some(Arc::new(handler));
    }

    pub fn on_error(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.callbacks().error = Some(Arc::new(handler));
    }

    /// Install the log sink with a minimum level.
    ///
    /// Passing [`LogLevel::None`] while no level was previously set
    /// promotes the level to `Warning`: installing a sink that can
    /// never fire is never what the caller meant.
    pub fn on_log(
        &self,
        handler: impl Fn(LogLevel, String, String) + Send + Sync + 'static,
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

    fn callbacks(&self) -> std::sync::MutexGuard<'_, ClientCallbacks> {
        self.shared
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ClientSession {
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
fn transport_events(shared: &Arc<ClientShared>) -> TransportEvents {
    let weak = Arc::downgrade(shared);
    TransportEvents {
        on_connect: Box::new({
            let weak = weak.clone();
            move |_conn| {
                if let Some(shared) = weak.upgrade() {
                    handle_remote_connected(&shared);
                }
            }
        }),
        on_disconnect: Box::new({
            let weak = weak.clone();
            move |_conn| {
                if let Some(shared) = weak.upgrade() {
                    handle_remote_disconnected(&shared);
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
            move |_conn, promise_id| {
                if let Some(shared) = weak.upgrade() {
                    handle_orphaned_invoke(&shared, promise_id);
                }
            }
        }),
        on_error: Box::new({
            let weak = weak.clone();
            move |_conn| {
                if let Some(shared) = weak.upgrade() {
                    handle_error(&shared);
                }
            }
        }),
        on_log: Box::new(move |_conn, level, message| {
            if let Some(shared) = weak.upgrade() {
                log_record(&shared, level, TRANSPORT_CATEGORY, message);
            }
        }),
    }
}

fn handle_remote_connected(shared: &Arc<ClientShared>) {
    log_event(shared, LogLevel::Info, || "`onConnect` called".to_string());
    let inner = shared.clone();
    shared.delivery.enqueue(move || {
        let handler = inner
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .connect
            .clone();
        if let Some(handler) = handler {
            handler();
        }
    });
}

fn handle_remote_disconnected(shared: &Arc<ClientShared>) {
    log_event(shared, LogLevel::Info, || {
        "`onDisconnect` called".to_string()
    });
    // Expired on the loop thread, delivered in order: completions
    // first, then the user's disconnect handler.
    let expired = shared.pending.drain_all();
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
            handler();
        }
    });
}

fn handle_data(shared: &Arc<ClientShared>, conn: Handle, handle: u32, body: Bytes) {
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
                handler(body);
            }
        } else if handle & RESPONSE_FLAG != 0 {
            let promise_id = handle & !RESPONSE_FLAG;
            if let Some(callback) = inner.pending.take(0, promise_id) {
                log_event(&inner, LogLevel::Debug, || {
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
                log_event(&inner, LogLevel::Debug, || {
                    format!(
                        "Processing invoke result {} of length {} with global handler",
                        promise_id,
                        body.len()
                    )
                });
                handler(promise_id, body);
            } else {
                log_event(&inner, LogLevel::Debug, || {
                    format!("Could not process invoke result {}", promise_id)
                });
            }
        } else {
            let promise_id = handle;
            log_event(&inner, LogLevel::Debug, || {
                format!(
                    "Received invoke request {} of length {}",
                    promise_id,
                    body.len()
                )
            });
            let invoked = inner
                .callbacks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .invoked
                .clone();
            match invoked {
                Some(ClientInvokeHandler::PromiseId(handler)) => {
                    handler(conn, promise_id, body);
                }
                Some(ClientInvokeHandler::Immediate(handler)) => {
                    let result = handler(body);
                    log_event(&inner, LogLevel::Debug, || {
                        format!(
                            "Sending invoke result {} of length {}",
                            promise_id,
                            result.len()
                        )
                    });
                    send_response(&inner, conn, promise_id, result);
                }
                Some(ClientInvokeHandler::WithCallback(handler)) => {
                    let result_fn = make_result_fn(&inner, conn, promise_id);
                    handler(body, result_fn);
                }
                None => {}
            }
        }
    });
}

fn handle_orphaned_invoke(shared: &Arc<ClientShared>, promise_id: Handle) {
    if let Some(callback) = shared.pending.take(0, promise_id) {
        log_event(shared, LogLevel::Debug, || {
            "Rejecting invoke for missing peer".to_string()
        });
        shared
            .delivery
            .enqueue(move || callback(InvokeResult::RemoteDisconnect, Bytes::new()));
    }
}

fn handle_error(shared: &Arc<ClientShared>) {
    log_event(shared, LogLevel::Error, || {
        "Got onError callback".to_string()
    });
    let inner = shared.clone();
    shared.delivery.enqueue(move || {
        let handler = inner
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .error
            .clone();
        if let Some(handler) = handler {
            handler();
        }
    });
}

fn send_response(shared: &Arc<ClientShared>, conn: Handle, promise_id: Handle, body: Vec<u8>) {
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
fn make_result_fn(shared: &Arc<ClientShared>, conn: Handle, promise_id: Handle) -> ResultFn {
    let shield = shared.shield.weak();
    let inner = shared.clone();
    Arc::new(move |body: Vec<u8>| {
        let Some(_guard) = shield.upgrade() else {
            return;
        };
        log_event(&inner, LogLevel::Debug, || {
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
fn log_event(shared: &Arc<ClientShared>, level: LogLevel, message: impl FnOnce() -> String) {
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
    log_record(shared, level, CONNECTION_CATEGORY, message());
}

fn log_record(shared: &Arc<ClientShared>, level: LogLevel, category: &'static str, message: String) {
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
                handler(level, message, category.to_string());
            }
        }
    });
}
