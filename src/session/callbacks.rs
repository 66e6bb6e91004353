//! Handler tables for the session façades.
//!
//! Handlers are stored behind `Arc` so a dispatch can clone one out,
//! release the table lock, and invoke it without holding any session
//! lock; a handler is therefore free to call back into the session.
//!
//! The three invoked-handler shapes are one tagged choice, not three
//! independent slots: installing any shape clears the other two.

use std::sync::Arc;

use bytes::Bytes;

use super::{LogLevel, ResultFn};
use crate::Handle;

/// The installed invoked-handler shape for a client session.
#[derive(Clone)]
pub(crate) enum ClientInvokeHandler {
    /// `(conn, promise id, body)`; the user answers later through
    /// `send_result`.
    PromiseId(Arc<dyn Fn(Handle, Handle, Bytes) + Send + Sync>),
    /// `(body) -> body`; the return value is sent as the response.
    Immediate(Arc<dyn Fn(Bytes) -> Vec<u8> + Send + Sync>),
    /// `(body, result_fn)`; the result function may fire later, from
    /// any thread.
    WithCallback(Arc<dyn Fn(Bytes, ResultFn) + Send + Sync>),
}

#[derive(Default, Clone)]
pub(crate) struct ClientCallbacks {
    pub received: Option<Arc<dyn Fn(Bytes) + Send + Sync>>,
    pub invoked: Option<ClientInvokeHandler>,
    pub result: Option<Arc<dyn Fn(Handle, Bytes) + Send + Sync>>,
    pub connect: Option<Arc<dyn Fn() + Send + Sync>>,
    pub disconnect: Option<Arc<dyn Fn() + Send + Sync>>,
    pub error: Option<Arc<dyn Fn() + Send + Sync>>,
    pub log: Option<Arc<dyn Fn(LogLevel, String, String) + Send + Sync>>,
}

/// The installed invoked-handler shape for a server session.
#[derive(Clone)]
pub(crate) enum ServerInvokeHandler {
    PromiseId(Arc<dyn Fn(Handle, Handle, Bytes) + Send + Sync>),
    Immediate(Arc<dyn Fn(Handle, Bytes) -> Vec<u8> + Send + Sync>),
    WithCallback(Arc<dyn Fn(Handle, Bytes, ResultFn) + Send + Sync>),
}

#[derive(Default, Clone)]
pub(crate) struct ServerCallbacks {
    pub received: Option<Arc<dyn Fn(Handle, Bytes) + Send + Sync>>,
    pub invoked: Option<ServerInvokeHandler>,
    pub result: Option<Arc<dyn Fn(Handle, Handle, Bytes) + Send + Sync>>,
    pub connect: Option<Arc<dyn Fn(Handle) + Send + Sync>>,
    pub disconnect: Option<Arc<dyn Fn(Handle) + Send + Sync>>,
    pub error: Option<Arc<dyn Fn(Handle) + Send + Sync>>,
    pub log: Option<Arc<dyn Fn(Handle, LogLevel, String, String) + Send + Sync>>,
}
