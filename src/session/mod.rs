//! Session façades and the public vocabulary they share.
//!
//! Three façades compose the transport, frame codec, write queue,
//! delivery queue and pending-invoke registry into the session
//! contract:
//!
//! - [`ClientSession`] - one remote peer, reconnecting
//! - [`ServerSession`] - any number of peers addressed by connection handle
//! - [`SingleServerSession`] - latest-connection-only adapter with the
//!   client-shaped surface
//!
//! All user callbacks run on the session's delivery thread, in order.

mod callbacks;
mod client;
mod server;
mod shield;
mod single;

pub use client::ClientSession;
pub use server::ServerSession;
pub use single::SingleServerSession;

pub(crate) use shield::Shield;

use std::sync::Arc;

use bytes::Bytes;

/// Log record category used by the session façades.
pub(crate) const CONNECTION_CATEGORY: &str = "connection";
/// Log record category used by the event-loop transports.
pub(crate) const TRANSPORT_CATEGORY: &str = "transport";

/// Minimum-severity filter for the session log sink.
///
/// `None` disables the sink entirely and orders above every real
/// level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    None,
}

impl LogLevel {
    /// Parse a case-insensitive level name; unknown names mean `None`.
    pub fn from_name(value: &str) -> LogLevel {
        if value.eq_ignore_ascii_case("debug") {
            LogLevel::Debug
        } else if value.eq_ignore_ascii_case("info") {
            LogLevel::Info
        } else if value.eq_ignore_ascii_case("warning") {
            LogLevel::Warning
        } else if value.eq_ignore_ascii_case("error") {
            LogLevel::Error
        } else {
            LogLevel::None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::None => "NONE",
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(value: u8) -> LogLevel {
        match value {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warning,
            3 => LogLevel::Error,
            _ => LogLevel::None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an invocation completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeResult {
    /// The response arrived.
    Good,
    /// The peer vanished before responding.
    RemoteDisconnect,
    /// This session was disconnected or destroyed.
    LocalDisconnect,
}

/// Outcome of a client `connect` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    /// The connect is in progress (retrying with backoff as needed).
    Connecting,
    /// The session is already connected.
    Connected,
    /// The session is shutting down; the connect was cancelled.
    ShuttingDown,
    /// Fatal input error (empty endpoint, malformed address).
    Failed,
}

/// Session construction options.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Widen local-endpoint permissions so other users can connect.
    /// Only meaningful for local-transport servers.
    pub allow_multiuser_access: bool,
    /// Evict all existing peers whenever a new one is accepted.
    /// Server only; [`SingleServerSession`] forces this on.
    pub latest_connection_only: bool,
    /// Initial minimum level for the log sink.
    pub log_level: LogLevel,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            allow_multiuser_access: false,
            latest_connection_only: false,
            log_level: LogLevel::None,
        }
    }
}

/// Completion callback paired with an invocation at `invoke` time.
pub type PromiseCallback = Box<dyn FnOnce(InvokeResult, Bytes) + Send + 'static>;

/// Result function handed to the callback-shaped invoked handler.
///
/// May be called later, from any thread. Once the session that issued
/// it has been destroyed, calling it is a safe no-op.
pub type ResultFn = Arc<dyn Fn(Vec<u8>) + Send + Sync>;
