//! # framewire
//!
//! Bidirectional, message-oriented IPC over named pipes (Windows),
//! Unix domain sockets, and loopback TCP.
//!
//! Each endpoint is a *server* that listens on an endpoint or a
//! *client* that connects to one. Over an established session, peers
//! exchange three kinds of interaction:
//!
//! - one-way **messages** (`send` / `on_received`)
//! - request/reply **invocations** (`invoke` / `on_invoked_*` /
//!   completion callbacks)
//! - out-of-band **log** events (`on_log`)
//!
//! Payloads are opaque bytes; the library imposes no schema,
//! serialization, or encryption.
//!
//! ## Architecture
//!
//! ```text
//! caller threads ──► write queue ──► loop thread (tokio) ──► socket
//!                                         │
//! user callbacks ◄── delivery thread ◄────┘ (framed reads)
//! ```
//!
//! Per session there are exactly two internal threads: the transport
//! loop that owns the socket, and the delivery worker that runs every
//! user callback in order. Public calls other than `connect`,
//! `listen`, and destruction never block.
//!
//! ## Example
//!
//! ```ignore
//! use framewire::{ClientSession, SingleServerSession, InvokeResult};
//!
//! let server = SingleServerSession::local("echo-service");
//! server.on_invoked_immediate(|body| body.to_vec());
//! server.listen()?;
//!
//! let client = ClientSession::local("echo-service");
//! client.connect();
//! client.invoke_with(b"hello".to_vec(), |code, body| {
//!     assert_eq!(code, InvokeResult::Good);
//!     assert_eq!(&body[..], b"hello");
//! });
//! ```

pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;

mod delivery;
mod pending;
mod write_queue;

pub use bytes::Bytes;

pub use error::{FramewireError, Result};
pub use session::{
    ClientSession, ConnectStatus, InvokeResult, LogLevel, PromiseCallback, ResultFn,
    ServerSession, SessionConfig, SingleServerSession,
};
pub use transport::Endpoint;

/// Per-transport 32-bit id for an accepted or established peer, and
/// per-session 31-bit id pairing an invocation with its response.
/// Zero is the sentinel for "no/any connection" and "one-way message"
/// respectively.
pub type Handle = u32;
