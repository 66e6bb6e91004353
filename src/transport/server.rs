//! Server event-loop transport.
//!
//! Owns one loop thread that binds, listens, and accepts on a
//! `LocalSet` so per-peer read tasks never leave the thread. The
//! accept policy is fixed at `listen()` time:
//!
//! - *latest-only*: every accept forcibly disconnects all pre-existing
//!   peers (firing their disconnect callbacks) before admitting the
//!   new one;
//! - *multi*: peers are admitted in parallel, addressed by connection
//!   handle.
//!
//! The peer set is mirrored into a mutex-guarded handle list so
//! `active_connections()` and `broadcast()` can snapshot it from any
//! thread without touching loop-local state.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Notify};

use super::stream::{PeerListener, PeerStream};
use super::{is_peer_gone, next_connection_handle, Endpoint, TransportEvents, READ_BUFFER_SIZE};
use crate::error::{FramewireError, Result};
use crate::protocol::FrameBuffer;
use crate::session::LogLevel;
use crate::write_queue::WriteQueue;
use crate::Handle;

/// Server transport states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Disconnected,
    Listening,
    ListenFailed,
    Disconnecting,
}

/// A peer as the loop thread sees it.
struct LocalPeer {
    writer: Rc<RefCell<WriteHalf<PeerStream>>>,
    reader: tokio::task::JoinHandle<()>,
}

type PeerMap = Rc<RefCell<HashMap<Handle, LocalPeer>>>;

/// Handle to a running server transport. Dropping it stops the
/// listener and joins the loop thread.
pub(crate) struct ServerTransport {
    shared: Arc<ServerShared>,
    thread: Option<thread::JoinHandle<()>>,
}

struct ServerShared {
    state: Mutex<ServerState>,
    wake: Notify,
    queue: WriteQueue,
    /// Handles of currently admitted peers; broadcast snapshots this.
    handles: Mutex<Vec<Handle>>,
    next_conn: AtomicU32,
    events: TransportEvents,
    log_level: AtomicU8,
}

impl ServerShared {
    fn state(&self) -> ServerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, value: ServerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = value;
    }

    fn log(&self, conn: Handle, level: LogLevel, message: impl FnOnce() -> String) {
        let min = LogLevel::from_u8(self.log_level.load(Ordering::Relaxed));
        if level >= min {
            (self.events.on_log)(conn, level, message());
        }
    }

    fn forget_handle(&self, conn: Handle) {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|h| *h != conn);
    }
}

impl ServerTransport {
    /// Start the loop thread and bind + listen on it. Blocks until the
    /// loop reports whether the endpoint came up.
    pub fn listen(
        endpoint: Endpoint,
        latest_only: bool,
        multiuser: bool,
        events: TransportEvents,
        log_level: LogLevel,
    ) -> (Self, Result<()>) {
        let shared = Arc::new(ServerShared {
            state: Mutex::new(ServerState::Listening),
            wake: Notify::new(),
            queue: WriteQueue::new(),
            handles: Mutex::new(Vec::new()),
            next_conn: AtomicU32::new(0),
            events,
            log_level: AtomicU8::new(log_level.as_u8()),
        });

        if let Err(message) = endpoint.validate() {
            shared.log(0, LogLevel::Error, || message.clone());
            shared.set_state(ServerState::ListenFailed);
            return (
                Self {
                    shared,
                    thread: None,
                },
                Err(FramewireError::InvalidEndpoint(message)),
            );
        }

        shared.log(0, LogLevel::Info, || {
            format!("Listening on endpoint {}", endpoint)
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let loop_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("framewire-server-io".into())
            .spawn(move || run_loop(loop_shared, endpoint, latest_only, multiuser, ready_tx));

        match thread {
            Ok(handle) => {
                let outcome = ready_rx
                    .blocking_recv()
                    .unwrap_or(Err(FramewireError::ConnectionClosed));
                (
                    Self {
                        shared,
                        thread: Some(handle),
                    },
                    outcome,
                )
            }
            Err(error) => {
                tracing::error!("Failed to spawn server I/O thread: {}", error);
                shared.set_state(ServerState::ListenFailed);
                (
                    Self {
                        shared,
                        thread: None,
                    },
                    Err(FramewireError::Io(error)),
                )
            }
        }
    }

    /// Enqueue a frame for `conn` and wake the loop. Callable from any
    /// thread.
    pub fn send(&self, conn: Handle, handle: u32, body: Vec<u8>) {
        self.shared.queue.push(conn, handle, body);
        self.shared.wake.notify_one();
    }

    /// Send `body` as a one-way message to every currently admitted
    /// peer. The peer set is snapshotted under its lock first, so a
    /// client admitted mid-broadcast is not targeted.
    pub fn broadcast(&self, body: Vec<u8>) {
        let targets: Vec<Handle> = self
            .shared
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let last = targets.len().saturating_sub(1);
        for (i, conn) in targets.into_iter().enumerate() {
            if i < last {
                self.shared.queue.push(conn, 0, body.clone());
            } else {
                self.shared.queue.push(conn, 0, body);
                break;
            }
        }
        self.shared.wake.notify_one();
    }

    pub fn active_connections(&self) -> usize {
        self.shared
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.shared.log_level.store(level.as_u8(), Ordering::Relaxed);
    }
}

impl Drop for ServerTransport {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == ServerState::Listening {
                *state = ServerState::Disconnecting;
            }
        }
        self.shared.wake.notify_one();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

fn run_loop(
    shared: Arc<ServerShared>,
    endpoint: Endpoint,
    latest_only: bool,
    multiuser: bool,
    ready: oneshot::Sender<Result<()>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("Failed to build server runtime: {}", error);
            shared.set_state(ServerState::ListenFailed);
            let _ = ready.send(Err(error.into()));
            return;
        }
    };

    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async move {
        let mut listener = match PeerListener::bind(&endpoint, multiuser).await {
            Ok(listener) => {
                shared.log(0, LogLevel::Info, || "Started successfully".to_string());
                let _ = ready.send(Ok(()));
                listener
            }
            Err(error) => {
                shared.log(0, LogLevel::Error, || format!("Bind failed: {}", error));
                shared.set_state(ServerState::ListenFailed);
                let _ = ready.send(Err(error.into()));
                return;
            }
        };

        let peers: PeerMap = Rc::new(RefCell::new(HashMap::new()));

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(stream) => admit(&shared, &peers, stream, latest_only).await,
                    Err(error) => {
                        shared.log(0, LogLevel::Warning, || {
                            format!("Accept failed: {}", error)
                        });
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                _ = shared.wake.notified() => {
                    if shared.state() != ServerState::Listening {
                        break;
                    }
                    drain_writes(&shared, &peers).await;
                }
            }
        }

        shared.log(0, LogLevel::Info, || "Shutting down".to_string());
        drop(listener);

        // Teardown closes peers without firing disconnect callbacks;
        // the session handles pending invocations on its own path.
        let drained: Vec<LocalPeer> = peers
            .borrow_mut()
            .drain()
            .map(|(_, peer)| peer)
            .collect();
        shared
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        for peer in drained {
            peer.reader.abort();
            let _ = peer.writer.borrow_mut().shutdown().await;
        }

        shared.set_state(ServerState::Disconnected);
    });
}

async fn admit(shared: &Arc<ServerShared>, peers: &PeerMap, stream: PeerStream, latest_only: bool) {
    if latest_only {
        let evicted: Vec<(Handle, LocalPeer)> = peers.borrow_mut().drain().collect();
        for (conn, peer) in evicted {
            shared.forget_handle(conn);
            peer.reader.abort();
            let _ = peer.writer.borrow_mut().shutdown().await;
            (shared.events.on_disconnect)(conn);
        }
    }

    let conn = next_connection_handle(&shared.next_conn);
    let (read_half, write_half) = tokio::io::split(stream);

    let reader = tokio::task::spawn_local(read_peer(
        shared.clone(),
        peers.clone(),
        conn,
        read_half,
    ));
    peers.borrow_mut().insert(
        conn,
        LocalPeer {
            writer: Rc::new(RefCell::new(write_half)),
            reader,
        },
    );
    shared
        .handles
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(conn);

    shared.log(conn, LogLevel::Debug, || "Client connected".to_string());
    (shared.events.on_connect)(conn);
}

async fn read_peer(
    shared: Arc<ServerShared>,
    peers: PeerMap,
    conn: Handle,
    mut reader: ReadHalf<PeerStream>,
) {
    let mut frames = FrameBuffer::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => match frames.push(&buf[..n]) {
                Ok(complete) => {
                    for frame in complete {
                        (shared.events.on_data)(conn, frame.header.handle, frame.body);
                    }
                }
                Err(error) => {
                    shared.log(conn, LogLevel::Warning, || format!("{}", error));
                    tracing::warn!("Server connection {} torn down: {}", conn, error);
                    break;
                }
            },
            Err(error) => {
                if !is_peer_gone(&error) {
                    shared.log(conn, LogLevel::Warning, || {
                        format!("Stream closed with error: {}", error)
                    });
                }
                break;
            }
        }
    }

    // Whoever removes the map entry owns the disconnect callback; an
    // evicted or torn-down peer was already handled elsewhere.
    if peers.borrow_mut().remove(&conn).is_some() {
        shared.forget_handle(conn);
        (shared.events.on_disconnect)(conn);
    }
}

async fn drain_writes(shared: &Arc<ServerShared>, peers: &PeerMap) {
    for entry in shared.queue.take_batch() {
        let writer = peers
            .borrow()
            .get(&entry.conn)
            .map(|peer| peer.writer.clone());

        let Some(writer) = writer else {
            let header = entry.header();
            if header.is_request() {
                shared.log(entry.conn, LogLevel::Debug, || {
                    "Rejecting invoke for missing client".to_string()
                });
                (shared.events.on_orphaned_invoke)(entry.conn, header.handle);
            }
            continue;
        };

        let result = writer.borrow_mut().write_all(&entry.bytes).await;
        if let Err(error) = result {
            if !is_peer_gone(&error) {
                shared.log(entry.conn, LogLevel::Error, || {
                    format!("Write failed: {}", error)
                });
                tracing::error!("Server write to {} failed: {}", entry.conn, error);
            }
            if let Some(peer) = peers.borrow_mut().remove(&entry.conn) {
                peer.reader.abort();
                shared.forget_handle(entry.conn);
                (shared.events.on_disconnect)(entry.conn);
            }
        }
    }
}
