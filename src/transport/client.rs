//! Client event-loop transport.
//!
//! Owns one loop thread that issues the non-blocking connect, retries
//! with capped linear backoff while the session wants to be connected,
//! then moves bytes: reads feed the frame buffer, wakeups drain the
//! write queue. `connect()` blocks the caller on a oneshot handshake
//! until the first attempt resolves.
//!
//! State machine:
//!
//! ```text
//! Disconnected ─ connect ─► Connecting ─► Connected ─► Disconnecting ─► Disconnected
//!                               ▲              │
//!                               └── remote EOF ┘        (write error ─► WriteFailed)
//! ```
//!
//! Remote EOF re-enters `Connecting` only while the state is still
//! `Connected`, i.e. the session has not asked to disconnect.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::{oneshot, Notify};

use super::stream::PeerStream;
use super::{is_peer_gone, next_connection_handle, Endpoint, TransportEvents, READ_BUFFER_SIZE};
use crate::protocol::FrameBuffer;
use crate::session::{ConnectStatus, LogLevel};
use crate::write_queue::WriteQueue;
use crate::Handle;

/// Client transport states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    WriteFailed,
}

/// Backoff counter floor and cap; the sleep between attempts is
/// `counter / 10` milliseconds, so at most 100 ms, climbing linearly.
const RETRY_DELAY_FLOOR: u32 = 20;
const RETRY_DELAY_CAP: u32 = 1000;

/// How a connected phase ended.
enum Outcome {
    Remote,
    Local,
    WriteError,
}

enum DrainOutcome {
    Ok,
    PeerGone,
    Fatal,
}

/// Handle to a running client transport. Dropping it requests
/// disconnect and joins the loop thread.
pub(crate) struct ClientTransport {
    shared: Arc<ClientShared>,
    thread: Option<thread::JoinHandle<()>>,
}

struct ClientShared {
    state: Mutex<ClientState>,
    wake: Notify,
    queue: WriteQueue,
    next_conn: AtomicU32,
    events: TransportEvents,
    log_level: AtomicU8,
}

impl ClientShared {
    fn state(&self) -> ClientState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn log(&self, level: LogLevel, message: impl FnOnce() -> String) {
        let min = LogLevel::from_u8(self.log_level.load(Ordering::Relaxed));
        if level >= min {
            (self.events.on_log)(0, level, message());
        }
    }
}

impl ClientTransport {
    /// Start the loop thread and issue the initial connect. Blocks
    /// until the loop reports the outcome of the first attempt.
    pub fn connect(
        endpoint: Endpoint,
        events: TransportEvents,
        log_level: LogLevel,
    ) -> (Self, ConnectStatus) {
        let shared = Arc::new(ClientShared {
            state: Mutex::new(ClientState::Connecting),
            wake: Notify::new(),
            queue: WriteQueue::new(),
            next_conn: AtomicU32::new(0),
            events,
            log_level: AtomicU8::new(log_level.as_u8()),
        });

        if let Err(message) = endpoint.validate() {
            shared.log(LogLevel::Error, || message.clone());
            *shared.state.lock().unwrap_or_else(|e| e.into_inner()) = ClientState::Disconnected;
            return (
                Self {
                    shared,
                    thread: None,
                },
                ConnectStatus::Failed,
            );
        }

        shared.log(LogLevel::Info, || format!("Connecting to {}", endpoint));

        let (ready_tx, ready_rx) = oneshot::channel();
        let loop_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("framewire-client-io".into())
            .spawn(move || run_loop(loop_shared, endpoint, ready_tx));

        match thread {
            Ok(handle) => {
                let status = ready_rx.blocking_recv().unwrap_or(ConnectStatus::Failed);
                (
                    Self {
                        shared,
                        thread: Some(handle),
                    },
                    status,
                )
            }
            Err(error) => {
                tracing::error!("Failed to spawn client I/O thread: {}", error);
                *shared.state.lock().unwrap_or_else(|e| e.into_inner()) =
                    ClientState::Disconnected;
                (
                    Self {
                        shared,
                        thread: None,
                    },
                    ConnectStatus::Failed,
                )
            }
        }
    }

    /// Enqueue a frame and wake the loop. Callable from any thread.
    pub fn send(&self, conn: Handle, handle: u32, body: Vec<u8>) {
        self.shared.queue.push(conn, handle, body);
        self.shared.wake.notify_one();
    }

    pub fn status(&self) -> ConnectStatus {
        match self.shared.state() {
            ClientState::Connected => ConnectStatus::Connected,
            ClientState::Connecting => ConnectStatus::Connecting,
            ClientState::WriteFailed => ConnectStatus::Failed,
            ClientState::Disconnected | ClientState::Disconnecting => ConnectStatus::ShuttingDown,
        }
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.shared.log_level.store(level.as_u8(), Ordering::Relaxed);
    }
}

impl Drop for ClientTransport {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                ClientState::Connected => *state = ClientState::Disconnecting,
                ClientState::Connecting => *state = ClientState::Disconnected,
                _ => {}
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
    shared: Arc<ClientShared>,
    endpoint: Endpoint,
    ready: oneshot::Sender<ConnectStatus>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("Failed to build client runtime: {}", error);
            let _ = ready.send(ConnectStatus::Failed);
            return;
        }
    };

    runtime.block_on(async {
        let mut ready = Some(ready);
        let mut retry_delay = RETRY_DELAY_FLOOR;

        loop {
            if shared.state() != ClientState::Connecting {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(ConnectStatus::ShuttingDown);
                }
                break;
            }

            match PeerStream::connect(&endpoint).await {
                Ok(stream) => {
                    let promoted = {
                        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
                        if *state == ClientState::Connecting {
                            *state = ClientState::Connected;
                            true
                        } else {
                            false
                        }
                    };
                    if !promoted {
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(ConnectStatus::ShuttingDown);
                        }
                        break;
                    }
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(ConnectStatus::Connected);
                    }

                    shared.log(LogLevel::Info, || {
                        format!("Successfully connected to {}", endpoint)
                    });
                    let conn = next_connection_handle(&shared.next_conn);
                    (shared.events.on_connect)(conn);

                    let outcome = run_connected(&shared, stream, conn).await;

                    let reconnect = {
                        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
                        match (&outcome, *state) {
                            (Outcome::Remote, ClientState::Connected) => {
                                *state = ClientState::Connecting;
                                true
                            }
                            (Outcome::Local, ClientState::Disconnecting) => {
                                *state = ClientState::Disconnected;
                                false
                            }
                            _ => false,
                        }
                    };
                    (shared.events.on_disconnect)(conn);

                    if !reconnect {
                        break;
                    }
                    retry_delay = RETRY_DELAY_FLOOR;
                }
                Err(error) => {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(ConnectStatus::Connecting);
                    }
                    shared.log(LogLevel::Debug, || {
                        format!("Connect to {} failed: {}", endpoint, error)
                    });
                    if shared.state() != ClientState::Connecting {
                        break;
                    }
                    if retry_delay < RETRY_DELAY_CAP {
                        retry_delay += 1;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(u64::from(retry_delay / 10))) => {}
                        _ = shared.wake.notified() => {}
                    }
                }
            }
        }

        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == ClientState::Disconnecting {
            *state = ClientState::Disconnected;
        }
    });

    shared.log(LogLevel::Info, || "Connection finished".to_string());
}

async fn run_connected(shared: &Arc<ClientShared>, stream: PeerStream, conn: Handle) -> Outcome {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut frames = FrameBuffer::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    // Anything queued while disconnected goes out first.
    match drain_writes(shared, &mut writer, conn).await {
        DrainOutcome::Ok => {}
        DrainOutcome::PeerGone => return Outcome::Remote,
        DrainOutcome::Fatal => return Outcome::WriteError,
    }

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    shared.log(LogLevel::Debug, || "Disconnected by server".to_string());
                    return Outcome::Remote;
                }
                Ok(n) => match frames.push(&buf[..n]) {
                    Ok(complete) => {
                        for frame in complete {
                            (shared.events.on_data)(conn, frame.header.handle, frame.body);
                        }
                    }
                    Err(error) => {
                        shared.log(LogLevel::Warning, || format!("{}", error));
                        tracing::warn!("Client connection torn down: {}", error);
                        return Outcome::Remote;
                    }
                },
                Err(error) => {
                    if !is_peer_gone(&error) {
                        shared.log(LogLevel::Warning, || {
                            format!("Stream closed with error: {}", error)
                        });
                    }
                    return Outcome::Remote;
                }
            },
            _ = shared.wake.notified() => {
                if shared.state() == ClientState::Disconnecting {
                    let _ = writer.shutdown().await;
                    return Outcome::Local;
                }
                match drain_writes(shared, &mut writer, conn).await {
                    DrainOutcome::Ok => {}
                    DrainOutcome::PeerGone => return Outcome::Remote,
                    DrainOutcome::Fatal => return Outcome::WriteError,
                }
            }
        }
    }
}

async fn drain_writes(
    shared: &Arc<ClientShared>,
    writer: &mut WriteHalf<PeerStream>,
    conn: Handle,
) -> DrainOutcome {
    for entry in shared.queue.take_batch() {
        if entry.conn != 0 && entry.conn != conn {
            // Stale target from a previous connection epoch.
            let header = entry.header();
            shared.log(LogLevel::Debug, || {
                format!("Dropping frame for stale connection {}", entry.conn)
            });
            if header.is_request() {
                (shared.events.on_orphaned_invoke)(entry.conn, header.handle);
            }
            continue;
        }

        if let Err(error) = writer.write_all(&entry.bytes).await {
            if is_peer_gone(&error) {
                return DrainOutcome::PeerGone;
            }
            shared.log(LogLevel::Error, || format!("Write failed: {}", error));
            tracing::error!("Client write failed: {}", error);
            {
                let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
                if !matches!(
                    *state,
                    ClientState::Disconnected | ClientState::Disconnecting
                ) {
                    *state = ClientState::WriteFailed;
                }
            }
            (shared.events.on_error)(0);
            return DrainOutcome::Fatal;
        }
    }
    DrainOutcome::Ok
}
