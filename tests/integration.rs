//! End-to-end tests over real endpoints.
//!
//! Each test gets a unique endpoint name so suites can run in
//! parallel. Everything here is callback-driven: handlers forward into
//! channels and the test thread waits with a timeout.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use framewire::{
    Bytes, ClientSession, ConnectStatus, InvokeResult, ResultFn, ServerSession,
    SingleServerSession,
};

static ENDPOINT_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(tag: &str) -> String {
    format!(
        "framewire-test-{}-{}-{}",
        std::process::id(),
        tag,
        ENDPOINT_COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

const WAIT: Duration = Duration::from_secs(5);

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Deterministic filler bytes; a different seed gives different data.
fn filler_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x517c_c1b7_2722_0a95).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            (state >> 33) as u8
        })
        .collect()
}

/// A free TCP port on loopback.
fn free_tcp_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[test]
fn short_and_long_messages_arrive_intact_and_in_order() {
    let name = unique_name("messages");
    let short = filler_bytes(1000, 1);
    let long = filler_bytes(50_000, 2);

    let server = SingleServerSession::local(&name);
    let (connected_tx, connected_rx) = mpsc::channel();
    server.on_connect(move || {
        let _ = connected_tx.send(());
    });
    server.listen().unwrap();

    let client = ClientSession::local(&name);
    let (received_tx, received_rx) = mpsc::channel();
    client.on_received(move |body| {
        let _ = received_tx.send(body);
    });
    client.connect();

    connected_rx.recv_timeout(WAIT).unwrap();
    server.send(short.clone());
    server.send(long.clone());

    let first = received_rx.recv_timeout(WAIT).unwrap();
    let second = received_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(&first[..], &short[..]);
    assert_eq!(&second[..], &long[..]);
}

#[test]
fn invoke_round_trip_echo() {
    let name = unique_name("echo");

    let server = SingleServerSession::local(&name);
    server.on_invoked_immediate(|body| body.to_vec());
    server.listen().unwrap();

    let client = ClientSession::local(&name);
    let status = client.connect();
    assert!(matches!(
        status,
        ConnectStatus::Connecting | ConnectStatus::Connected
    ));

    let (result_tx, result_rx) = mpsc::channel();
    client.invoke_with(b"hello".to_vec(), move |code, body| {
        let _ = result_tx.send((code, body));
    });

    let (code, body) = result_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(code, InvokeResult::Good);
    assert_eq!(&body[..], b"hello");
}

#[test]
fn remote_disconnect_completes_invoke() {
    let name = unique_name("remote-disconnect");

    let server = SingleServerSession::local(&name);
    let (accepted_tx, accepted_rx) = mpsc::channel();
    server.on_connect(move || {
        let _ = accepted_tx.send(());
    });
    server.listen().unwrap();

    // The client receives the invoke and, instead of replying, asks
    // the test thread to disconnect it.
    let client = ClientSession::local(&name);
    let (invoked_tx, invoked_rx) = mpsc::channel();
    client.on_invoked_promise_id(move |_conn, _promise_id, _body| {
        let _ = invoked_tx.send(());
    });
    client.connect();
    accepted_rx.recv_timeout(WAIT).unwrap();

    let (result_tx, result_rx) = mpsc::channel();
    server.invoke_with(b"answer me".to_vec(), move |code, body| {
        let _ = result_tx.send((code, body));
    });

    invoked_rx.recv_timeout(WAIT).unwrap();
    client.disconnect();

    let (code, body) = result_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(code, InvokeResult::RemoteDisconnect);
    assert!(body.is_empty());
}

#[test]
fn local_disconnect_completes_invoke() {
    let name = unique_name("local-disconnect");

    // No invoked handler: the server will never answer.
    let server = SingleServerSession::local(&name);
    server.listen().unwrap();

    let client = ClientSession::local(&name);
    let (connected_tx, connected_rx) = mpsc::channel();
    client.on_connect(move || {
        let _ = connected_tx.send(());
    });
    client.connect();
    connected_rx.recv_timeout(WAIT).unwrap();

    let (result_tx, result_rx) = mpsc::channel();
    client.invoke_with(b"no reply coming".to_vec(), move |code, body| {
        let _ = result_tx.send((code, body));
    });
    client.disconnect();

    let (code, body) = result_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(code, InvokeResult::LocalDisconnect);
    assert!(body.is_empty());
}

#[test]
fn expired_result_fn_is_a_noop_after_destroy() {
    let name = unique_name("expired-result");

    let server = SingleServerSession::local(&name);
    let (accepted_tx, accepted_rx) = mpsc::channel();
    server.on_connect(move || {
        let _ = accepted_tx.send(());
    });
    server.listen().unwrap();

    // The client parks the result function instead of calling it.
    let client = ClientSession::local(&name);
    let parked: Arc<Mutex<Option<ResultFn>>> = Arc::new(Mutex::new(None));
    let (invoked_tx, invoked_rx) = mpsc::channel();
    {
        let parked = parked.clone();
        client.on_invoked_callback(move |_body, result_fn| {
            *parked.lock().unwrap() = Some(result_fn);
            let _ = invoked_tx.send(());
        });
    }
    client.connect();
    accepted_rx.recv_timeout(WAIT).unwrap();

    let (result_tx, result_rx) = mpsc::channel();
    server.invoke_with(b"work".to_vec(), move |code, body| {
        let _ = result_tx.send((code, body));
    });
    invoked_rx.recv_timeout(WAIT).unwrap();

    // A background thread fires the parked result function well after
    // the session is gone.
    let late = {
        let parked = parked.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            if let Some(result_fn) = parked.lock().unwrap().take() {
                result_fn(b"too late".to_vec());
            }
        })
    };

    drop(client);

    let (code, body) = result_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(code, InvokeResult::RemoteDisconnect);
    assert!(body.is_empty());

    late.join().unwrap();
}

#[test]
fn multi_client_fan_out() {
    const CLIENTS: usize = 20;
    const INVOKES: usize = 5;
    let name = unique_name("fan-out");

    let server = ServerSession::local(&name);
    server.on_invoked_immediate(|_conn, body| body.to_vec());
    let connects = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(AtomicUsize::new(0));
    {
        let connects = connects.clone();
        server.on_connect(move |_conn| {
            connects.fetch_add(1, Ordering::SeqCst);
        });
        let disconnects = disconnects.clone();
        server.on_disconnect(move |_conn| {
            disconnects.fetch_add(1, Ordering::SeqCst);
        });
    }
    server.listen().unwrap();

    let mut workers = Vec::new();
    for client_index in 0..CLIENTS {
        let name = name.clone();
        workers.push(thread::spawn(move || {
            let client = ClientSession::local(&name);
            client.connect();

            let (result_tx, result_rx) = mpsc::channel();
            for invoke_index in 0..INVOKES {
                let payload = filler_bytes(64, (client_index * INVOKES + invoke_index) as u64);
                let expected = payload.clone();
                let result_tx = result_tx.clone();
                client.invoke_with(payload, move |code, body| {
                    let _ = result_tx.send((code, body, expected));
                });
            }

            for _ in 0..INVOKES {
                let (code, body, expected) = result_rx.recv_timeout(WAIT).unwrap();
                assert_eq!(code, InvokeResult::Good);
                assert_eq!(&body[..], &expected[..]);
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(wait_until(|| disconnects.load(Ordering::SeqCst) == CLIENTS));
    assert_eq!(connects.load(Ordering::SeqCst), CLIENTS);
    assert!(wait_until(|| server.active_connections() == 0));
}

#[test]
fn latest_only_eviction_keeps_newest_peer() {
    let name = unique_name("eviction");

    let server = SingleServerSession::local(&name);
    server.on_invoked_immediate(|body| body.to_vec());
    let server_connects = Arc::new(AtomicUsize::new(0));
    {
        let server_connects = server_connects.clone();
        server.on_connect(move || {
            server_connects.fetch_add(1, Ordering::SeqCst);
        });
    }
    server.listen().unwrap();

    let client_a = ClientSession::local(&name);
    let a_disconnects = Arc::new(AtomicUsize::new(0));
    {
        let a_disconnects = a_disconnects.clone();
        client_a.on_disconnect(move || {
            a_disconnects.fetch_add(1, Ordering::SeqCst);
        });
    }
    client_a.connect();
    assert!(wait_until(|| server_connects.load(Ordering::SeqCst) >= 1));

    let client_b = ClientSession::local(&name);
    client_b.connect();
    assert!(wait_until(|| server_connects.load(Ordering::SeqCst) >= 2));

    // Admitting B evicted A.
    assert!(wait_until(|| a_disconnects.load(Ordering::SeqCst) >= 1));

    // A reconnects on its own (it never asked to disconnect), which
    // can evict B right back. Tear A down for good and the session
    // settles on B alone.
    drop(client_a);
    assert!(wait_until(|| server.active_connections() == 1));

    // A connect attempt A queued before teardown can still arrive and
    // evict B once more; wait until the peer count holds steady.
    let mut stable_since = Instant::now();
    assert!(wait_until(|| {
        if server.active_connections() != 1 {
            stable_since = Instant::now();
        }
        stable_since.elapsed() > Duration::from_millis(250)
    }));

    let (result_tx, result_rx) = mpsc::channel();
    client_b.invoke_with(b"still here".to_vec(), move |code, body| {
        let _ = result_tx.send((code, body));
    });
    let (code, body) = result_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(code, InvokeResult::Good);
    assert_eq!(&body[..], b"still here");
}

#[test]
fn client_reconnects_when_server_appears() {
    let name = unique_name("reconnect");

    let client = ClientSession::local(&name);
    let (connected_tx, connected_rx) = mpsc::channel();
    client.on_connect(move || {
        let _ = connected_tx.send(());
    });
    assert_eq!(client.connect(), ConnectStatus::Connecting);

    // Stay in Connecting for a while with nobody listening.
    assert!(connected_rx
        .recv_timeout(Duration::from_millis(100))
        .is_err());

    let server = SingleServerSession::local(&name);
    server.listen().unwrap();

    // onConnect fires without another connect() call.
    connected_rx.recv_timeout(WAIT).unwrap();
}

#[test]
fn frame_boundaries_are_preserved() {
    const MESSAGES: usize = 10;
    let name = unique_name("boundaries");

    let server = ServerSession::local(&name);
    let (received_tx, received_rx) = mpsc::channel();
    server.on_received(move |_conn, body| {
        let _ = received_tx.send(body);
    });
    server.listen().unwrap();

    let client = ClientSession::local(&name);
    client.connect();

    let payloads: Vec<Vec<u8>> = (0..MESSAGES)
        .map(|i| filler_bytes(100 + i * 37, i as u64))
        .collect();
    for payload in &payloads {
        client.send(payload.clone());
    }

    for expected in &payloads {
        let body = received_rx.recv_timeout(WAIT).unwrap();
        assert_eq!(&body[..], &expected[..]);
    }
}

#[test]
fn boundary_sizes_round_trip() {
    let name = unique_name("sizes");

    let server = ServerSession::local(&name);
    let (received_tx, received_rx) = mpsc::channel();
    server.on_received(move |_conn, body| {
        let _ = received_tx.send(body);
    });
    server.listen().unwrap();

    let client = ClientSession::local(&name);
    client.connect();

    // Zero, one, around the 8-byte header, and a megabyte.
    for (seed, size) in [0usize, 1, 7, 8, 9, 1024 * 1024].into_iter().enumerate() {
        let payload = filler_bytes(size, seed as u64);
        client.send(payload.clone());
        let body = received_rx.recv_timeout(WAIT).unwrap();
        assert_eq!(&body[..], &payload[..], "size {}", size);
    }
}

#[test]
fn broadcast_reaches_every_peer() {
    const CLIENTS: usize = 3;
    let name = unique_name("broadcast");

    let server = ServerSession::local(&name);
    server.listen().unwrap();

    let mut clients = Vec::new();
    let (received_tx, received_rx) = mpsc::channel();
    for _ in 0..CLIENTS {
        let client = ClientSession::local(&name);
        let received_tx = received_tx.clone();
        client.on_received(move |body| {
            let _ = received_tx.send(body);
        });
        client.connect();
        clients.push(client);
    }
    assert!(wait_until(|| server.active_connections() == CLIENTS));

    server.broadcast(b"fan out".to_vec());

    for _ in 0..CLIENTS {
        let body = received_rx.recv_timeout(WAIT).unwrap();
        assert_eq!(&body[..], b"fan out");
    }
}

#[test]
fn tcp_invoke_round_trip() {
    let addr = format!("127.0.0.1:{}", free_tcp_port());

    let server = SingleServerSession::tcp(&addr);
    server.on_invoked_immediate(|body| body.to_vec());
    server.listen().unwrap();

    let client = ClientSession::tcp(&addr);
    client.connect();

    let (result_tx, result_rx) = mpsc::channel();
    client.invoke_with(b"over tcp".to_vec(), move |code, body| {
        let _ = result_tx.send((code, body));
    });

    let (code, body) = result_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(code, InvokeResult::Good);
    assert_eq!(&body[..], b"over tcp");
}

#[test]
fn second_connect_is_idempotent() {
    let name = unique_name("idempotent");

    let server = SingleServerSession::local(&name);
    server.listen().unwrap();

    let client = ClientSession::local(&name);
    let (connected_tx, connected_rx) = mpsc::channel();
    client.on_connect(move || {
        let _ = connected_tx.send(());
    });
    client.connect();
    connected_rx.recv_timeout(WAIT).unwrap();

    assert_eq!(client.connect(), ConnectStatus::Connected);
}

#[test]
fn unmatched_response_reaches_global_result_handler() {
    let name = unique_name("global-result");

    let server = SingleServerSession::local(&name);
    server.on_invoked_immediate(|body| body.to_vec());
    server.listen().unwrap();

    let client = ClientSession::local(&name);
    let (result_tx, result_rx) = mpsc::channel::<(u32, Bytes)>();
    client.on_result(move |promise_id, body| {
        let _ = result_tx.send((promise_id, body));
    });
    client.connect();

    // Plain invoke registers no completion, so the echo lands in the
    // global handler with the matching promise id.
    let promise_id = client.invoke(b"anybody listening".to_vec());

    let (seen_id, body) = result_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(seen_id, promise_id);
    assert_eq!(&body[..], b"anybody listening");
}

#[test]
fn no_callbacks_after_destroy() {
    let name = unique_name("silence");

    let server = SingleServerSession::local(&name);
    let (accepted_tx, accepted_rx) = mpsc::channel();
    server.on_connect(move || {
        let _ = accepted_tx.send(());
    });
    server.listen().unwrap();

    let client = ClientSession::local(&name);
    let events = Arc::new(AtomicUsize::new(0));
    {
        let events = events.clone();
        client.on_received(move |_body| {
            events.fetch_add(1, Ordering::SeqCst);
        });
    }
    client.connect();
    accepted_rx.recv_timeout(WAIT).unwrap();

    drop(client);
    let after_destroy = events.load(Ordering::SeqCst);

    // Anything the server sends now has nowhere to land.
    server.send(b"echo into the void".to_vec());
    thread::sleep(Duration::from_millis(100));
    assert_eq!(events.load(Ordering::SeqCst), after_destroy);
}

#[test]
fn connect_disconnect_accounting_balances() {
    let name = unique_name("accounting");

    let server = ServerSession::local(&name);
    let connects = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(AtomicUsize::new(0));
    {
        let connects = connects.clone();
        server.on_connect(move |_conn| {
            connects.fetch_add(1, Ordering::SeqCst);
        });
        let disconnects = disconnects.clone();
        server.on_disconnect(move |_conn| {
            disconnects.fetch_add(1, Ordering::SeqCst);
        });
    }
    server.listen().unwrap();

    for _ in 0..5 {
        let client = ClientSession::local(&name);
        client.connect();
        assert!(wait_until(|| {
            connects.load(Ordering::SeqCst)
                == disconnects.load(Ordering::SeqCst) + server.active_connections()
        }));
        drop(client);
    }

    assert!(wait_until(|| disconnects.load(Ordering::SeqCst) == 5));
    assert_eq!(connects.load(Ordering::SeqCst), 5);
    assert!(wait_until(|| server.active_connections() == 0));
}
