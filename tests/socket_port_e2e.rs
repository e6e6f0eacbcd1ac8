//! SocketPort integration tests with real TCP connections.
//!
//! Covered behavior:
//! - Length-prefixed delivery of exactly one message per frame
//! - Byte-identical round trips across arbitrary partial reads
//! - Independent connection handles under one listener
//! - Replies addressed by handle
//! - Invalidation detaching from every loop and broadcasting

mod common;

use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use runloop::port::observe_invalidation;
use runloop::{Mode, Port, PortId, RunLoop, SocketPort};

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Wire image of one length-prefixed frame, for raw-socket peers.
fn framed(payload: &[u8]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(4 + payload.len());
    wire.extend_from_slice(&u32::try_from(payload.len()).unwrap().to_be_bytes());
    wire.extend_from_slice(payload);
    wire
}

#[test]
fn test_five_byte_message_delivered_once() {
    init_logging();
    let rl = RunLoop::new().unwrap();
    let mode = Mode::default_mode();

    let server = SocketPort::listen(loopback()).unwrap();
    let server_inbox = MessageRecorder::shared();
    server.set_delegate(Some(server_inbox.clone()));
    rl.add_port(&server, &mode);

    let client = SocketPort::connect(server.local_addr().unwrap()).unwrap();
    rl.add_port(&client, &mode);
    client.send(b"hello").unwrap();

    assert!(drive_until(&rl, &mode, DRIVE_TIMEOUT, || server_inbox.count() == 1));
    assert_eq!(server_inbox.payload(0), b"hello");

    // Nothing further arrives for a single frame.
    drive_until(&rl, &mode, Duration::from_millis(100), || false);
    assert_eq!(server_inbox.count(), 1);
}

#[test]
fn test_large_message_round_trips_across_partial_reads() {
    init_logging();
    let rl = RunLoop::new().unwrap();
    let mode = Mode::default_mode();

    let server = SocketPort::listen(loopback()).unwrap();
    let server_inbox = MessageRecorder::shared();
    server.set_delegate(Some(server_inbox.clone()));
    rl.add_port(&server, &mode);

    let client = SocketPort::connect(server.local_addr().unwrap()).unwrap();
    rl.add_port(&client, &mode);

    // Large enough to guarantee several partial socket reads and
    // writable-driven flushes of the client's buffered remainder.
    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i * 31 % 251) as u8).collect();
    client.send(&payload).unwrap();

    assert!(drive_until(&rl, &mode, DRIVE_TIMEOUT, || server_inbox.count() == 1));
    assert_eq!(server_inbox.payload(0), payload);
}

#[test]
fn test_reply_goes_back_through_the_sending_handle() {
    init_logging();
    let rl = RunLoop::new().unwrap();
    let mode = Mode::default_mode();

    let server = SocketPort::listen(loopback()).unwrap();
    let server_inbox = MessageRecorder::shared();
    server.set_delegate(Some(server_inbox.clone()));
    rl.add_port(&server, &mode);

    let client = SocketPort::connect(server.local_addr().unwrap()).unwrap();
    let client_inbox = MessageRecorder::shared();
    client.set_delegate(Some(client_inbox.clone()));
    rl.add_port(&client, &mode);

    client.send(b"marco").unwrap();
    assert!(drive_until(&rl, &mode, DRIVE_TIMEOUT, || server_inbox.count() == 1));

    let from = server_inbox.messages.borrow()[0]
        .sender()
        .expect("socket delivery names its handle");
    server.send_to(from, b"polo").unwrap();

    assert!(drive_until(&rl, &mode, DRIVE_TIMEOUT, || client_inbox.count() == 1));
    assert_eq!(client_inbox.payload(0), b"polo");
}

#[test]
fn test_two_connections_have_independent_handles() {
    init_logging();
    let rl = RunLoop::new().unwrap();
    let mode = Mode::default_mode();

    let server = SocketPort::listen(loopback()).unwrap();
    let addr = server.local_addr().unwrap();
    let server_inbox = MessageRecorder::shared();
    server.set_delegate(Some(server_inbox.clone()));
    rl.add_port(&server, &mode);

    let client = SocketPort::connect(addr).unwrap();
    rl.add_port(&client, &mode);
    client.send(b"from the port").unwrap();

    // A second, raw connection speaking the wire format directly.
    let mut raw = std::net::TcpStream::connect(addr).unwrap();
    raw.write_all(&framed(b"from the raw socket")).unwrap();

    assert!(drive_until(&rl, &mode, DRIVE_TIMEOUT, || server_inbox.count() == 2));
    assert_eq!(server.handle_count(), 2);

    let senders: Vec<_> = server_inbox
        .messages
        .borrow()
        .iter()
        .map(|m| m.sender().unwrap())
        .collect();
    assert_ne!(senders[0], senders[1], "each connection gets its own handle");

    // Closing the raw connection never perturbs the other handle.
    drop(raw);
    assert!(drive_until(&rl, &mode, DRIVE_TIMEOUT, || server.handle_count() == 1));

    client.send(b"still here").unwrap();
    assert!(drive_until(&rl, &mode, DRIVE_TIMEOUT, || server_inbox.count() == 3));
    assert_eq!(server_inbox.payload(2), b"still here");
}

#[test]
fn test_invalidation_detaches_from_every_loop() {
    init_logging();
    let rl1 = RunLoop::new().unwrap();
    let rl2 = RunLoop::new().unwrap();
    let mode = Mode::default_mode();
    let modal = Mode::new("modal");

    let port = SocketPort::listen(loopback()).unwrap();
    rl1.add_port(&port, &mode);
    rl2.add_port(&port, &modal);
    assert!(rl1.limit_date(&mode).is_some());
    assert!(rl2.limit_date(&modal).is_some());

    port.invalidate();
    assert!(!port.is_valid());
    assert!(rl1.limit_date(&mode).is_none());
    assert!(rl2.limit_date(&modal).is_none());
}

#[test]
fn test_invalidation_broadcast_reaches_observers() {
    init_logging();
    let seen: Arc<Mutex<Vec<PortId>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let token = observe_invalidation(move |id| sink.lock().unwrap().push(id));

    let port = SocketPort::listen(loopback()).unwrap();
    let id = port.id();
    port.invalidate();
    // Idempotent: the second call must not broadcast again.
    port.invalidate();

    let observed: Vec<PortId> = seen
        .lock()
        .unwrap()
        .iter()
        .filter(|p| **p == id)
        .copied()
        .collect();
    assert_eq!(observed.len(), 1);

    runloop::port::remove_invalidation_observer(token);
}
