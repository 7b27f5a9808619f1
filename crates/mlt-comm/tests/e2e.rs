//! # End-to-end tests over loopback
//!
//! Two real communicators, six real sockets, three threads each. These
//! exercise the full vertical: FlowStart on the control channel, datagram
//! spray through the priority endpoints, reassembly, the bound check, and
//! the StopRequest/StopConfirm handshake delivering both completions.

use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mlt_comm::{Communicator, CompletionKind, FixedPriority, LtMessage, MltConfig};

const COMPLETION_WAIT: Duration = Duration::from_secs(10);
/// A ToS on the registered grid: queue 1, ECT set.
const TEST_TOS: u8 = (8 << 2) | 1;

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Find a port where both the TCP listener and the UDP socket can bind.
fn alloc_port() -> u16 {
    for _ in 0..64 {
        let probe = TcpListener::bind("127.0.0.1:0").expect("probe bind");
        let port = probe.local_addr().unwrap().port();
        if UdpSocket::bind(("127.0.0.1", port)).is_ok() {
            return port;
        }
    }
    panic!("no port with both TCP and UDP free");
}

/// Two distinct usable ports, probed while both are held so they cannot
/// collide with each other.
fn alloc_ports() -> (u16, u16) {
    for _ in 0..64 {
        let probe_a = TcpListener::bind("127.0.0.1:0").expect("probe bind");
        let port_a = probe_a.local_addr().unwrap().port();
        let Ok(_udp_a) = UdpSocket::bind(("127.0.0.1", port_a)) else {
            continue;
        };
        let probe_b = TcpListener::bind("127.0.0.1:0").expect("probe bind");
        let port_b = probe_b.local_addr().unwrap().port();
        let Ok(_udp_b) = UdpSocket::bind(("127.0.0.1", port_b)) else {
            continue;
        };
        if port_a != port_b {
            return (port_a, port_b);
        }
    }
    panic!("no distinct ports with both TCP and UDP free");
}

/// Bring up a fully connected communicator pair.
fn connected_pair() -> (Communicator, Communicator, u16, u16) {
    let (port_a, port_b) = alloc_ports();

    let a = Communicator::start(1, port_a, MltConfig::default()).expect("start a");
    let b = Communicator::start(2, port_b, MltConfig::default()).expect("start b");

    let addr_a: SocketAddr = format!("127.0.0.1:{port_a}").parse().unwrap();
    let addr_b: SocketAddr = format!("127.0.0.1:{port_b}").parse().unwrap();

    // comm_id 1 < 2: `a` connects, `b` waits for the accept.
    let waiter = std::thread::spawn(move || {
        b.add_connection(1, addr_a).expect("b add_connection");
        b
    });
    a.add_connection(2, addr_b).expect("a add_connection");
    let b = waiter.join().expect("b connect thread");

    (a, b, 1, 2)
}

fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

// ─── Metadata ───────────────────────────────────────────────────────────────

#[test]
fn metadata_round_trip() {
    let (a, b, id_a, id_b) = connected_pair();

    a.send_meta_async(id_b, b"tensor:conv1.weight").unwrap();
    let (src, data) = b.recv_meta().unwrap();
    assert_eq!(src, id_a);
    assert_eq!(data.as_ref(), b"tensor:conv1.weight");

    b.send_meta_async(id_a, b"ack").unwrap();
    let (src, data) = a.recv_meta().unwrap();
    assert_eq!(src, id_b);
    assert_eq!(data.as_ref(), b"ack");
}

// ─── Lossless Transfer ──────────────────────────────────────────────────────

#[test]
fn lossless_transfer_completes_both_sides() {
    let (a, b, id_a, id_b) = connected_pair();
    let body = payload(14_000);

    b.post_recv(id_a, 42, vec![0u8; 14_000], 0.1).unwrap();
    a.post_send(
        id_b,
        LtMessage::new(42, Bytes::from(body.clone())),
        Arc::new(FixedPriority::new(TEST_TOS)),
    )
    .unwrap();

    let recv_completion = b
        .completions()
        .recv_timeout(COMPLETION_WAIT)
        .expect("recv completion");
    assert_eq!(recv_completion.kind, CompletionKind::Recv);
    assert_eq!(recv_completion.msg_id, 42);
    assert_eq!(recv_completion.remote_comm_id, id_a);
    // Loopback drops nothing: every byte arrives, not just the bound.
    assert_eq!(recv_completion.bytes, 14_000);
    assert_eq!(recv_completion.data.as_deref(), Some(body.as_slice()));

    let send_completion = a
        .completions()
        .recv_timeout(COMPLETION_WAIT)
        .expect("send completion");
    assert_eq!(send_completion.kind, CompletionKind::Send);
    assert_eq!(send_completion.msg_id, 42);
    assert_eq!(send_completion.remote_comm_id, id_b);
    assert!(send_completion.data.is_none());
}

#[test]
fn several_messages_complete_independently() {
    let (a, b, id_a, id_b) = connected_pair();
    let sizes = [2_000usize, 14_000, 40_000];

    for (i, &size) in sizes.iter().enumerate() {
        b.post_recv(id_a, i as u32, vec![0u8; size], 0.0).unwrap();
    }
    for (i, &size) in sizes.iter().enumerate() {
        a.post_send(
            id_b,
            LtMessage::new(i as u32, Bytes::from(payload(size))),
            Arc::new(FixedPriority::new(TEST_TOS)),
        )
        .unwrap();
    }

    let completions = b.completions();
    let mut seen = Vec::new();
    for _ in 0..sizes.len() {
        let c = completions.recv_timeout(COMPLETION_WAIT).expect("recv completion");
        assert_eq!(c.kind, CompletionKind::Recv);
        assert_eq!(c.bytes, sizes[c.msg_id as usize]);
        assert_eq!(c.data.as_deref(), Some(payload(c.bytes).as_slice()));
        seen.push(c.msg_id);
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2]);

    // Exactly one send completion per message.
    let send_completions = a.completions();
    for _ in 0..sizes.len() {
        let c = send_completions
            .recv_timeout(COMPLETION_WAIT)
            .expect("send completion");
        assert_eq!(c.kind, CompletionKind::Send);
    }
}

// ─── Backlog Staging ────────────────────────────────────────────────────────

#[test]
fn datagrams_before_post_recv_are_staged_and_replayed() {
    let (a, b, id_a, id_b) = connected_pair();
    let body = payload(14_000);

    // Send with no receive posted: everything lands in the backlog (and the
    // sender keeps retransmitting against the unmet bound).
    a.post_send(
        id_b,
        LtMessage::new(7, Bytes::from(body.clone())),
        Arc::new(FixedPriority::new(TEST_TOS)),
    )
    .unwrap();
    std::thread::sleep(Duration::from_millis(300));

    b.post_recv(id_a, 7, vec![0u8; 14_000], 0.1).unwrap();

    let c = b
        .completions()
        .recv_timeout(COMPLETION_WAIT)
        .expect("recv completion");
    assert_eq!(c.msg_id, 7);
    assert_eq!(c.bytes, 14_000);
    assert_eq!(c.data.as_deref(), Some(body.as_slice()));

    let c = a
        .completions()
        .recv_timeout(COMPLETION_WAIT)
        .expect("send completion");
    assert_eq!(c.kind, CompletionKind::Send);
    assert_eq!(c.msg_id, 7);
}

// ─── API Errors ─────────────────────────────────────────────────────────────

#[test]
fn operations_on_unknown_peer_fail_fast() {
    let port = alloc_port();
    let comm = Communicator::start(9, port, MltConfig::default()).unwrap();

    assert!(comm
        .post_send(
            3,
            LtMessage::new(1, Bytes::from_static(b"x")),
            Arc::new(FixedPriority::new(TEST_TOS)),
        )
        .is_err());
    assert!(comm.post_recv(3, 1, vec![0u8; 4], 0.0).is_err());
    assert!(comm.send_meta_async(3, b"x").is_err());
}
