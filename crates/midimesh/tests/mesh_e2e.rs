// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end tests over real sockets on loopback: two cores exchanging
//! MIDI with and without reliability.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use common::StaticRouter;
use midimesh::{FailureReason, MeshConfig, MeshCore, NodeId};

/// Core with a unique fallback port so parallel tests do not cross-talk.
fn named_core(name: &str, multicast_port: u16, router: Arc<StaticRouter>) -> MeshCore {
    let mut config = MeshConfig::named(name);
    config.discovery.multicast_port = multicast_port;
    // Keep these tests focused on the data plane; announcements stay
    // infrequent.
    config.discovery.announce_interval = Duration::from_secs(30);
    MeshCore::new(config, router)
}

#[test]
fn test_in_order_delivery_between_endpoints() {
    let router = Arc::new(StaticRouter::new());
    let a = named_core("e2e-a", 39201, Arc::clone(&router));
    let b = named_core("e2e-b", 39201, Arc::clone(&router));

    let _a_port = a.start(0).expect("core a should start");
    let b_port = b.start(0).expect("core b should start");
    router.add(b.node_id(), "127.0.0.1", b_port);

    let (tx, rx) = mpsc::channel();
    b.register_receive(Box::new(move |source, device, midi| {
        let _ = tx.send((source, device, midi));
    }));

    let seq_num = a
        .send(b.node_id(), 1, vec![0x90, 0x3C, 0x64], false)
        .expect("send should succeed");
    assert_eq!(seq_num, 0, "first packet to a peer carries sequence 0");

    let (source, device, midi) = rx
        .recv_timeout(Duration::from_secs(2))
        .expect("note should arrive");
    assert_eq!(source, a.node_id());
    assert_eq!(device, 1);
    assert_eq!(midi, vec![0x90, 0x3C, 0x64]);

    // A burst stays in order.
    for velocity in 1..=20u8 {
        a.send(b.node_id(), 1, vec![0x90, 0x40, velocity], false)
            .expect("send should succeed");
    }
    let mut velocities = Vec::new();
    while velocities.len() < 20 {
        let (_, _, midi) = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("burst packet should arrive");
        velocities.push(midi[2]);
    }
    let expected: Vec<u8> = (1..=20).collect();
    assert_eq!(velocities, expected, "loopback burst must deliver in order");

    let stats = b.statistics();
    assert_eq!(stats.delivered_in_order, 21);
    assert_eq!(stats.endpoint.checksum_failures, 0);

    a.stop();
    b.stop();
}

#[test]
fn test_reliable_send_success() {
    let router = Arc::new(StaticRouter::new());
    let a = named_core("rel-a", 39202, Arc::clone(&router));
    let b = named_core("rel-b", 39202, Arc::clone(&router));

    a.start(0).expect("core a should start");
    let b_port = b.start(0).expect("core b should start");
    router.add(b.node_id(), "127.0.0.1", b_port);

    let (midi_tx, midi_rx) = mpsc::channel();
    b.register_receive(Box::new(move |_, _, midi| {
        let _ = midi_tx.send(midi);
    }));

    let successes = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = mpsc::channel();

    let s = Arc::clone(&successes);
    let f = Arc::clone(&failures);
    a.send_reliable_with(
        b.node_id(),
        2,
        vec![0xB0, 0x07, 0x7F],
        Box::new(move || {
            s.fetch_add(1, Ordering::Relaxed);
            let _ = done_tx.send(());
        }),
        Box::new(move |_| {
            f.fetch_add(1, Ordering::Relaxed);
        }),
    )
    .expect("reliable send should start");

    done_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("on_success should fire");
    assert_eq!(successes.load(Ordering::Relaxed), 1);
    assert_eq!(failures.load(Ordering::Relaxed), 0);

    // The payload reached the application too.
    let midi = midi_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("payload should deliver");
    assert_eq!(midi, vec![0xB0, 0x07, 0x7F]);

    // Give the duplicate-ACK window a moment, then confirm exactly-once.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(successes.load(Ordering::Relaxed), 1);

    let stats = a.statistics();
    assert_eq!(stats.reliable_sent, 1);
    assert_eq!(stats.acks_received, 1);
    assert_eq!(stats.reliable_pending, 0);

    a.stop();
    b.stop();
}

#[test]
fn test_reliable_send_black_hole_fails_once() {
    let router = Arc::new(StaticRouter::new());
    let a = named_core("hole-a", 39203, Arc::clone(&router));
    a.start(0).expect("core a should start");

    // Nothing listens here; every transmission vanishes.
    let ghost = NodeId::generate();
    router.add(ghost, "127.0.0.1", 39);

    let (fail_tx, fail_rx) = mpsc::channel();
    let started = Instant::now();
    a.send_reliable_with(
        ghost,
        1,
        vec![0x90, 0x3C, 0x64],
        Box::new(|| panic!("black-hole send must not succeed")),
        Box::new(move |reason| {
            let _ = fail_tx.send(reason);
        }),
    )
    .expect("reliable send should start");

    let reason = fail_rx
        .recv_timeout(Duration::from_secs(3))
        .expect("on_failure should fire");
    assert_eq!(reason, FailureReason::MaxAttemptsExceeded);
    assert_eq!(reason.as_str(), "max_attempts_exceeded");
    // 3 attempts x 100 ms fixed backoff, generous slack for CI.
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "failure should resolve within the retry window"
    );

    // Never a second terminal callback.
    assert!(fail_rx.recv_timeout(Duration::from_millis(500)).is_err());

    let stats = a.statistics();
    assert_eq!(stats.reliable_timeouts, 1);
    assert_eq!(stats.retransmissions, 2);

    a.stop();
}

#[test]
fn test_stop_cancels_pending_and_resets_counters() {
    let router = Arc::new(StaticRouter::new());
    let a = named_core("reset-a", 39204, Arc::clone(&router));
    a.start(0).expect("core a should start");

    let ghost = NodeId::generate();
    router.add(ghost, "127.0.0.1", 39);

    // Long timeout so the send is still pending when we stop.
    let mut config = MeshConfig::named("reset-b");
    config.reliability.initial_timeout = Duration::from_secs(60);
    config.discovery.multicast_port = 39205;
    let router: Arc<dyn midimesh::PeerRouter> = router;
    let slow = MeshCore::new(config, Arc::clone(&router));
    slow.start(0).expect("slow core should start");

    let (fail_tx, fail_rx) = mpsc::channel();
    slow.send_reliable_with(
        ghost,
        1,
        vec![0xF8],
        Box::new(|| panic!("must not succeed")),
        Box::new(move |reason| {
            let _ = fail_tx.send(reason);
        }),
    )
    .expect("reliable send should start");

    slow.stop();
    // The cancellation fired before stop returned.
    let reason = fail_rx
        .recv_timeout(Duration::from_millis(100))
        .expect("canceled callback should have fired during stop");
    assert_eq!(reason, FailureReason::Canceled);
    assert_eq!(reason.as_str(), "canceled");

    // Restart: a stop-start cycle fully resets counters.
    slow.start(0).expect("restart should succeed");
    let stats = slow.statistics();
    assert_eq!(stats.endpoint.packets_sent, 0);
    assert_eq!(stats.reliable_pending, 0);
    slow.stop();

    a.stop();
}
