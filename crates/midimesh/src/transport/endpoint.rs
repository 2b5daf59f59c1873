// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Datagram endpoint: owns exactly one UDP socket.
//!
//! Transmission is best-effort; retries belong to the reliability layer.
//! The receive loop parses each datagram and hands valid packets to the
//! registered handler together with the source address. Parse and
//! integrity failures are counted and the datagram is dropped silently.
//!
//! Per-peer outbound sequence counters live here so that `send_message`
//! can atomically assign the next sequence and transmit.

use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::core::{DeviceId, MeshError, NodeId};
use crate::protocol::Packet;

/// Receive-loop poll interval; the stop flag is observed between reads.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Largest datagram the receive loop accepts.
const RECV_BUF_LEN: usize = 2048;

/// Receive callback: parsed packet plus source endpoint address.
pub type PacketHandler = Box<dyn Fn(Packet, SocketAddr) + Send + Sync>;

/// Endpoint traffic counters.
#[derive(Debug, Default)]
struct EndpointMetrics {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    checksum_failures: AtomicU64,
    parse_failures: AtomicU64,
}

impl EndpointMetrics {
    fn reset(&self) {
        self.packets_sent.store(0, Ordering::Relaxed);
        self.packets_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.checksum_failures.store(0, Ordering::Relaxed);
        self.parse_failures.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of endpoint statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    /// Packets transmitted.
    pub packets_sent: u64,
    /// Valid packets received and dispatched.
    pub packets_received: u64,
    /// Bytes transmitted.
    pub bytes_sent: u64,
    /// Bytes received, valid or not.
    pub bytes_received: u64,
    /// Datagrams dropped for checksum mismatch.
    pub checksum_failures: u64,
    /// Datagrams dropped for any other parse failure.
    pub parse_failures: u64,
}

/// UDP endpoint with a dedicated receive thread.
///
/// `start` binds and spawns the loop; `stop` joins it and releases the
/// socket. A stop-start cycle resets every counter and per-peer sequence.
pub struct UdpEndpoint {
    node_id: NodeId,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    handler: Arc<ArcSwapOption<PacketHandler>>,
    next_seq: DashMap<NodeId, u16>,
    metrics: Arc<EndpointMetrics>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl UdpEndpoint {
    /// Endpoint for the given local node. Not yet bound; call [`start`].
    ///
    /// [`start`]: UdpEndpoint::start
    #[must_use]
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            socket: Mutex::new(None),
            handler: Arc::new(ArcSwapOption::from(None)),
            next_seq: DashMap::new(),
            metrics: Arc::new(EndpointMetrics::default()),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Local node id carried as the source of every outbound packet.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Bind the socket (port 0 means OS-assigned) and spawn the receive
    /// loop. Returns the bound port.
    pub fn start(&self, port: u16) -> Result<u16, MeshError> {
        let mut socket_slot = self.socket.lock();
        if socket_slot.is_some() {
            return Err(MeshError::BindFailed(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "endpoint already started",
            )));
        }

        let socket = bind_socket(port).map_err(MeshError::BindFailed)?;
        socket
            .set_read_timeout(Some(RECV_TIMEOUT))
            .map_err(MeshError::BindFailed)?;
        let bound = socket.local_addr().map_err(MeshError::BindFailed)?.port();

        // Fresh run: counters and sequences start from zero.
        self.metrics.reset();
        self.next_seq.clear();

        let socket = Arc::new(socket);
        self.running.store(true, Ordering::Relaxed);

        let handle = {
            let socket = Arc::clone(&socket);
            let handler = Arc::clone(&self.handler);
            let metrics = Arc::clone(&self.metrics);
            let running = Arc::clone(&self.running);
            std::thread::Builder::new()
                .name("midimesh-rx".to_string())
                .spawn(move || {
                    Self::run_loop(&socket, &handler, &metrics, &running);
                })
                .map_err(MeshError::BindFailed)?
        };

        *socket_slot = Some(socket);
        *self.handle.lock() = Some(handle);
        log::debug!("[UDP] endpoint started node={} port={}", self.node_id, bound);
        Ok(bound)
    }

    /// Stop the receive loop and release the socket. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        *self.socket.lock() = None;
        log::debug!("[UDP] endpoint stopped node={}", self.node_id);
    }

    /// Register the receive callback. Replaces any previous handler.
    pub fn set_packet_handler(&self, handler: PacketHandler) {
        self.handler.store(Some(Arc::new(handler)));
    }

    /// Frame and transmit a DATA packet, assigning the next sequence for
    /// `dest_node`. Returns the assigned sequence.
    pub fn send_message(
        &self,
        dest_node: NodeId,
        host: &str,
        port: u16,
        device_id: DeviceId,
        midi: Vec<u8>,
    ) -> Result<u16, MeshError> {
        // Entry guard keeps assignment-and-increment atomic per peer.
        let seq_num = self.next_sequence(dest_node);
        let packet = Packet::data(self.node_id, dest_node, device_id, seq_num, midi);
        let addr = resolve(host, port)?;
        self.send_raw(&packet, addr)?;
        Ok(seq_num)
    }

    /// Assign the next outbound sequence for `dest_node` without
    /// transmitting. Used by the reliability layer, which owns the
    /// transmission of the packet it must be able to retransmit.
    #[must_use]
    pub fn next_sequence(&self, dest_node: NodeId) -> u16 {
        let mut entry = self.next_seq.entry(dest_node).or_insert(0);
        let assigned = *entry;
        *entry = assigned.wrapping_add(1);
        assigned
    }

    /// Transmit a pre-built packet (reliability and discovery layers).
    pub fn send_raw(&self, packet: &Packet, addr: SocketAddr) -> Result<(), MeshError> {
        let bytes = packet.serialize()?;
        let socket = {
            let slot = self.socket.lock();
            slot.as_ref().map(Arc::clone)
        };
        let Some(socket) = socket else {
            return Err(MeshError::NotStarted);
        };

        match socket.send_to(&bytes, addr) {
            Ok(n) => {
                self.metrics.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.metrics.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                log::debug!("[UDP] send error={} dest={} len={}", e, addr, bytes.len());
                Err(MeshError::SendFailed(e))
            }
        }
    }

    /// Bound local address, when started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket
            .lock()
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn statistics(&self) -> EndpointStats {
        EndpointStats {
            packets_sent: self.metrics.packets_sent.load(Ordering::Relaxed),
            packets_received: self.metrics.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.metrics.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.metrics.bytes_received.load(Ordering::Relaxed),
            checksum_failures: self.metrics.checksum_failures.load(Ordering::Relaxed),
            parse_failures: self.metrics.parse_failures.load(Ordering::Relaxed),
        }
    }

    fn run_loop(
        socket: &UdpSocket,
        handler: &ArcSwapOption<PacketHandler>,
        metrics: &EndpointMetrics,
        running: &AtomicBool,
    ) {
        let mut buf = [0u8; RECV_BUF_LEN];
        while running.load(Ordering::Relaxed) {
            let (len, src) = match socket.recv_from(&mut buf) {
                Ok(pair) => pair,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    if running.load(Ordering::Relaxed) {
                        log::debug!("[UDP] recv error: {}", e);
                    }
                    continue;
                }
            };

            metrics
                .bytes_received
                .fetch_add(len as u64, Ordering::Relaxed);

            match Packet::deserialize(&buf[..len]) {
                Ok(packet) => {
                    metrics.packets_received.fetch_add(1, Ordering::Relaxed);
                    if let Some(h) = handler.load_full() {
                        h(packet, src);
                    }
                }
                Err(MeshError::ChecksumMismatch) => {
                    metrics.checksum_failures.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    metrics.parse_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

impl Drop for UdpEndpoint {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bind a reuse-address UDP socket on the wildcard interface.
fn bind_socket(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Resolve a textual host plus port to a socket address.
pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr, MeshError> {
    (host, port)
        .to_socket_addrs()
        .map_err(MeshError::SendFailed)?
        .next()
        .ok_or_else(|| {
            MeshError::SendFailed(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "host resolved to no address",
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn started_endpoint() -> (UdpEndpoint, u16) {
        let endpoint = UdpEndpoint::new(NodeId::generate());
        let port = endpoint.start(0).expect("bind to ephemeral port");
        (endpoint, port)
    }

    #[test]
    fn test_start_assigns_port() {
        let (endpoint, port) = started_endpoint();
        assert_ne!(port, 0);
        assert_eq!(
            endpoint.local_addr().map(|a| a.port()),
            Some(port),
            "local_addr should report the bound port"
        );
        endpoint.stop();
    }

    #[test]
    fn test_double_start_fails() {
        let (endpoint, _) = started_endpoint();
        assert!(matches!(
            endpoint.start(0),
            Err(MeshError::BindFailed(_))
        ));
        endpoint.stop();
    }

    #[test]
    fn test_stop_idempotent() {
        let (endpoint, _) = started_endpoint();
        endpoint.stop();
        endpoint.stop();
    }

    #[test]
    fn test_send_message_assigns_monotonic_sequences() {
        let (a, _) = started_endpoint();
        let (b, b_port) = started_endpoint();

        let dest = b.node_id();
        for expected_seq in 0..5u16 {
            let seq_num = a
                .send_message(dest, "127.0.0.1", b_port, 1, vec![0x90, 0x3C, 0x64])
                .expect("send should succeed");
            assert_eq!(seq_num, expected_seq);
        }

        // A different destination has its own counter.
        let other = NodeId::generate();
        let seq_num = a
            .send_message(other, "127.0.0.1", b_port, 1, vec![0x80, 0x3C, 0x00])
            .expect("send should succeed");
        assert_eq!(seq_num, 0);

        a.stop();
        b.stop();
    }

    #[test]
    fn test_loopback_delivery() {
        let (a, _) = started_endpoint();
        let (b, b_port) = started_endpoint();

        let (tx, rx) = mpsc::channel();
        b.set_packet_handler(Box::new(move |packet, src| {
            let _ = tx.send((packet, src));
        }));

        a.send_message(b.node_id(), "127.0.0.1", b_port, 3, vec![0x90, 0x3C, 0x64])
            .expect("send should succeed");

        let (packet, _src) = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("packet should arrive on loopback");
        assert_eq!(packet.source_node, a.node_id());
        assert_eq!(packet.device_id, 3);
        assert_eq!(packet.sequence, 0);
        assert_eq!(packet.payload, vec![0x90, 0x3C, 0x64]);

        let stats = b.statistics();
        assert_eq!(stats.packets_received, 1);
        assert!(stats.bytes_received > 0);

        a.stop();
        b.stop();
    }

    #[test]
    fn test_garbage_datagram_counted_not_dispatched() {
        let (endpoint, port) = started_endpoint();

        let (tx, rx) = mpsc::channel();
        endpoint.set_packet_handler(Box::new(move |packet, _| {
            let _ = tx.send(packet);
        }));

        let probe = UdpSocket::bind("127.0.0.1:0").expect("probe socket");
        probe
            .send_to(b"not a mesh packet", ("127.0.0.1", port))
            .expect("probe send");

        assert!(
            rx.recv_timeout(Duration::from_millis(500)).is_err(),
            "garbage must not reach the handler"
        );
        assert_eq!(endpoint.statistics().parse_failures, 1);
        endpoint.stop();
    }

    #[test]
    fn test_corrupted_packet_counts_checksum_failure() {
        let (endpoint, port) = started_endpoint();

        let mut bytes = Packet::data(
            NodeId::generate(),
            endpoint.node_id(),
            1,
            0,
            vec![0x90, 0x3C, 0x64],
        )
        .serialize()
        .expect("serialize should succeed");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        let probe = UdpSocket::bind("127.0.0.1:0").expect("probe socket");
        probe
            .send_to(&bytes, ("127.0.0.1", port))
            .expect("probe send");

        // Give the receive loop a moment.
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(endpoint.statistics().checksum_failures, 1);
        endpoint.stop();
    }

    #[test]
    fn test_send_without_start_fails() {
        let endpoint = UdpEndpoint::new(NodeId::generate());
        let packet = Packet::heartbeat(endpoint.node_id(), NodeId::generate());
        let err = endpoint
            .send_raw(&packet, "127.0.0.1:1".parse().expect("literal addr"))
            .unwrap_err();
        assert!(matches!(err, MeshError::NotStarted));
    }

    #[test]
    fn test_stop_start_resets_counters() {
        let (a, _) = started_endpoint();
        let (b, b_port) = started_endpoint();

        a.send_message(b.node_id(), "127.0.0.1", b_port, 1, vec![0xF8])
            .expect("send should succeed");
        assert_eq!(a.statistics().packets_sent, 1);

        a.stop();
        a.start(0).expect("restart should succeed");
        assert_eq!(a.statistics(), EndpointStats::default());

        // Sequence counters reset too: first send is sequence 0 again.
        let seq_num = a
            .send_message(b.node_id(), "127.0.0.1", b_port, 1, vec![0xF8])
            .expect("send should succeed");
        assert_eq!(seq_num, 0);

        a.stop();
        b.stop();
    }
}
