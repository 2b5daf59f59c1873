// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mesh core: wires the endpoint, reliability, reordering, and discovery
//! into the surface the mesh manager consumes.
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                        MeshCore                              |
//! |                                                              |
//! |  send() --> router --> endpoint ----------------> UDP        |
//! |                 \--> reliable sender (RELIABLE)              |
//! |                                                              |
//! |  UDP --> endpoint --> dispatch:                              |
//! |            ACK/NAK  --> reliable sender                      |
//! |            DATA     --> auto-ACK --> reorder --> receive_fn  |
//! |            HEARTBEAT--> session liveness                     |
//! |            HANDSHAKE--> handshake handler (overlay)          |
//! |                                                              |
//! |  mDNS + fallback --> dedup by NodeId --> peer events         |
//! +--------------------------------------------------------------+
//! ```
//!
//! Receive-side callbacks run on the endpoint's receive thread;
//! reliability outcomes on the retry thread; peer events on the emitting
//! discovery backend's thread. None of them may block.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::MeshConfig;
use crate::core::{DeviceId, MeshError, NodeId};
use crate::discovery::{
    Discovery, FallbackDiscovery, MdnsDiscovery, PeerRecord,
};
use crate::protocol::{Packet, PacketKind};
use crate::reliability::{FailureFn, ReliableSender, ReorderBuffer, SuccessFn, TransmitFn};
use crate::transport::{EndpointStats, UdpEndpoint};

/// Maintenance tick driving heartbeats and coalesced ACK flushes.
const MAINTENANCE_TICK: Duration = Duration::from_millis(50);

/// External router collaborator: maps a destination to its transport
/// endpoint.
pub trait PeerRouter: Send + Sync {
    /// Transport endpoint (host, UDP port) of the node owning the device,
    /// or `None` when unknown.
    fn route(&self, dest_node: NodeId, device_id: DeviceId) -> Option<(String, u16)>;
}

/// Ordered-delivery callback: `(source_node, device_id, midi_bytes)`.
pub type ReceiveFn = Box<dyn Fn(NodeId, DeviceId, Vec<u8>) + Send + Sync>;

/// Peer appeared callback.
pub type PeerAppearedFn = Box<dyn Fn(PeerRecord) + Send + Sync>;

/// Peer disappeared callback.
pub type PeerDisappearedFn = Box<dyn Fn(NodeId) + Send + Sync>;

/// Handshake overlay callback: `(source_node, payload, source_addr)`.
pub type HandshakeFn = Box<dyn Fn(NodeId, Vec<u8>, SocketAddr) + Send + Sync>;

/// Union of all subsystem statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeshStats {
    /// Datagram endpoint counters.
    pub endpoint: EndpointStats,
    /// Reliable packets sent.
    pub reliable_sent: u64,
    /// Retransmissions.
    pub retransmissions: u64,
    /// ACKs matched to pending sends.
    pub acks_received: u64,
    /// Reliable sends that exhausted their attempts.
    pub reliable_timeouts: u64,
    /// Reliable sends still in flight.
    pub reliable_pending: usize,
    /// Packets delivered in order.
    pub delivered_in_order: u64,
    /// Reorder buffer high-water mark.
    pub reorder_buffered_peak: u64,
    /// Buffered entries lost to forced advances.
    pub gap_forced_drops: u64,
    /// Reorder evictions under capacity pressure.
    pub capacity_drops: u64,
    /// Duplicates dropped by the reorder buffer.
    pub duplicates_dropped: u64,
    /// Fallback announcements transmitted.
    pub announcements_sent: u64,
    /// Fallback announcements received.
    pub announcements_received: u64,
    /// Peer-appeared events emitted (after dedup).
    pub peers_appeared: u64,
    /// Peer-disappeared events emitted (after dedup).
    pub peers_disappeared: u64,
    /// Session heartbeats transmitted.
    pub heartbeats_sent: u64,
    /// Session heartbeats received.
    pub heartbeats_received: u64,
    /// ACKs transmitted for inbound reliable DATA.
    pub acks_sent: u64,
}

/// Engine-local counters.
#[derive(Debug, Default)]
struct EngineMetrics {
    heartbeats_sent: AtomicU64,
    heartbeats_received: AtomicU64,
    acks_sent: AtomicU64,
    peers_appeared: AtomicU64,
    peers_disappeared: AtomicU64,
}

impl EngineMetrics {
    fn reset(&self) {
        self.heartbeats_sent.store(0, Ordering::Relaxed);
        self.heartbeats_received.store(0, Ordering::Relaxed);
        self.acks_sent.store(0, Ordering::Relaxed);
        self.peers_appeared.store(0, Ordering::Relaxed);
        self.peers_disappeared.store(0, Ordering::Relaxed);
    }
}

/// A peer this node exchanges traffic with.
struct SessionPeer {
    addr: SocketAddr,
    last_heard: Instant,
}

/// Subsystems that exist only while the core is started.
struct Running {
    reliable: Arc<ReliableSender>,
    maintenance: Option<JoinHandle<()>>,
}

/// The transport/discovery substrate behind one mesh node.
///
/// Self-contained: several cores may coexist in one process, each with
/// its own socket, threads, and discovery instances.
pub struct MeshCore {
    config: MeshConfig,
    node_id: NodeId,
    endpoint: Arc<UdpEndpoint>,
    router: Arc<dyn PeerRouter>,
    fallback: Arc<FallbackDiscovery>,
    mdns: Arc<MdnsDiscovery>,
    receive_fn: Arc<ArcSwapOption<ReceiveFn>>,
    handshake_fn: Arc<ArcSwapOption<HandshakeFn>>,
    peer_appeared_fn: Arc<ArcSwapOption<PeerAppearedFn>>,
    peer_disappeared_fn: Arc<ArcSwapOption<PeerDisappearedFn>>,
    /// Peers visible to either discovery mechanism, deduplicated.
    known_peers: Arc<Mutex<HashSet<NodeId>>>,
    /// Peers with live traffic, targeted by session heartbeats.
    session_peers: Arc<DashMap<NodeId, SessionPeer>>,
    /// Reorder buffer for the current run; callbacks hold this handle so
    /// peer removal can reset a source stream.
    reorder: Arc<ArcSwapOption<ReorderBuffer>>,
    /// Coalesced ACKs waiting for their window to elapse.
    pending_acks: Arc<Mutex<Vec<(Packet, SocketAddr, Instant)>>>,
    metrics: Arc<EngineMetrics>,
    running: Arc<AtomicBool>,
    state: Mutex<Option<Running>>,
}

impl MeshCore {
    /// Build an unstarted core with a freshly generated node id.
    #[must_use]
    pub fn new(config: MeshConfig, router: Arc<dyn PeerRouter>) -> Self {
        let node_id = NodeId::generate();
        Self {
            endpoint: Arc::new(UdpEndpoint::new(node_id)),
            fallback: Arc::new(FallbackDiscovery::new(node_id, config.discovery.clone())),
            mdns: Arc::new(MdnsDiscovery::new(node_id, config.discovery.clone())),
            config,
            node_id,
            router,
            receive_fn: Arc::new(ArcSwapOption::from(None)),
            handshake_fn: Arc::new(ArcSwapOption::from(None)),
            peer_appeared_fn: Arc::new(ArcSwapOption::from(None)),
            peer_disappeared_fn: Arc::new(ArcSwapOption::from(None)),
            known_peers: Arc::new(Mutex::new(HashSet::new())),
            session_peers: Arc::new(DashMap::new()),
            reorder: Arc::new(ArcSwapOption::from(None)),
            pending_acks: Arc::new(Mutex::new(Vec::new())),
            metrics: Arc::new(EngineMetrics::default()),
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(None),
        }
    }

    /// This node's id.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Register the ordered-delivery callback.
    pub fn register_receive(&self, receive: ReceiveFn) {
        self.receive_fn.store(Some(Arc::new(receive)));
    }

    /// Register the handshake overlay callback.
    pub fn register_handshake(&self, handshake: HandshakeFn) {
        self.handshake_fn.store(Some(Arc::new(handshake)));
    }

    /// Register peer lifecycle callbacks (deduplicated across both
    /// discovery mechanisms).
    pub fn register_peer_events(
        &self,
        on_appeared: PeerAppearedFn,
        on_disappeared: PeerDisappearedFn,
    ) {
        self.peer_appeared_fn.store(Some(Arc::new(on_appeared)));
        self.peer_disappeared_fn
            .store(Some(Arc::new(on_disappeared)));
    }

    /// Bind the endpoint, spin up reliability and reordering, start both
    /// discovery mechanisms, and begin heartbeating. Returns the bound
    /// UDP port.
    ///
    /// Discovery backends that cannot start are logged and skipped; one
    /// failing never blocks the other, and the data plane works without
    /// either.
    pub fn start(&self, udp_port: u16) -> Result<u16, MeshError> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Err(MeshError::BindFailed(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "core already started",
            )));
        }

        let bound = self.endpoint.start(udp_port)?;
        self.running.store(true, Ordering::Relaxed);
        self.known_peers.lock().clear();
        self.session_peers.clear();
        self.pending_acks.lock().clear();
        self.metrics.reset();
        self.fallback.metrics().reset();

        // Reliability: retransmits go through the endpoint unchanged.
        let transmit: TransmitFn = {
            let endpoint = Arc::clone(&self.endpoint);
            Arc::new(move |packet, addr| endpoint.send_raw(packet, addr))
        };
        let reliable = Arc::new(
            ReliableSender::new(self.config.reliability.clone(), transmit)
                .map_err(MeshError::BindFailed)?,
        );

        // Ordered delivery into the registered receive callback.
        let reorder = {
            let receive_fn = Arc::clone(&self.receive_fn);
            Arc::new(ReorderBuffer::new(
                self.config.reorder.clone(),
                Arc::new(move |packet: Packet| {
                    if let Some(receive) = receive_fn.load_full() {
                        receive(packet.source_node, packet.device_id, packet.payload);
                    }
                }),
            ))
        };
        self.reorder.store(Some(Arc::clone(&reorder)));

        // Receive dispatch: the endpoint thread drives everything below.
        self.endpoint.set_packet_handler({
            let core_node = self.node_id;
            let endpoint = Arc::clone(&self.endpoint);
            let reliable = Arc::clone(&reliable);
            let reorder = Arc::clone(&reorder);
            let session_peers = Arc::clone(&self.session_peers);
            let pending_acks = Arc::clone(&self.pending_acks);
            let handshake_fn = Arc::clone(&self.handshake_fn);
            let metrics = Arc::clone(&self.metrics);
            let ack_window = self.config.reliability.ack_coalescing_window;
            Box::new(move |packet, src| {
                Self::dispatch(
                    &packet,
                    src,
                    core_node,
                    &endpoint,
                    &reliable,
                    &reorder,
                    &session_peers,
                    &pending_acks,
                    &handshake_fn,
                    &metrics,
                    ack_window,
                );
            })
        });

        // Discovery: both mechanisms, independently fallible.
        self.start_discovery();

        // Maintenance thread: heartbeats, coalesced ACKs, session prune.
        let maintenance = {
            let endpoint = Arc::clone(&self.endpoint);
            let session_peers = Arc::clone(&self.session_peers);
            let pending_acks = Arc::clone(&self.pending_acks);
            let metrics = Arc::clone(&self.metrics);
            let running = Arc::clone(&self.running);
            let node_id = self.node_id;
            let heartbeat_interval = self.config.heartbeat_interval;
            let liveness = self.config.discovery.liveness_timeout;
            std::thread::Builder::new()
                .name("midimesh-heartbeat".to_string())
                .spawn(move || {
                    Self::maintenance_loop(
                        &endpoint,
                        &session_peers,
                        &pending_acks,
                        &metrics,
                        &running,
                        node_id,
                        heartbeat_interval,
                        liveness,
                    );
                })
                .map_err(MeshError::BindFailed)?
        };

        *state = Some(Running {
            reliable,
            maintenance: Some(maintenance),
        });
        log::info!("[MESH] core started node={} udp_port={}", self.node_id, bound);
        Ok(bound)
    }

    /// Stop everything: discovery first, then reliability (canceling
    /// pending sends), then the maintenance and receive threads. No
    /// callback fires after this returns. Idempotent.
    pub fn stop(&self) {
        let state = self.state.lock().take();
        self.running.store(false, Ordering::Relaxed);

        self.mdns.stop_advertising();
        self.mdns.stop_browsing();
        self.fallback.stop_advertising();
        self.fallback.stop_browsing();

        if let Some(mut running) = state {
            running.reliable.stop();
            if let Some(handle) = running.maintenance.take() {
                let _ = handle.join();
            }
        }
        self.reorder.store(None);
        self.endpoint.stop();
        log::info!("[MESH] core stopped node={}", self.node_id);
    }

    /// Send MIDI bytes to a device on a peer node. Returns the assigned
    /// sequence.
    ///
    /// Unreliable sends are fire-and-forget; reliable sends log their
    /// outcome. Use [`send_reliable_with`] to observe the outcome.
    ///
    /// [`send_reliable_with`]: MeshCore::send_reliable_with
    pub fn send(
        &self,
        dest_node: NodeId,
        device_id: DeviceId,
        midi: Vec<u8>,
        reliable: bool,
    ) -> Result<u16, MeshError> {
        if !reliable {
            let (host, port) = self
                .router
                .route(dest_node, device_id)
                .ok_or(MeshError::NoRoute(dest_node))?;
            return self
                .endpoint
                .send_message(dest_node, &host, port, device_id, midi);
        }

        self.send_reliable_with(
            dest_node,
            device_id,
            midi,
            Box::new(|| {}),
            Box::new(move |reason| {
                log::debug!("[MESH] reliable send to {} failed: {}", dest_node, reason);
            }),
        )
    }

    /// Reliable send with explicit outcome callbacks. Exactly one of the
    /// callbacks fires, on the retry thread.
    pub fn send_reliable_with(
        &self,
        dest_node: NodeId,
        device_id: DeviceId,
        midi: Vec<u8>,
        on_success: SuccessFn,
        on_failure: FailureFn,
    ) -> Result<u16, MeshError> {
        let reliable = {
            let state = self.state.lock();
            let Some(running) = state.as_ref() else {
                return Err(MeshError::NotStarted);
            };
            Arc::clone(&running.reliable)
        };

        let (host, port) = self
            .router
            .route(dest_node, device_id)
            .ok_or(MeshError::NoRoute(dest_node))?;
        let addr = crate::transport::endpoint::resolve(&host, port)?;

        let seq_num = self.endpoint.next_sequence(dest_node);
        let mut packet = Packet::data(self.node_id, dest_node, device_id, seq_num, midi);
        packet.set_reliable(true);
        reliable.send_reliable(packet, addr, on_success, on_failure)?;
        Ok(seq_num)
    }

    /// Update the device count both discovery mechanisms advertise.
    pub fn update_device_count(&self, devices: u16) {
        self.fallback.update_device_count(devices);
        self.mdns.update_device_count(devices);
    }

    /// Currently known live peers (fallback table).
    #[must_use]
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.fallback.peers()
    }

    /// Union of all subsystem statistics.
    #[must_use]
    pub fn statistics(&self) -> MeshStats {
        let mut stats = MeshStats {
            endpoint: self.endpoint.statistics(),
            ..MeshStats::default()
        };

        if let Some(running) = self.state.lock().as_ref() {
            let (sent, retrans, acked, _ignored, timeouts, _canceled) =
                running.reliable.metrics().snapshot();
            stats.reliable_sent = sent;
            stats.retransmissions = retrans;
            stats.acks_received = acked;
            stats.reliable_timeouts = timeouts;
            stats.reliable_pending = running.reliable.pending_count();
        }

        if let Some(reorder) = self.reorder.load_full() {
            let (delivered, peak, gaps, capacity, duplicates) = reorder.metrics().snapshot();
            stats.delivered_in_order = delivered;
            stats.reorder_buffered_peak = peak;
            stats.gap_forced_drops = gaps;
            stats.capacity_drops = capacity;
            stats.duplicates_dropped = duplicates;
        }

        let (announced, received, _discovered, _removed) = self.fallback.metrics().snapshot();
        stats.announcements_sent = announced;
        stats.announcements_received = received;
        stats.peers_appeared = self.metrics.peers_appeared.load(Ordering::Relaxed);
        stats.peers_disappeared = self.metrics.peers_disappeared.load(Ordering::Relaxed);
        stats.heartbeats_sent = self.metrics.heartbeats_sent.load(Ordering::Relaxed);
        stats.heartbeats_received = self.metrics.heartbeats_received.load(Ordering::Relaxed);
        stats.acks_sent = self.metrics.acks_sent.load(Ordering::Relaxed);
        stats
    }

    /// Start both discovery mechanisms, tolerating individual failures.
    fn start_discovery(&self) {
        let on_discovered = self.peer_event_discovered();
        let on_removed = self.peer_event_removed();

        if let Err(e) = self.fallback.start_advertising() {
            log::debug!("[MESH] fallback advertising unavailable: {}", e);
        }
        if let Err(e) = self.fallback.start_browsing(
            Arc::clone(&on_discovered),
            Arc::clone(&on_removed),
        ) {
            log::debug!("[MESH] fallback browsing unavailable: {}", e);
        }
        if let Err(e) = self.mdns.start_advertising() {
            log::debug!("[MESH] mDNS advertising unavailable: {}", e);
        }
        if let Err(e) = self.mdns.start_browsing(on_discovered, on_removed) {
            log::debug!("[MESH] mDNS browsing unavailable: {}", e);
        }
    }

    /// Discovery callback: dedup by node id, track the session peer, then
    /// forward to the registered handler.
    fn peer_event_discovered(&self) -> crate::discovery::DiscoveredFn {
        let known = Arc::clone(&self.known_peers);
        let session_peers = Arc::clone(&self.session_peers);
        let appeared = Arc::clone(&self.peer_appeared_fn);
        let metrics = Arc::clone(&self.metrics);
        Arc::new(move |peer: PeerRecord| {
            let is_new = known.lock().insert(peer.node_id);
            session_peers.insert(
                peer.node_id,
                SessionPeer {
                    addr: SocketAddr::new(peer.ip, peer.udp_port),
                    last_heard: Instant::now(),
                },
            );
            if is_new {
                metrics.peers_appeared.fetch_add(1, Ordering::Relaxed);
                if let Some(cb) = appeared.load_full() {
                    cb(peer);
                }
            }
        })
    }

    /// Discovery callback: dedup removals, drop session state, reset the
    /// peer's reorder stream, then forward.
    fn peer_event_removed(&self) -> crate::discovery::RemovedFn {
        let known = Arc::clone(&self.known_peers);
        let session_peers = Arc::clone(&self.session_peers);
        let disappeared = Arc::clone(&self.peer_disappeared_fn);
        let metrics = Arc::clone(&self.metrics);
        let reorder = Arc::clone(&self.reorder);
        Arc::new(move |node_id: NodeId| {
            let was_known = known.lock().remove(&node_id);
            session_peers.remove(&node_id);
            if let Some(buffer) = reorder.load_full() {
                buffer.reset(&node_id);
            }
            if was_known {
                metrics.peers_disappeared.fetch_add(1, Ordering::Relaxed);
                if let Some(cb) = disappeared.load_full() {
                    cb(node_id);
                }
            }
        })
    }

    /// Receive-side demultiplexer, run on the endpoint's receive thread.
    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        packet: &Packet,
        src: SocketAddr,
        core_node: NodeId,
        endpoint: &Arc<UdpEndpoint>,
        reliable: &Arc<ReliableSender>,
        reorder: &Arc<ReorderBuffer>,
        session_peers: &DashMap<NodeId, SessionPeer>,
        pending_acks: &Mutex<Vec<(Packet, SocketAddr, Instant)>>,
        handshake_fn: &ArcSwapOption<HandshakeFn>,
        metrics: &EngineMetrics,
        ack_window: Duration,
    ) {
        // Anything addressed to another node is not ours to act on.
        if !packet.dest_node.is_broadcast() && packet.dest_node != core_node {
            log::debug!(
                "[MESH] ignoring packet for {} (we are {})",
                packet.dest_node,
                core_node
            );
            return;
        }

        // Any traffic from a peer refreshes its session liveness.
        if let Some(mut entry) = session_peers.get_mut(&packet.source_node) {
            entry.last_heard = Instant::now();
        }

        match packet.kind {
            PacketKind::Ack => reliable.on_ack_received(packet),
            PacketKind::Nak => reliable.on_nak_received(packet),
            PacketKind::Heartbeat => {
                metrics.heartbeats_received.fetch_add(1, Ordering::Relaxed);
            }
            PacketKind::Handshake => {
                if let Some(cb) = handshake_fn.load_full() {
                    cb(packet.source_node, packet.payload.clone(), src);
                }
            }
            PacketKind::Data => {
                if packet.is_reliable() {
                    let ack = Packet::ack(
                        core_node,
                        packet.source_node,
                        packet.sequence,
                        packet.device_id,
                    );
                    if ack_window.is_zero() {
                        if endpoint.send_raw(&ack, src).is_ok() {
                            metrics.acks_sent.fetch_add(1, Ordering::Relaxed);
                        }
                    } else {
                        pending_acks
                            .lock()
                            .push((ack, src, Instant::now() + ack_window));
                    }
                }
                reorder.add_packet(packet.clone());
            }
        }
    }

    /// Heartbeat + coalesced-ACK + session-prune loop.
    #[allow(clippy::too_many_arguments)]
    fn maintenance_loop(
        endpoint: &Arc<UdpEndpoint>,
        session_peers: &DashMap<NodeId, SessionPeer>,
        pending_acks: &Mutex<Vec<(Packet, SocketAddr, Instant)>>,
        metrics: &EngineMetrics,
        running: &AtomicBool,
        node_id: NodeId,
        heartbeat_interval: Duration,
        liveness: Duration,
    ) {
        let mut next_heartbeat = Instant::now() + heartbeat_interval;
        while running.load(Ordering::Relaxed) {
            std::thread::sleep(MAINTENANCE_TICK);
            if !running.load(Ordering::Relaxed) {
                break;
            }
            let now = Instant::now();

            // Flush coalesced ACKs whose window elapsed.
            let due: Vec<(Packet, SocketAddr)> = {
                let mut queue = pending_acks.lock();
                let mut flushed = Vec::new();
                queue.retain(|(ack, addr, deadline)| {
                    if *deadline <= now {
                        flushed.push((ack.clone(), *addr));
                        false
                    } else {
                        true
                    }
                });
                flushed
            };
            for (ack, addr) in due {
                if endpoint.send_raw(&ack, addr).is_ok() {
                    metrics.acks_sent.fetch_add(1, Ordering::Relaxed);
                }
            }

            if now < next_heartbeat {
                continue;
            }
            next_heartbeat = now + heartbeat_interval;

            // Heartbeat every live session peer; prune the silent ones.
            let mut stale: Vec<NodeId> = Vec::new();
            for entry in session_peers.iter() {
                if now.duration_since(entry.value().last_heard) > liveness {
                    stale.push(*entry.key());
                    continue;
                }
                let hb = Packet::heartbeat(node_id, *entry.key());
                if endpoint.send_raw(&hb, entry.value().addr).is_ok() {
                    metrics.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
                }
            }
            for node in stale {
                session_peers.remove(&node);
            }
        }
    }
}

impl Drop for MeshCore {
    fn drop(&mut self) {
        self.stop();
    }
}
