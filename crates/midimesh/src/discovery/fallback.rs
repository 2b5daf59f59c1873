// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP-multicast fallback discovery with timeout-based liveness.
//!
//! Three background roles, each its own thread:
//!
//! - **announce**: JSON announcements to the multicast group on a fixed
//!   period (default 5 s).
//! - **listen**: joins the group, parses announcements, filters self,
//!   creates or refreshes peer records, emits `on_discovered`.
//! - **lease scan**: 1 Hz sweep; a peer silent past `liveness_timeout`
//!   (default 3 periods) is removed and `on_removed` fires.
//!
//! Callback invocations are serialized under one mutex, so the listen and
//! lease threads never run a callback concurrently.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::config::{DiscoveryConfig, FALLBACK_MULTICAST_GROUP, PROTOCOL_VERSION};
use crate::core::{MeshError, NodeId};
use crate::transport::iface;

use super::{Announcement, DiscoveredFn, Discovery, PeerRecord, RemovedFn};

/// Lease sweep rate.
const LEASE_SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Receive poll interval; shutdown is observed between reads.
const LISTEN_TIMEOUT: Duration = Duration::from_millis(500);

/// Sleep slice for periodic threads so stop stays responsive.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Fallback discovery counters.
#[derive(Debug, Default)]
pub struct FallbackMetrics {
    /// Announcements transmitted.
    pub announcements_sent: AtomicU64,
    /// Valid announcements received (self included).
    pub announcements_received: AtomicU64,
    /// `on_discovered` events emitted.
    pub peers_discovered: AtomicU64,
    /// `on_removed` events emitted by the lease scan.
    pub peers_removed: AtomicU64,
}

impl FallbackMetrics {
    /// Snapshot: (sent, received, discovered, removed).
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.announcements_sent.load(Ordering::Relaxed),
            self.announcements_received.load(Ordering::Relaxed),
            self.peers_discovered.load(Ordering::Relaxed),
            self.peers_removed.load(Ordering::Relaxed),
        )
    }

    /// Zero every counter (stop-start cycle).
    pub fn reset(&self) {
        self.announcements_sent.store(0, Ordering::Relaxed);
        self.announcements_received.store(0, Ordering::Relaxed);
        self.peers_discovered.store(0, Ordering::Relaxed);
        self.peers_removed.store(0, Ordering::Relaxed);
    }
}

/// Registered browse callbacks; held while invoking so events serialize.
type Callbacks = Mutex<Option<(DiscoveredFn, RemovedFn)>>;

/// UDP-multicast fallback backend.
pub struct FallbackDiscovery {
    config: DiscoveryConfig,
    node_id: NodeId,
    group: Ipv4Addr,
    device_count: Arc<AtomicU16>,
    peers: Arc<RwLock<HashMap<NodeId, PeerRecord>>>,
    callbacks: Arc<Callbacks>,
    metrics: Arc<FallbackMetrics>,
    advertising: Arc<AtomicBool>,
    browsing: Arc<AtomicBool>,
    announce_handle: Mutex<Option<JoinHandle<()>>>,
    listen_handle: Mutex<Option<JoinHandle<()>>>,
    lease_handle: Mutex<Option<JoinHandle<()>>>,
}

impl FallbackDiscovery {
    /// Backend for the given local node.
    #[must_use]
    pub fn new(node_id: NodeId, config: DiscoveryConfig) -> Self {
        let group = FALLBACK_MULTICAST_GROUP
            .parse()
            .unwrap_or(Ipv4Addr::new(239, 255, 42, 99));
        Self {
            config,
            node_id,
            group,
            device_count: Arc::new(AtomicU16::new(0)),
            peers: Arc::new(RwLock::new(HashMap::new())),
            callbacks: Arc::new(Mutex::new(None)),
            metrics: Arc::new(FallbackMetrics::default()),
            advertising: Arc::new(AtomicBool::new(false)),
            browsing: Arc::new(AtomicBool::new(false)),
            announce_handle: Mutex::new(None),
            listen_handle: Mutex::new(None),
            lease_handle: Mutex::new(None),
        }
    }

    /// Shared metrics handle.
    #[must_use]
    pub fn metrics(&self) -> Arc<FallbackMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Currently known live peers.
    #[must_use]
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers.read().values().cloned().collect()
    }

    /// Sleep `total` in slices, bailing out early once `flag` clears.
    fn interruptible_sleep(total: Duration, flag: &AtomicBool) {
        let deadline = Instant::now() + total;
        while flag.load(Ordering::Relaxed) && Instant::now() < deadline {
            std::thread::sleep(SLEEP_SLICE.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    fn announce_loop(
        socket: &UdpSocket,
        dest: SocketAddr,
        node_id: NodeId,
        config: &DiscoveryConfig,
        device_count: &AtomicU16,
        metrics: &FallbackMetrics,
        advertising: &AtomicBool,
    ) {
        while advertising.load(Ordering::Relaxed) {
            let record =
                build_announcement(node_id, config, device_count.load(Ordering::Relaxed));
            match socket.send_to(&record.to_json(), dest) {
                Ok(_) => {
                    metrics.announcements_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    log::debug!("[DISCOVERY] announce send failed: {}", e);
                }
            }
            Self::interruptible_sleep(config.announce_interval, advertising);
        }
    }

    fn listen_loop(
        socket: &UdpSocket,
        node_id: NodeId,
        peers: &RwLock<HashMap<NodeId, PeerRecord>>,
        callbacks: &Callbacks,
        metrics: &FallbackMetrics,
        browsing: &AtomicBool,
    ) {
        let mut buf = [0u8; 1024];
        while browsing.load(Ordering::Relaxed) {
            let (len, src) = match socket.recv_from(&mut buf) {
                Ok(pair) => pair,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    if browsing.load(Ordering::Relaxed) {
                        log::debug!("[DISCOVERY] listen recv error: {}", e);
                    }
                    continue;
                }
            };

            let Some(record) = Announcement::from_json(&buf[..len]) else {
                continue;
            };
            metrics
                .announcements_received
                .fetch_add(1, Ordering::Relaxed);

            let Some(peer) = record.to_peer_record(src.ip()) else {
                continue;
            };
            if peer.node_id == node_id {
                continue; // self-announcement
            }

            let is_new = {
                let mut table = peers.write();
                table.insert(peer.node_id, peer.clone()).is_none()
            };

            if is_new {
                log::debug!(
                    "[DISCOVERY] peer appeared node={} name={} addr={}",
                    peer.node_id,
                    peer.name,
                    src
                );
                metrics.peers_discovered.fetch_add(1, Ordering::Relaxed);
                let guard = callbacks.lock();
                if let Some((on_discovered, _)) = guard.as_ref() {
                    on_discovered(peer);
                }
            }
        }
    }

    fn lease_loop(
        liveness_timeout: Duration,
        peers: &RwLock<HashMap<NodeId, PeerRecord>>,
        callbacks: &Callbacks,
        metrics: &FallbackMetrics,
        browsing: &AtomicBool,
    ) {
        while browsing.load(Ordering::Relaxed) {
            Self::interruptible_sleep(LEASE_SCAN_INTERVAL, browsing);
            if !browsing.load(Ordering::Relaxed) {
                break;
            }

            let now = Instant::now();
            let expired: Vec<NodeId> = {
                let table = peers.read();
                table
                    .iter()
                    .filter(|(_, p)| now.duration_since(p.last_seen) > liveness_timeout)
                    .map(|(id, _)| *id)
                    .collect()
            };

            if expired.is_empty() {
                continue;
            }

            {
                let mut table = peers.write();
                for id in &expired {
                    table.remove(id);
                }
            }

            for id in expired {
                log::debug!("[DISCOVERY] peer expired node={}", id);
                metrics.peers_removed.fetch_add(1, Ordering::Relaxed);
                let guard = callbacks.lock();
                if let Some((_, on_removed)) = guard.as_ref() {
                    on_removed(id);
                }
            }
        }
    }
}

impl Discovery for FallbackDiscovery {
    fn start_advertising(&self) -> Result<(), MeshError> {
        if self.advertising.swap(true, Ordering::Relaxed) {
            return Ok(()); // already running
        }

        let socket = iface::announce_socket(iface::primary_interface_ip()).map_err(|e| {
            self.advertising.store(false, Ordering::Relaxed);
            MeshError::DiscoveryBackendUnavailable(e.to_string())
        })?;
        let dest = SocketAddr::from((self.group, self.config.multicast_port));

        let handle = {
            let node_id = self.node_id;
            let config = self.config.clone();
            let device_count = Arc::clone(&self.device_count);
            let metrics = Arc::clone(&self.metrics);
            let advertising = Arc::clone(&self.advertising);
            std::thread::Builder::new()
                .name("midimesh-announce".to_string())
                .spawn(move || {
                    Self::announce_loop(
                        &socket,
                        dest,
                        node_id,
                        &config,
                        &device_count,
                        &metrics,
                        &advertising,
                    );
                })
                .map_err(|e| MeshError::DiscoveryBackendUnavailable(e.to_string()))?
        };
        *self.announce_handle.lock() = Some(handle);
        log::debug!(
            "[DISCOVERY] fallback advertising to {}:{} every {:?}",
            self.group,
            self.config.multicast_port,
            self.config.announce_interval
        );
        Ok(())
    }

    fn stop_advertising(&self) {
        self.advertising.store(false, Ordering::Relaxed);
        if let Some(handle) = self.announce_handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn start_browsing(
        &self,
        on_discovered: DiscoveredFn,
        on_removed: RemovedFn,
    ) -> Result<(), MeshError> {
        if self.browsing.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        *self.callbacks.lock() = Some((on_discovered, on_removed));

        let socket =
            iface::listener_socket(self.group, self.config.multicast_port).map_err(|e| {
                self.browsing.store(false, Ordering::Relaxed);
                MeshError::DiscoveryBackendUnavailable(e.to_string())
            })?;
        socket
            .set_read_timeout(Some(LISTEN_TIMEOUT))
            .map_err(|e| MeshError::DiscoveryBackendUnavailable(e.to_string()))?;

        let listen_handle = {
            let node_id = self.node_id;
            let peers = Arc::clone(&self.peers);
            let callbacks = Arc::clone(&self.callbacks);
            let metrics = Arc::clone(&self.metrics);
            let browsing = Arc::clone(&self.browsing);
            std::thread::Builder::new()
                .name("midimesh-disc-rx".to_string())
                .spawn(move || {
                    Self::listen_loop(&socket, node_id, &peers, &callbacks, &metrics, &browsing);
                })
                .map_err(|e| MeshError::DiscoveryBackendUnavailable(e.to_string()))?
        };

        let lease_handle = {
            let liveness = self.config.liveness_timeout;
            let peers = Arc::clone(&self.peers);
            let callbacks = Arc::clone(&self.callbacks);
            let metrics = Arc::clone(&self.metrics);
            let browsing = Arc::clone(&self.browsing);
            std::thread::Builder::new()
                .name("midimesh-lease".to_string())
                .spawn(move || {
                    Self::lease_loop(liveness, &peers, &callbacks, &metrics, &browsing);
                })
                .map_err(|e| MeshError::DiscoveryBackendUnavailable(e.to_string()))?
        };

        *self.listen_handle.lock() = Some(listen_handle);
        *self.lease_handle.lock() = Some(lease_handle);
        log::debug!(
            "[DISCOVERY] fallback browsing {}:{} liveness={:?}",
            self.group,
            self.config.multicast_port,
            self.config.liveness_timeout
        );
        Ok(())
    }

    fn stop_browsing(&self) {
        self.browsing.store(false, Ordering::Relaxed);
        if let Some(handle) = self.listen_handle.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.lease_handle.lock().take() {
            let _ = handle.join();
        }
        *self.callbacks.lock() = None;
        self.peers.write().clear();
    }

    fn update_device_count(&self, devices: u16) {
        self.device_count.store(devices, Ordering::Relaxed);
    }
}

impl Drop for FallbackDiscovery {
    fn drop(&mut self) {
        self.stop_advertising();
        self.stop_browsing();
    }
}

/// The announcement this node would transmit right now.
fn build_announcement(node_id: NodeId, config: &DiscoveryConfig, devices: u16) -> Announcement {
    Announcement {
        uuid: node_id.to_string(),
        name: config.node_name.clone(),
        hostname: iface::local_hostname(),
        http_port: config.http_port,
        udp_port: config.udp_port,
        version: PROTOCOL_VERSION,
        devices,
    }
}
