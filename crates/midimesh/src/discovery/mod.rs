// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Peer discovery
//!
//! Two independent mechanisms announce this node and learn about peers on
//! the local broadcast domain:
//!
//! | Backend | Use Case | Module |
//! |---------|----------|--------|
//! | **mDNS / DNS-SD** | Networks with working multicast DNS | [`mdns`] |
//! | **UDP multicast fallback** | mDNS filtered or unavailable | [`fallback`] |
//!
//! Both implement the [`Discovery`] trait, so the mesh manager registers
//! for events without knowing which mechanism produced them and
//! deduplicates by [`NodeId`]. Either or both may run; a failure to start
//! one never prevents the other from operating.
//!
//! Callbacks are serialized per mechanism: no concurrent invocation from
//! within one backend, a peer's first `on_discovered` precedes any
//! `on_removed`, and re-discovery after removal is a fresh
//! `on_discovered`. Discovery traffic is TTL-limited and never leaves the
//! subnet.

pub mod announcement;
pub mod fallback;
pub mod mdns;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::core::{MeshError, NodeId};

pub use announcement::Announcement;
pub use fallback::FallbackDiscovery;
pub use mdns::MdnsDiscovery;

/// Everything the mesh manager needs to open a session with a peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Peer node id (`uuid` in announcements).
    pub node_id: NodeId,
    /// Human-readable instance name.
    pub name: String,
    /// Announced hostname.
    pub hostname: String,
    /// Resolved address the announcement arrived from or resolved to.
    pub ip: IpAddr,
    /// Peer's HTTP control port.
    pub http_port: u16,
    /// Peer's UDP data port.
    pub udp_port: u16,
    /// Peer's protocol version.
    pub protocol_version: u8,
    /// Number of MIDI devices the peer exposes.
    pub device_count: u16,
    /// Wall-clock instant of the most recent announcement.
    pub last_seen: Instant,
}

/// Invoked when a peer first appears (or reappears after removal).
pub type DiscoveredFn = Arc<dyn Fn(PeerRecord) + Send + Sync>;

/// Invoked when a peer disappears.
pub type RemovedFn = Arc<dyn Fn(NodeId) + Send + Sync>;

/// Common capability of both discovery mechanisms.
pub trait Discovery {
    /// Begin announcing this node.
    fn start_advertising(&self) -> Result<(), MeshError>;

    /// Stop announcing. Idempotent.
    fn stop_advertising(&self);

    /// Begin watching for peers, reporting through the callbacks.
    fn start_browsing(
        &self,
        on_discovered: DiscoveredFn,
        on_removed: RemovedFn,
    ) -> Result<(), MeshError>;

    /// Stop watching. Idempotent; no callback fires after return.
    fn stop_browsing(&self);

    /// Update the advertised device count (visible in the next
    /// announcement or TXT refresh).
    fn update_device_count(&self, devices: u16);
}
