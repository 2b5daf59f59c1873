// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mesh-wide constants and runtime knobs - single source of truth.
//!
//! Level 1: compile-time constants (wire protocol, multicast group, mDNS
//! service type). Level 2: plain config structs with `Default` impls,
//! assembled into [`MeshConfig`] and handed to the subsystems at start.
//! Config-file loading is the caller's business, not ours.

use std::time::Duration;

// =======================================================================
// Wire protocol
// =======================================================================

/// Current packet protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Safe single-datagram payload ceiling (typical Ethernet MTU minus
/// IP/UDP overhead minus our header). Larger SysEx requires fragmentation,
/// which is reserved.
pub const MAX_PAYLOAD_LEN: usize = 1400;

// =======================================================================
// Discovery constants
// =======================================================================

/// mDNS service type advertised and browsed by every node.
pub const MDNS_SERVICE_TYPE: &str = "_midi-network._tcp.local.";

/// Fallback discovery multicast group (administratively scoped).
pub const FALLBACK_MULTICAST_GROUP: &str = "239.255.42.99";

/// Fallback discovery multicast port.
pub const FALLBACK_MULTICAST_PORT: u16 = 5353;

/// Default announcement period for the fallback mechanism.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);

/// A peer with no announcement for this many periods is deemed gone.
pub const DEFAULT_LIVENESS_PERIODS: u32 = 3;

// =======================================================================
// Reliability defaults
// =======================================================================

/// First retry deadline for a reliable send.
pub const DEFAULT_INITIAL_TIMEOUT: Duration = Duration::from_millis(100);

/// Transmission attempts (initial send included) before failure.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

// =======================================================================
// Reorder buffer defaults
// =======================================================================

/// Default reorder buffer capacity (entries per source).
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 64;

/// Default gap tolerance before forced advance.
pub const DEFAULT_MAX_SEQUENCE_GAP: u16 = 16;

/// Backoff policy for reliable retransmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same timeout for every attempt.
    Fixed,
    /// Timeout doubles on each attempt.
    Exponential,
    /// Doubles on each attempt but never exceeds the cap.
    Capped(Duration),
}

/// Reliability layer knobs (closed set, spec defaults).
#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    /// Deadline for the first retransmission.
    pub initial_timeout: Duration,
    /// Attempts before `on_failure("max_attempts_exceeded")`.
    pub max_attempts: u32,
    /// Retransmission backoff policy.
    pub backoff: Backoff,
    /// Delay before an inbound reliable DATA is acknowledged.
    /// Zero means immediate ACK.
    pub ack_coalescing_window: Duration,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        // Fixed backoff: worst-case failure latency is
        // max_attempts x initial_timeout.
        Self {
            initial_timeout: DEFAULT_INITIAL_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::Fixed,
            ack_coalescing_window: Duration::ZERO,
        }
    }
}

/// Reorder buffer knobs.
#[derive(Debug, Clone)]
pub struct ReorderConfig {
    /// Buffered entries per source before smallest-sequence eviction.
    pub max_buffer_size: usize,
    /// Missing-predecessor tolerance before forced advance.
    pub max_sequence_gap: u16,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            max_sequence_gap: DEFAULT_MAX_SEQUENCE_GAP,
        }
    }
}

/// Discovery knobs shared by both mechanisms.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Human-readable instance name carried in announcements.
    pub node_name: String,
    /// HTTP control port advertised to peers (served elsewhere).
    pub http_port: u16,
    /// UDP data port advertised to peers.
    pub udp_port: u16,
    /// Fallback announcement period.
    pub announce_interval: Duration,
    /// Silence threshold before a peer is declared gone.
    pub liveness_timeout: Duration,
    /// Fallback multicast port (tests override to avoid the well-known
    /// mDNS port).
    pub multicast_port: u16,
}

impl DiscoveryConfig {
    /// Config for a node advertising the given data port.
    #[must_use]
    pub fn new(node_name: impl Into<String>, http_port: u16, udp_port: u16) -> Self {
        Self {
            node_name: node_name.into(),
            http_port,
            udp_port,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            liveness_timeout: DEFAULT_ANNOUNCE_INTERVAL * DEFAULT_LIVENESS_PERIODS,
            multicast_port: FALLBACK_MULTICAST_PORT,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::new("midimesh-node", 0, 0)
    }
}

/// Aggregate configuration consumed by [`crate::engine::MeshCore`].
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Reliable send behavior.
    pub reliability: ReliabilityConfig,
    /// Ordered delivery behavior.
    pub reorder: ReorderConfig,
    /// Announcement and liveness behavior.
    pub discovery: DiscoveryConfig,
    /// Session heartbeat period (see engine docs).
    pub heartbeat_interval: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            reliability: ReliabilityConfig::default(),
            reorder: ReorderConfig::default(),
            discovery: DiscoveryConfig::default(),
            heartbeat_interval: Duration::from_secs(1),
        }
    }
}

impl MeshConfig {
    /// Defaults with a named node.
    #[must_use]
    pub fn named(node_name: impl Into<String>) -> Self {
        Self {
            discovery: DiscoveryConfig::new(node_name, 0, 0),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reliability_defaults_match_spec() {
        let cfg = ReliabilityConfig::default();
        assert_eq!(cfg.initial_timeout, Duration::from_millis(100));
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.backoff, Backoff::Fixed);
        assert_eq!(cfg.ack_coalescing_window, Duration::ZERO);
    }

    #[test]
    fn test_liveness_is_three_periods() {
        let cfg = DiscoveryConfig::new("n", 8080, 5004);
        assert_eq!(cfg.liveness_timeout, cfg.announce_interval * 3);
    }

    #[test]
    fn test_fallback_group_is_link_local_admin_scope() {
        let addr: std::net::Ipv4Addr = FALLBACK_MULTICAST_GROUP
            .parse()
            .expect("group constant should parse");
        assert!(addr.is_multicast());
    }
}
