// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # midimesh - peer-to-peer network MIDI mesh substrate
//!
//! Cooperating processes on a LAN expose local MIDI devices and consume
//! remote ones as if they were local, tolerating node join/leave,
//! reordering, and loss with bounded latency.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use midimesh::{MeshConfig, MeshCore, PeerRouter};
//! # struct MyRouter;
//! # impl PeerRouter for MyRouter {
//! #     fn route(&self, _n: midimesh::NodeId, _d: midimesh::DeviceId)
//! #         -> Option<(String, u16)> { None }
//! # }
//!
//! fn main() -> Result<(), midimesh::MeshError> {
//!     let core = MeshCore::new(MeshConfig::named("studio-a"), Arc::new(MyRouter));
//!     core.register_receive(Box::new(|source, device, midi| {
//!         println!("{}:{} -> {:02x?}", source, device, midi);
//!     }));
//!     let port = core.start(0)?;
//!     println!("listening on UDP {}", port);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +------------------------------------------------------------------+
//! |                        Mesh manager (external)                   |
//! +------------------------------------------------------------------+
//! |                            MeshCore                              |
//! |   send / register_receive / peer events / statistics             |
//! +------------------------------------------------------------------+
//! |  Reliability            |  Reordering       |  Discovery         |
//! |  retry/ACK machine      |  per-source,      |  mDNS + multicast  |
//! |                         |  gap tolerance    |  fallback+liveness |
//! +------------------------------------------------------------------+
//! |                      Datagram endpoint (UDP)                     |
//! +------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`MeshCore`] | Entry point wiring all subsystems behind one node |
//! | [`Packet`] | Wire-format value type with factory constructors |
//! | [`UdpEndpoint`] | Socket owner with receive thread and counters |
//! | [`ReliableSender`] | Retry/ACK state machine for RELIABLE packets |
//! | [`ReorderBuffer`] | Per-source ordered delivery, bounded buffering |
//! | [`Discovery`] | Capability trait over both discovery mechanisms |
//!
//! Out of scope here and supplied by collaborators: MIDI device I/O, the
//! HTTP control API, the route table, config loading, and session policy.

/// Mesh-wide constants and runtime knobs.
pub mod config;
/// Identity types and the crate-wide error enum.
pub mod core;
/// Peer discovery (mDNS and UDP-multicast fallback).
pub mod discovery;
/// Subsystem wiring and the mesh manager surface.
pub mod engine;
/// Packet encoding/decoding with CRC-16 integrity.
pub mod protocol;
/// Selective reliability and ordered delivery.
pub mod reliability;
/// UDP endpoint and interface helpers.
pub mod transport;

pub use config::{Backoff, DiscoveryConfig, MeshConfig, ReliabilityConfig, ReorderConfig};
pub use core::{DeviceId, MeshError, NodeId};
pub use discovery::{Discovery, FallbackDiscovery, MdnsDiscovery, PeerRecord};
pub use engine::{MeshCore, MeshStats, PeerRouter};
pub use protocol::{Packet, PacketKind};
pub use reliability::{FailureReason, ReliableSender, ReorderBuffer};
pub use transport::{EndpointStats, UdpEndpoint};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
