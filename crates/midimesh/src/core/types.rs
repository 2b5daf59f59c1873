// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Identity types shared by every subsystem.
//!
//! A MIDI endpoint is globally identified by the pair (`NodeId`, `DeviceId`):
//! the node owns the device, the device id is only meaningful within that
//! node.

use std::fmt;
use std::io;
use std::str::FromStr;

use uuid::Uuid;

/// Opaque 128-bit node identifier, stable for the life of a process.
///
/// Generated once at startup via [`NodeId::generate`] and carried in every
/// packet header and discovery announcement. The all-ones value is reserved
/// as the broadcast sentinel used by discovery traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 16]);

impl NodeId {
    /// Wire length in bytes.
    pub const LEN: usize = 16;

    /// Broadcast sentinel (all bits set), valid only as a destination.
    pub const BROADCAST: NodeId = NodeId([0xFF; 16]);

    /// Generate a fresh random node id (UUIDv4).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Construct from raw big-endian bytes (wire order).
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw big-endian bytes (wire order).
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// True for the broadcast sentinel.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xFF; 16]
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).hyphenated())
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(|u| Self(u.into_bytes()))
    }
}

/// 16-bit device identifier scoped to its owning node.
pub type DeviceId = u16;

/// Crate-wide error type.
///
/// Per-packet parse failures (`MalformedHeader`, `UnsupportedVersion`,
/// `ChecksumMismatch`) are absorbed by the receive path and only counted;
/// they surface as values solely from the codec API itself.
#[derive(Debug)]
pub enum MeshError {
    /// Socket could not bind; fatal to the owning subsystem.
    BindFailed(io::Error),
    /// Transient OS-level send error; counted, endpoint stays up.
    SendFailed(io::Error),
    /// Datagram shorter than the fixed header, or a length field
    /// inconsistent with the actual byte count.
    MalformedHeader,
    /// Packet version is not the current protocol version.
    UnsupportedVersion(u8),
    /// Integrity code did not validate.
    ChecksumMismatch,
    /// Payload exceeds the single-datagram contract.
    PayloadTooLarge(usize),
    /// Advertising or browsing cannot start on the chosen mechanism.
    DiscoveryBackendUnavailable(String),
    /// The router knows no transport endpoint for the destination.
    NoRoute(NodeId),
    /// Operation requires a started subsystem.
    NotStarted,
}

impl fmt::Display for MeshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BindFailed(e) => write!(f, "socket bind failed: {}", e),
            Self::SendFailed(e) => write!(f, "datagram send failed: {}", e),
            Self::MalformedHeader => write!(f, "malformed packet header"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported protocol version {}", v),
            Self::ChecksumMismatch => write!(f, "packet checksum mismatch"),
            Self::PayloadTooLarge(n) => write!(f, "payload of {} bytes exceeds datagram limit", n),
            Self::DiscoveryBackendUnavailable(why) => {
                write!(f, "discovery backend unavailable: {}", why)
            }
            Self::NoRoute(node) => write!(f, "no route to node {}", node),
            Self::NotStarted => write!(f, "subsystem not started"),
        }
    }
}

impl std::error::Error for MeshError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BindFailed(e) | Self::SendFailed(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_generate_unique() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_ne!(a, b, "two generated node ids should differ");
    }

    #[test]
    fn test_node_id_roundtrip_bytes() {
        let id = NodeId::generate();
        let copy = NodeId::from_bytes(*id.as_bytes());
        assert_eq!(id, copy);
    }

    #[test]
    fn test_node_id_display_parse() {
        let id = NodeId::generate();
        let text = id.to_string();
        let parsed: NodeId = text.parse().expect("hyphenated uuid should parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_broadcast_sentinel() {
        assert!(NodeId::BROADCAST.is_broadcast());
        assert!(!NodeId::generate().is_broadcast());
    }

    #[test]
    fn test_error_display() {
        let err = MeshError::UnsupportedVersion(9);
        assert_eq!(err.to_string(), "unsupported protocol version 9");

        let err = MeshError::PayloadTooLarge(4096);
        assert!(err.to_string().contains("4096"));
    }
}
