// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Self-describing announcement record for the fallback mechanism.
//!
//! A JSON object with a fixed key set; parsers accept keys in any order
//! and ignore unknown keys, senders always emit every key. The same
//! fields (minus `name`) travel as mDNS TXT records.

use std::net::IpAddr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::core::NodeId;

use super::PeerRecord;

/// One discovery announcement, as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Announcement {
    /// Node id, hyphenated UUID text.
    pub uuid: String,
    /// Human-readable instance name.
    pub name: String,
    /// Announcing host's name.
    pub hostname: String,
    /// HTTP control port.
    pub http_port: u16,
    /// UDP data port.
    pub udp_port: u16,
    /// Protocol version.
    pub version: u8,
    /// Exposed MIDI device count.
    pub devices: u16,
}

impl Announcement {
    /// Parse a received announcement. `None` for anything that is not a
    /// well-formed record.
    #[must_use]
    pub fn from_json(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }

    /// Encode for transmission.
    #[must_use]
    pub fn to_json(&self) -> Vec<u8> {
        // A struct of strings and integers cannot fail to serialize.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// The announced node id, when the uuid field parses.
    #[must_use]
    pub fn node_id(&self) -> Option<NodeId> {
        self.uuid.parse().ok()
    }

    /// Build the peer record for this announcement as received from `ip`.
    #[must_use]
    pub fn to_peer_record(&self, ip: IpAddr) -> Option<PeerRecord> {
        Some(PeerRecord {
            node_id: self.node_id()?,
            name: self.name.clone(),
            hostname: self.hostname.clone(),
            ip,
            http_port: self.http_port,
            udp_port: self.udp_port,
            protocol_version: self.version,
            device_count: self.devices,
            last_seen: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample() -> Announcement {
        Announcement {
            uuid: NodeId::generate().to_string(),
            name: "studio-a".to_string(),
            hostname: "studio-a.local".to_string(),
            http_port: 8080,
            udp_port: 5004,
            version: 1,
            devices: 4,
        }
    }

    #[test]
    fn test_json_roundtrip() {
        let a = sample();
        let parsed = Announcement::from_json(&a.to_json()).expect("roundtrip should parse");
        assert_eq!(parsed, a);
    }

    #[test]
    fn test_all_keys_emitted() {
        let json = String::from_utf8(sample().to_json()).expect("json is utf-8");
        for key in ["uuid", "name", "hostname", "http_port", "udp_port", "version", "devices"] {
            assert!(json.contains(key), "announcement must carry key '{}'", key);
        }
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let id = NodeId::generate();
        let json = format!(
            r#"{{"devices":2,"version":1,"udp_port":5004,"http_port":80,
                "hostname":"h","name":"n","uuid":"{}","future_field":true}}"#,
            id
        );
        let parsed =
            Announcement::from_json(json.as_bytes()).expect("unknown keys must be ignored");
        assert_eq!(parsed.node_id(), Some(id));
        assert_eq!(parsed.devices, 2);
    }

    #[test]
    fn test_missing_key_rejected() {
        let json = br#"{"name":"n","hostname":"h"}"#;
        assert!(Announcement::from_json(json).is_none());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Announcement::from_json(b"\x00\x01\x02").is_none());
        assert!(Announcement::from_json(b"[1,2,3]").is_none());
    }

    #[test]
    fn test_bad_uuid_yields_no_node_id() {
        let mut a = sample();
        a.uuid = "not-a-uuid".to_string();
        assert!(a.node_id().is_none());
        assert!(a.to_peer_record(IpAddr::V4(Ipv4Addr::LOCALHOST)).is_none());
    }

    #[test]
    fn test_peer_record_fields() {
        let a = sample();
        let record = a
            .to_peer_record(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)))
            .expect("record should build");
        assert_eq!(record.name, "studio-a");
        assert_eq!(record.udp_port, 5004);
        assert_eq!(record.device_count, 4);
        assert_eq!(record.ip.to_string(), "192.168.1.20");
    }
}
