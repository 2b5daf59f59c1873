// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Packet encoding and decoding.
//!
//! # Wire Format
//!
//! ```text
//! +---------+------+-------+----------+--------------+------------+-----------+-------------+----------+---------+
//! | version | kind | flags | sequence | source_node  | dest_node  | device_id | payload_len | checksum | payload |
//! | (u8)    | (u8) | (u8)  | (u16)    | (16 bytes)   | (16 bytes) | (u16)     | (u16)       | (u16)    | (...)   |
//! +---------+------+-------+----------+--------------+------------+-----------+-------------+----------+---------+
//! ```
//!
//! - All multi-byte fields are big-endian.
//! - The checksum is CRC-16/CCITT-FALSE over the header with the checksum
//!   field zeroed, followed by the payload. It validates before any other
//!   packet state is consulted by the receive path.
//! - One packet fits one UDP datagram by contract; the fragmentation flags
//!   are reserved for a future extension and never set by this crate.

pub mod checksum;

use std::io::Read;

use crate::config::{MAX_PAYLOAD_LEN, PROTOCOL_VERSION};
use crate::core::{DeviceId, MeshError, NodeId};
use checksum::{crc16, crc16_update};

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 43;

/// Byte offset of the checksum field within the header.
const CHECKSUM_OFFSET: usize = 41;

/// Payloads at or above this size are worth deflating.
const COMPRESS_THRESHOLD: usize = 512;

/// Inflate ceiling; a valid sender never exceeds `MAX_PAYLOAD_LEN`
/// uncompressed, so anything past this is a corrupt or hostile stream.
const INFLATE_LIMIT: u64 = 64 * 1024;

/// Packet kind discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Carries MIDI bytes for delivery.
    Data = 0x01,
    /// Acknowledges a previously received reliable DATA packet.
    Ack = 0x02,
    /// Negative acknowledgment; a hint to retransmit immediately.
    Nak = 0x03,
    /// Session liveness probe; never reliable, never reordered.
    Heartbeat = 0x04,
    /// Reserved for a session handshake overlay.
    Handshake = 0x05,
}

impl PacketKind {
    /// Parse the wire discriminant.
    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Data),
            0x02 => Some(Self::Ack),
            0x03 => Some(Self::Nak),
            0x04 => Some(Self::Heartbeat),
            0x05 => Some(Self::Handshake),
            _ => None,
        }
    }
}

/// Packet flags bitfield.
pub mod flags {
    /// Delivery is retried until acknowledged or attempts are exhausted.
    pub const RELIABLE: u8 = 0x01;
    /// Packet is part of a fragmented message (reserved).
    pub const FRAGMENTED: u8 = 0x02;
    /// Packet is the last fragment (reserved).
    pub const LAST_FRAGMENT: u8 = 0x04;
    /// Payload is deflate-compressed on the wire.
    pub const COMPRESSED: u8 = 0x08;
}

/// A mesh packet. Value type; the checksum is derived at serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Protocol version (currently 1).
    pub version: u8,
    /// Packet kind.
    pub kind: PacketKind,
    /// Flags bitfield (see [`flags`]).
    pub flags: u8,
    /// Per-source monotonic sequence, wraps at 2^16.
    pub sequence: u16,
    /// Originating node.
    pub source_node: NodeId,
    /// Destination node, or [`NodeId::BROADCAST`] for discovery traffic.
    pub dest_node: NodeId,
    /// Target device within the destination node.
    pub device_id: DeviceId,
    /// Opaque bytes; MIDI for DATA, empty for ACK/NAK/HEARTBEAT.
    pub payload: Vec<u8>,
}

// ===== Factory constructors =====

impl Packet {
    /// DATA packet carrying MIDI bytes.
    #[must_use]
    pub fn data(
        source: NodeId,
        dest: NodeId,
        device_id: DeviceId,
        sequence: u16,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind: PacketKind::Data,
            flags: 0,
            sequence,
            source_node: source,
            dest_node: dest,
            device_id,
            payload,
        }
    }

    /// ACK for a reliable DATA packet.
    ///
    /// `acker` is the node that received the DATA; `original_source` is the
    /// node that sent it; `sequence` is the acknowledged sequence.
    #[must_use]
    pub fn ack(acker: NodeId, original_source: NodeId, sequence: u16, device_id: DeviceId) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind: PacketKind::Ack,
            flags: 0,
            sequence,
            source_node: acker,
            dest_node: original_source,
            device_id,
            payload: Vec::new(),
        }
    }

    /// NAK for a missing sequence; a retransmit hint, not a requirement.
    #[must_use]
    pub fn nak(sender: NodeId, original_source: NodeId, sequence: u16, device_id: DeviceId) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind: PacketKind::Nak,
            flags: 0,
            sequence,
            source_node: sender,
            dest_node: original_source,
            device_id,
            payload: Vec::new(),
        }
    }

    /// Session heartbeat. Never reliable, never enters the reorder buffer,
    /// so the sequence field is unused and zero.
    #[must_use]
    pub fn heartbeat(source: NodeId, dest: NodeId) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind: PacketKind::Heartbeat,
            flags: 0,
            sequence: 0,
            source_node: source,
            dest_node: dest,
            device_id: 0,
            payload: Vec::new(),
        }
    }

    /// HANDSHAKE packet. The handshake protocol itself is an overlay for
    /// the mesh manager; this crate only moves the bytes.
    #[must_use]
    pub fn handshake(source: NodeId, dest: NodeId, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind: PacketKind::Handshake,
            flags: 0,
            sequence: 0,
            source_node: source,
            dest_node: dest,
            device_id: 0,
            payload,
        }
    }
}

// ===== Flag accessors =====

impl Packet {
    /// True when the RELIABLE flag is set.
    #[inline]
    #[must_use]
    pub fn is_reliable(&self) -> bool {
        self.flags & flags::RELIABLE != 0
    }

    /// Set or clear the RELIABLE flag.
    #[inline]
    pub fn set_reliable(&mut self, enabled: bool) {
        if enabled {
            self.flags |= flags::RELIABLE;
        } else {
            self.flags &= !flags::RELIABLE;
        }
    }

    /// True when the payload is deflate-compressed on the wire.
    #[inline]
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.flags & flags::COMPRESSED != 0
    }
}

// ===== Codec =====

impl Packet {
    /// Serialize into a single-datagram byte vector.
    ///
    /// Fails with `PayloadTooLarge` when the payload exceeds
    /// [`MAX_PAYLOAD_LEN`]; nothing else can fail.
    pub fn serialize(&self) -> Result<Vec<u8>, MeshError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(MeshError::PayloadTooLarge(self.payload.len()));
        }

        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.version);
        buf.push(self.kind as u8);
        buf.push(self.flags);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(self.source_node.as_bytes());
        buf.extend_from_slice(self.dest_node.as_bytes());
        buf.extend_from_slice(&self.device_id.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&[0, 0]); // checksum placeholder
        buf.extend_from_slice(&self.payload);

        let crc = crc16(&buf);
        buf[CHECKSUM_OFFSET] = (crc >> 8) as u8;
        buf[CHECKSUM_OFFSET + 1] = crc as u8;

        Ok(buf)
    }

    /// Parse a received datagram.
    ///
    /// The checksum validates before anything else is consulted. A
    /// compressed payload is inflated and the COMPRESSED flag cleared, so
    /// callers always observe plain MIDI bytes.
    ///
    /// # Errors
    ///
    /// - `MalformedHeader` if the datagram is shorter than the header, the
    ///   kind is unknown, or `payload_length` disagrees with the actual
    ///   byte count
    /// - `UnsupportedVersion` if the version is not current
    /// - `ChecksumMismatch` on integrity failure
    pub fn deserialize(data: &[u8]) -> Result<Self, MeshError> {
        if data.len() < HEADER_LEN {
            return Err(MeshError::MalformedHeader);
        }

        let version = data[0];
        if version != PROTOCOL_VERSION {
            return Err(MeshError::UnsupportedVersion(version));
        }

        let payload_len = u16::from_be_bytes([data[39], data[40]]) as usize;
        if data.len() != HEADER_LEN + payload_len {
            return Err(MeshError::MalformedHeader);
        }

        let stored_crc = u16::from_be_bytes([data[CHECKSUM_OFFSET], data[CHECKSUM_OFFSET + 1]]);
        let mut crc = crc16(&data[..CHECKSUM_OFFSET]);
        crc = crc16_update(crc, &[0, 0]);
        crc = crc16_update(crc, &data[HEADER_LEN..]);
        if crc != stored_crc {
            return Err(MeshError::ChecksumMismatch);
        }

        let kind = PacketKind::from_u8(data[1]).ok_or(MeshError::MalformedHeader)?;
        let mut flags = data[2];
        let sequence = u16::from_be_bytes([data[3], data[4]]);

        let mut source = [0u8; 16];
        source.copy_from_slice(&data[5..21]);
        let mut dest = [0u8; 16];
        dest.copy_from_slice(&data[21..37]);

        let device_id = u16::from_be_bytes([data[37], data[38]]);

        let wire_payload = &data[HEADER_LEN..];
        let payload = if flags & flags::COMPRESSED != 0 {
            let inflated = inflate(wire_payload)?;
            flags &= !flags::COMPRESSED;
            inflated
        } else {
            wire_payload.to_vec()
        };

        Ok(Self {
            version,
            kind,
            flags,
            sequence,
            source_node: NodeId::from_bytes(source),
            dest_node: NodeId::from_bytes(dest),
            device_id,
            payload,
        })
    }

    /// Deflate the payload in place when it is large enough to benefit.
    ///
    /// No-op for short payloads or when compression does not shrink the
    /// bytes. Sets the COMPRESSED flag on success.
    pub fn compress(&mut self) {
        if self.is_compressed() || self.payload.len() < COMPRESS_THRESHOLD {
            return;
        }

        let mut encoder =
            flate2::read::DeflateEncoder::new(&self.payload[..], flate2::Compression::fast());
        let mut compressed = Vec::with_capacity(self.payload.len());
        if encoder.read_to_end(&mut compressed).is_err() {
            return;
        }

        if compressed.len() < self.payload.len() {
            self.payload = compressed;
            self.flags |= flags::COMPRESSED;
        }
    }
}

/// Inflate a compressed wire payload with a hard size ceiling.
fn inflate(wire: &[u8]) -> Result<Vec<u8>, MeshError> {
    let mut decoder = flate2::read::DeflateDecoder::new(wire).take(INFLATE_LIMIT);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|_| MeshError::MalformedHeader)?;
    Ok(out)
}
