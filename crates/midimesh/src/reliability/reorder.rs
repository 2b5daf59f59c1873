// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-source ordered delivery with bounded buffering and gap tolerance.
//!
//! One lost packet must not stall a MIDI stream: a missed NoteOff is
//! recovered by the next NoteOn/NoteOff pair at the destination. The
//! buffer therefore bounds head-of-line blocking two ways:
//!
//! - `max_sequence_gap` (G): once the distance from the expected sequence
//!   exceeds G, the missing predecessors are declared lost and delivery
//!   advances past them.
//! - `max_buffer_size` (N): pathological reordering cannot grow memory;
//!   inserting beyond N evicts the entry closest to the expected sequence.
//!
//! All sequence comparisons go through [`super::seq::distance`], so the
//! 65535 -> 0 wrap is a forward step of 1 like any other.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::seq;
use crate::config::ReorderConfig;
use crate::core::NodeId;
use crate::protocol::Packet;

/// Callback receiving packets in sequence order.
pub type PacketReadyFn = Arc<dyn Fn(Packet) + Send + Sync>;

/// Reorder statistics, updated lock-free.
#[derive(Debug, Default)]
pub struct ReorderMetrics {
    /// Packets handed to the callback in order.
    pub delivered: AtomicU64,
    /// High-water mark of buffered entries across all sources.
    pub buffered_peak: AtomicU64,
    /// Buffered entries discarded by a forced advance.
    pub gap_forced_drops: AtomicU64,
    /// Entries evicted because a source buffer was full.
    pub capacity_drops: AtomicU64,
    /// Duplicate or already-superseded packets dropped.
    pub duplicates_dropped: AtomicU64,
}

impl ReorderMetrics {
    /// Snapshot: (delivered, buffered peak, gap drops, capacity drops,
    /// duplicates).
    pub fn snapshot(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.delivered.load(Ordering::Relaxed),
            self.buffered_peak.load(Ordering::Relaxed),
            self.gap_forced_drops.load(Ordering::Relaxed),
            self.capacity_drops.load(Ordering::Relaxed),
            self.duplicates_dropped.load(Ordering::Relaxed),
        )
    }

    fn note_buffered(&self, len: usize) {
        self.buffered_peak.fetch_max(len as u64, Ordering::Relaxed);
    }
}

/// Per-source reorder state.
struct SourceState {
    /// Next in-order sequence for this source.
    expected: u16,
    /// Out-of-order packets keyed by raw sequence.
    buffer: BTreeMap<u16, Packet>,
}

/// Per-source ordered delivery driver.
///
/// `add_packet` runs the state machine and issues deliveries synchronously
/// through the callback supplied at construction. The sources lock is
/// released before any callback fires.
pub struct ReorderBuffer {
    config: ReorderConfig,
    sources: Mutex<HashMap<NodeId, SourceState>>,
    on_packet_ready: PacketReadyFn,
    metrics: Arc<ReorderMetrics>,
}

impl ReorderBuffer {
    /// Create a buffer delivering through `on_packet_ready`.
    pub fn new(config: ReorderConfig, on_packet_ready: PacketReadyFn) -> Self {
        Self {
            config,
            sources: Mutex::new(HashMap::new()),
            on_packet_ready,
            metrics: Arc::new(ReorderMetrics::default()),
        }
    }

    /// Shared metrics handle.
    #[must_use]
    pub fn metrics(&self) -> Arc<ReorderMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Feed one received DATA packet into the state machine.
    ///
    /// Deliveries happen synchronously within this call, in sequence
    /// order, after internal locks are released.
    pub fn add_packet(&self, packet: Packet) {
        let source = packet.source_node;
        let seq_num = packet.sequence;
        let gap = i32::from(self.config.max_sequence_gap);
        let mut ready: Vec<Packet> = Vec::new();

        {
            let mut sources = self.sources.lock();
            let state = sources.entry(source).or_insert_with(|| {
                // A stream whose first observed sequence is within the gap
                // tolerance of zero is a fresh stream with a reordered
                // head; expecting zero lets that head still be recovered.
                let origin = seq::distance(0, seq_num);
                let expected = if (0..=gap).contains(&origin) { 0 } else { seq_num };
                SourceState {
                    expected,
                    buffer: BTreeMap::new(),
                }
            });

            let d = seq::distance(state.expected, seq_num);

            if d < 0 {
                // Duplicate or re-ordered past: already delivered or
                // superseded by a forced advance.
                self.metrics.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "[REORDER] drop past seq={} expected={} source={}",
                    seq_num,
                    state.expected,
                    source
                );
            } else if d <= gap {
                // In-order packets transit their buffer slot too, so the
                // peak statistic reflects every packet the structure held.
                self.insert_buffered(state, packet, d);
                Self::drain(state, &mut ready);
            } else {
                // Gap beyond tolerance: predecessors are permanently lost.
                let dropped = Self::discard_at_or_before(state, seq_num);
                if dropped > 0 {
                    self.metrics
                        .gap_forced_drops
                        .fetch_add(dropped, Ordering::Relaxed);
                }
                log::debug!(
                    "[REORDER] forced advance source={} expected={} -> {} (gap {})",
                    source,
                    state.expected,
                    seq_num.wrapping_add(1),
                    d
                );
                ready.push(packet);
                state.expected = seq::next(seq_num);
                Self::drain(state, &mut ready);
            }
        }

        for p in ready {
            self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
            (self.on_packet_ready)(p);
        }
    }

    /// Clear state for one source (used on peer loss).
    pub fn reset(&self, source: &NodeId) {
        self.sources.lock().remove(source);
    }

    /// Number of sources currently tracked.
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.sources.lock().len()
    }

    /// Buffer a packet at its slot, evicting under capacity pressure.
    ///
    /// A slot that is about to drain (`d == 0`) may transiently exceed the
    /// capacity; only genuinely out-of-order inserts trigger eviction.
    fn insert_buffered(&self, state: &mut SourceState, packet: Packet, d: i32) {
        let seq_num = packet.sequence;
        if state.buffer.contains_key(&seq_num) {
            self.metrics.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if d > 0 && state.buffer.len() >= self.config.max_buffer_size {
            // Evict the entry nearest the expected sequence (smallest in
            // wraparound order).
            let expected = state.expected;
            if let Some(&victim) = state
                .buffer
                .keys()
                .min_by_key(|&&s| seq::distance(expected, s))
            {
                state.buffer.remove(&victim);
                self.metrics.capacity_drops.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "[REORDER] capacity evict seq={} source={}",
                    victim,
                    packet.source_node
                );
            }
        }

        state.buffer.insert(seq_num, packet);
        self.metrics.note_buffered(state.buffer.len());
    }

    /// Move contiguously buffered successors into the ready list.
    fn drain(state: &mut SourceState, ready: &mut Vec<Packet>) {
        while let Some(p) = state.buffer.remove(&state.expected) {
            ready.push(p);
            state.expected = seq::next(state.expected);
        }
    }

    /// Discard buffered entries at or before `upto` (wraparound order).
    /// Returns how many were discarded.
    fn discard_at_or_before(state: &mut SourceState, upto: u16) -> u64 {
        let before_len = state.buffer.len();
        state.buffer.retain(|&s, _| seq::distance(upto, s) > 0);
        (before_len - state.buffer.len()) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReorderConfig;

    fn collect_buffer(config: ReorderConfig) -> (ReorderBuffer, Arc<Mutex<Vec<u16>>>) {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let buffer = ReorderBuffer::new(
            config,
            Arc::new(move |p: Packet| sink.lock().push(p.sequence)),
        );
        (buffer, delivered)
    }

    fn data(source: NodeId, seq_num: u16) -> Packet {
        Packet::data(source, NodeId::generate(), 1, seq_num, vec![0x90, 0x3C, 0x64])
    }

    #[test]
    fn test_in_order_delivery() {
        let (buffer, delivered) = collect_buffer(ReorderConfig::default());
        let src = NodeId::generate();

        for s in 0..5 {
            buffer.add_packet(data(src, s));
        }

        assert_eq!(*delivered.lock(), vec![0, 1, 2, 3, 4]);
        let (count, peak, ..) = buffer.metrics().snapshot();
        assert_eq!(count, 5);
        assert_eq!(peak, 1, "in-order packets only transit their own slot");
    }

    #[test]
    fn test_reorder_permutation() {
        // Spec scenario: [2,0,1,4,3] must deliver as [0,1,2,3,4].
        let (buffer, delivered) = collect_buffer(ReorderConfig::default());
        let src = NodeId::generate();

        for s in [2u16, 0, 1, 4, 3] {
            buffer.add_packet(data(src, s));
        }

        assert_eq!(*delivered.lock(), vec![0, 1, 2, 3, 4]);
        let (_, peak, gap, cap, dup) = buffer.metrics().snapshot();
        assert!(peak >= 2, "2 and 4 were buffered concurrently at some point");
        assert_eq!((gap, cap, dup), (0, 0, 0));
    }

    #[test]
    fn test_first_packet_sets_expected() {
        let (buffer, delivered) = collect_buffer(ReorderConfig::default());
        let src = NodeId::generate();

        buffer.add_packet(data(src, 4242));
        assert_eq!(*delivered.lock(), vec![4242]);
    }

    #[test]
    fn test_duplicate_dropped() {
        let (buffer, delivered) = collect_buffer(ReorderConfig::default());
        let src = NodeId::generate();

        buffer.add_packet(data(src, 0));
        buffer.add_packet(data(src, 0));
        buffer.add_packet(data(src, 1));

        assert_eq!(*delivered.lock(), vec![0, 1]);
        let (.., dup) = buffer.metrics().snapshot();
        assert_eq!(dup, 1);
    }

    #[test]
    fn test_duplicate_in_buffer_dropped() {
        let (buffer, delivered) = collect_buffer(ReorderConfig::default());
        let src = NodeId::generate();

        buffer.add_packet(data(src, 0));
        buffer.add_packet(data(src, 2));
        buffer.add_packet(data(src, 2));
        buffer.add_packet(data(src, 1));

        assert_eq!(*delivered.lock(), vec![0, 1, 2]);
        let (.., dup) = buffer.metrics().snapshot();
        assert_eq!(dup, 1);
    }

    #[test]
    fn test_gap_at_tolerance_buffers() {
        // d == G buffers and waits; no forced advance.
        let config = ReorderConfig {
            max_sequence_gap: 4,
            ..ReorderConfig::default()
        };
        let (buffer, delivered) = collect_buffer(config);
        let src = NodeId::generate();

        buffer.add_packet(data(src, 0));
        buffer.add_packet(data(src, 5)); // distance 4 == G
        assert_eq!(*delivered.lock(), vec![0]);

        let (_, _, gap, ..) = buffer.metrics().snapshot();
        assert_eq!(gap, 0);
    }

    #[test]
    fn test_gap_past_tolerance_forces_advance() {
        let config = ReorderConfig {
            max_sequence_gap: 4,
            ..ReorderConfig::default()
        };
        let (buffer, delivered) = collect_buffer(config);
        let src = NodeId::generate();

        buffer.add_packet(data(src, 0));
        buffer.add_packet(data(src, 3)); // buffered
        buffer.add_packet(data(src, 6)); // distance 5 > G: forced advance

        // 3 was at-or-before 6, so it is discarded, not delivered late.
        assert_eq!(*delivered.lock(), vec![0, 6]);
        let (_, _, gap, ..) = buffer.metrics().snapshot();
        assert_eq!(gap, 1);

        // Stream continues from 7.
        buffer.add_packet(data(src, 7));
        assert_eq!(*delivered.lock(), vec![0, 6, 7]);
    }

    #[test]
    fn test_forced_advance_drains_successors() {
        let config = ReorderConfig {
            max_sequence_gap: 2,
            ..ReorderConfig::default()
        };
        let (buffer, delivered) = collect_buffer(config);
        let src = NodeId::generate();

        buffer.add_packet(data(src, 0));
        buffer.add_packet(data(src, 2)); // buffered (d=1)
        // d=4 > G. 2 is discarded; nothing buffered past 4.
        buffer.add_packet(data(src, 4));
        buffer.add_packet(data(src, 6)); // buffered (d=1 from new expected 5)
        buffer.add_packet(data(src, 5)); // closes the gap, drains 6

        assert_eq!(*delivered.lock(), vec![0, 4, 5, 6]);
    }

    #[test]
    fn test_capacity_eviction() {
        let config = ReorderConfig {
            max_buffer_size: 3,
            max_sequence_gap: 100,
        };
        let (buffer, delivered) = collect_buffer(config);
        let src = NodeId::generate();

        buffer.add_packet(data(src, 0));
        // Four out-of-order arrivals against capacity 3.
        for s in [2u16, 3, 4, 5] {
            buffer.add_packet(data(src, s));
        }
        let (_, peak, _, cap, _) = buffer.metrics().snapshot();
        assert_eq!(cap, 1, "fourth insert evicts the smallest entry (2)");
        assert!(peak >= 3);

        // 1 arrives and delivers, but the gap at 2 (evicted) stays open.
        buffer.add_packet(data(src, 1));
        assert_eq!(*delivered.lock(), vec![0, 1]);

        // A late retransmit of 2 closes the gap and drains the rest.
        buffer.add_packet(data(src, 2));
        assert_eq!(*delivered.lock(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_capacity_exact_fit_no_eviction() {
        let config = ReorderConfig {
            max_buffer_size: 3,
            max_sequence_gap: 100,
        };
        let (buffer, _) = collect_buffer(config);
        let src = NodeId::generate();

        buffer.add_packet(data(src, 0));
        for s in [2u16, 3, 4] {
            buffer.add_packet(data(src, s));
        }
        let (_, _, _, cap, _) = buffer.metrics().snapshot();
        assert_eq!(cap, 0, "exactly N entries fit without eviction");
    }

    #[test]
    fn test_wraparound_in_order() {
        // Spec scenario: expected starts at 65533; 65534, 65535, 0, 1
        // all deliver with no forced advance and no drops.
        let (buffer, delivered) = collect_buffer(ReorderConfig::default());
        let src = NodeId::generate();

        buffer.add_packet(data(src, 65533));
        for s in [65534u16, 65535, 0, 1] {
            buffer.add_packet(data(src, s));
        }

        assert_eq!(*delivered.lock(), vec![65533, 65534, 65535, 0, 1]);
        let (_, _, gap, cap, dup) = buffer.metrics().snapshot();
        assert_eq!((gap, cap, dup), (0, 0, 0));
    }

    #[test]
    fn test_wraparound_reorder() {
        let (buffer, delivered) = collect_buffer(ReorderConfig::default());
        let src = NodeId::generate();

        buffer.add_packet(data(src, 65534));
        buffer.add_packet(data(src, 0)); // buffered across the wrap
        buffer.add_packet(data(src, 65535)); // drains 0

        assert_eq!(*delivered.lock(), vec![65534, 65535, 0]);
    }

    #[test]
    fn test_sources_independent() {
        let (buffer, delivered) = collect_buffer(ReorderConfig::default());
        let src_a = NodeId::generate();
        let src_b = NodeId::generate();

        buffer.add_packet(data(src_a, 100));
        buffer.add_packet(data(src_b, 900));
        buffer.add_packet(data(src_a, 101));
        buffer.add_packet(data(src_b, 901));

        assert_eq!(*delivered.lock(), vec![100, 900, 101, 901]);
        assert_eq!(buffer.source_count(), 2);
    }

    #[test]
    fn test_reset_clears_source() {
        let (buffer, delivered) = collect_buffer(ReorderConfig::default());
        let src = NodeId::generate();

        buffer.add_packet(data(src, 100));
        buffer.reset(&src);
        assert_eq!(buffer.source_count(), 0);

        // After reset the next packet re-initializes expected.
        buffer.add_packet(data(src, 70));
        assert_eq!(*delivered.lock(), vec![100, 70]);
    }

    #[test]
    fn test_random_permutation_delivers_ascending_subsequence() {
        // Property: any arrival permutation yields an ascending
        // subsequence with no duplicates.
        let config = ReorderConfig {
            max_buffer_size: 16,
            max_sequence_gap: 8,
        };
        let (buffer, delivered) = collect_buffer(config);
        let src = NodeId::generate();

        let mut seqs: Vec<u16> = (0..64).collect();
        fastrand::seed(0xC0FFEE);
        fastrand::shuffle(&mut seqs);
        for s in seqs {
            buffer.add_packet(data(src, s));
        }

        let out = delivered.lock();
        for pair in out.windows(2) {
            assert!(
                seq::distance(pair[0], pair[1]) > 0,
                "deliveries must be strictly ascending: {:?}",
                &out[..]
            );
        }
    }
}
