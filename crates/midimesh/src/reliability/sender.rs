// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Retry/ACK state machine for reliable sends.
//!
//! ## Protocol Flow
//!
//! ```text
//! Sender                                   Receiver
//!   |                                          |
//!   |--- DATA (seq=7, RELIABLE) --X (lost)     |
//!   |         ... timeout ...                  |
//!   |--- DATA (seq=7) [retransmit] ----------->|
//!   |<-- ACK (seq=7) --------------------------|
//!   |                                          |
//!   | on_success fires exactly once            |
//! ```
//!
//! Each pending send is PENDING until either an ACK matches it (ACKED,
//! `on_success`) or its attempts are exhausted or it is canceled (FAILED,
//! `on_failure`). Exactly one of the callbacks fires, exactly once; the
//! pending record is removed from the table before its callback is
//! invoked, so a duplicate or late ACK finds nothing to match.
//!
//! Multiple reliable sends to one destination proceed in parallel; this
//! layer does not order anything (the receiver's reorder buffer does).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::config::{Backoff, ReliabilityConfig};
use crate::core::{MeshError, NodeId};
use crate::protocol::Packet;

/// How often the timer thread re-evaluates deadlines between wakes.
const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Transmit hook supplied by the owner (the datagram endpoint, in
/// production).
pub type TransmitFn = Arc<dyn Fn(&Packet, SocketAddr) -> Result<(), MeshError> + Send + Sync>;

/// Invoked once when the send is acknowledged.
pub type SuccessFn = Box<dyn FnOnce() + Send>;

/// Invoked once when the send terminally fails.
pub type FailureFn = Box<dyn FnOnce(FailureReason) + Send>;

/// Terminal failure reason handed to `on_failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// All attempts elapsed without an ACK.
    MaxAttemptsExceeded,
    /// The send was canceled, typically by shutdown.
    Canceled,
}

impl FailureReason {
    /// Stable string form carried in logs and tests.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxAttemptsExceeded => "max_attempts_exceeded",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reliability counters, lock-free.
#[derive(Debug, Default)]
pub struct ReliableMetrics {
    /// Reliable packets handed to the transmit hook (initial sends).
    pub sent: AtomicU64,
    /// Retransmissions (deadline and NAK driven).
    pub retransmissions: AtomicU64,
    /// ACKs that matched a pending record.
    pub acks_received: AtomicU64,
    /// ACKs with no pending match (duplicates, late arrivals).
    pub acks_ignored: AtomicU64,
    /// Sends that exhausted their attempts.
    pub timeouts: AtomicU64,
    /// Sends canceled before resolution.
    pub canceled: AtomicU64,
}

impl ReliableMetrics {
    /// Snapshot: (sent, retransmissions, acks received, acks ignored,
    /// timeouts, canceled).
    pub fn snapshot(&self) -> (u64, u64, u64, u64, u64, u64) {
        (
            self.sent.load(Ordering::Relaxed),
            self.retransmissions.load(Ordering::Relaxed),
            self.acks_received.load(Ordering::Relaxed),
            self.acks_ignored.load(Ordering::Relaxed),
            self.timeouts.load(Ordering::Relaxed),
            self.canceled.load(Ordering::Relaxed),
        )
    }
}

/// Pending table key: the acknowledged sequence plus the acknowledging
/// node. An inbound ACK carries exactly this pair in (sequence,
/// source_node).
type PendingKey = (u16, NodeId);

/// One in-flight reliable send.
struct PendingSend {
    packet: Packet,
    addr: SocketAddr,
    attempts: u32,
    timeout: Duration,
    deadline: Instant,
    on_success: Option<SuccessFn>,
    on_failure: Option<FailureFn>,
}

/// Retry/ACK driver with its own timer thread.
pub struct ReliableSender {
    config: ReliabilityConfig,
    transmit: TransmitFn,
    pending: Arc<Mutex<HashMap<PendingKey, PendingSend>>>,
    metrics: Arc<ReliableMetrics>,
    wake_tx: Sender<()>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReliableSender {
    /// Create the sender and spawn its timer thread.
    pub fn new(config: ReliabilityConfig, transmit: TransmitFn) -> std::io::Result<Self> {
        let pending: Arc<Mutex<HashMap<PendingKey, PendingSend>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let metrics = Arc::new(ReliableMetrics::default());
        let running = Arc::new(AtomicBool::new(true));
        let (wake_tx, wake_rx) = bounded::<()>(1);

        let handle = {
            let pending = Arc::clone(&pending);
            let metrics = Arc::clone(&metrics);
            let running = Arc::clone(&running);
            let transmit = Arc::clone(&transmit);
            let config = config.clone();
            std::thread::Builder::new()
                .name("midimesh-retry".to_string())
                .spawn(move || {
                    Self::run_loop(&wake_rx, &pending, &metrics, &running, &transmit, &config);
                })?
        };

        Ok(Self {
            config,
            transmit,
            pending,
            metrics,
            wake_tx,
            running,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Shared metrics handle.
    #[must_use]
    pub fn metrics(&self) -> Arc<ReliableMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Pending sends currently in flight.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Transmit a reliable packet and arm its first retry deadline.
    ///
    /// The packet must carry a freshly assigned sequence; the RELIABLE
    /// flag is set here if the caller has not already done so. The initial
    /// transmission happens on the caller's thread; retries and callbacks
    /// run on the timer thread.
    pub fn send_reliable(
        &self,
        mut packet: Packet,
        addr: SocketAddr,
        on_success: SuccessFn,
        on_failure: FailureFn,
    ) -> Result<(), MeshError> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(MeshError::NotStarted);
        }
        packet.set_reliable(true);

        (self.transmit)(&packet, addr)?;
        self.metrics.sent.fetch_add(1, Ordering::Relaxed);

        let key = (packet.sequence, packet.dest_node);
        let record = PendingSend {
            packet,
            addr,
            attempts: 1,
            timeout: self.config.initial_timeout,
            deadline: Instant::now() + self.config.initial_timeout,
            on_success: Some(on_success),
            on_failure: Some(on_failure),
        };

        let replaced = self.pending.lock().insert(key, record);
        if let Some(mut old) = replaced {
            // Same sequence re-armed towards the same peer before the
            // previous send resolved; the old record can never match an
            // unambiguous ACK anymore.
            log::debug!(
                "[RELIABLE] seq={} dest={} re-armed, canceling stale record",
                key.0,
                key.1
            );
            if let Some(fail) = old.on_failure.take() {
                fail(FailureReason::Canceled);
            }
        }

        // Nudge the timer thread so a short timeout is honored promptly.
        if let Err(TrySendError::Disconnected(())) = self.wake_tx.try_send(()) {
            log::debug!("[RELIABLE] timer thread gone, send will not retry");
        }
        Ok(())
    }

    /// Feed an inbound ACK. A match resolves the pending send; anything
    /// else is counted and ignored.
    pub fn on_ack_received(&self, ack: &Packet) {
        let key = (ack.sequence, ack.source_node);
        let record = self.pending.lock().remove(&key);
        match record {
            Some(mut pending) => {
                self.metrics.acks_received.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "[RELIABLE] ACK seq={} from={} after {} attempt(s)",
                    key.0,
                    key.1,
                    pending.attempts
                );
                if let Some(success) = pending.on_success.take() {
                    success();
                }
            }
            None => {
                self.metrics.acks_ignored.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Feed an inbound NAK: retransmit the named sequence immediately if
    /// it is still pending and has attempts left.
    pub fn on_nak_received(&self, nak: &Packet) {
        let key = (nak.sequence, nak.source_node);
        let mut pending = self.pending.lock();
        if let Some(record) = pending.get_mut(&key) {
            if record.attempts < self.config.max_attempts {
                record.attempts += 1;
                record.timeout = Self::next_timeout(&self.config, record.timeout);
                record.deadline = Instant::now() + record.timeout;
                let _ = (self.transmit)(&record.packet, record.addr);
                self.metrics.retransmissions.fetch_add(1, Ordering::Relaxed);
                log::debug!("[RELIABLE] NAK retransmit seq={} dest={}", key.0, key.1);
            }
        }
    }

    /// Evaluate deadlines once. Called by the timer thread every tick and
    /// directly by tests.
    pub fn tick(&self) {
        Self::evaluate(
            &self.pending,
            &self.metrics,
            &self.transmit,
            &self.config,
        );
    }

    /// Cancel every pending send, firing `on_failure("canceled")` for each.
    pub fn cancel_all(&self) {
        let drained: Vec<PendingSend> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, v)| v).collect()
        };
        for mut record in drained {
            self.metrics.canceled.fetch_add(1, Ordering::Relaxed);
            if let Some(fail) = record.on_failure.take() {
                fail(FailureReason::Canceled);
            }
        }
    }

    /// Stop the timer thread and cancel all pending sends. No callback
    /// fires after this returns. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        let _ = self.wake_tx.try_send(());
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        self.cancel_all();
    }

    fn run_loop(
        wake_rx: &Receiver<()>,
        pending: &Arc<Mutex<HashMap<PendingKey, PendingSend>>>,
        metrics: &Arc<ReliableMetrics>,
        running: &Arc<AtomicBool>,
        transmit: &TransmitFn,
        config: &ReliabilityConfig,
    ) {
        while running.load(Ordering::Relaxed) {
            // The channel doubles as an interruptible sleep: a new send or
            // a stop request wakes the loop immediately.
            let _ = wake_rx.recv_timeout(TICK_INTERVAL);
            if !running.load(Ordering::Relaxed) {
                break;
            }
            Self::evaluate(pending, metrics, transmit, config);
        }
    }

    fn evaluate(
        pending: &Mutex<HashMap<PendingKey, PendingSend>>,
        metrics: &ReliableMetrics,
        transmit: &TransmitFn,
        config: &ReliabilityConfig,
    ) {
        let now = Instant::now();
        let mut failed: Vec<PendingSend> = Vec::new();

        {
            let mut table = pending.lock();
            let expired: Vec<PendingKey> = table
                .iter()
                .filter(|(_, r)| r.deadline <= now && r.attempts >= config.max_attempts)
                .map(|(k, _)| *k)
                .collect();
            for key in expired {
                if let Some(record) = table.remove(&key) {
                    metrics.timeouts.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "[RELIABLE] seq={} dest={} failed after {} attempts",
                        key.0,
                        key.1,
                        record.attempts
                    );
                    failed.push(record);
                }
            }

            for (key, record) in table.iter_mut() {
                if record.deadline > now {
                    continue;
                }
                record.attempts += 1;
                record.timeout = Self::next_timeout(config, record.timeout);
                record.deadline = now + record.timeout;
                let _ = transmit(&record.packet, record.addr);
                metrics.retransmissions.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "[RELIABLE] retransmit seq={} dest={} attempt={}",
                    key.0,
                    key.1,
                    record.attempts
                );
            }
        }

        for mut record in failed {
            if let Some(fail) = record.on_failure.take() {
                fail(FailureReason::MaxAttemptsExceeded);
            }
        }
    }

    fn next_timeout(config: &ReliabilityConfig, current: Duration) -> Duration {
        match config.backoff {
            Backoff::Fixed => config.initial_timeout,
            Backoff::Exponential => current * 2,
            Backoff::Capped(cap) => (current * 2).min(cap),
        }
    }
}

impl Drop for ReliableSender {
    fn drop(&mut self) {
        self.stop();
    }
}
