//! Message statistics shared by the channels of one loop.
//!
//! Counters are atomic so a broker-wide [`MessageStats`] can be read from any
//! thread while the selector thread updates it. Duplicate transmissions are
//! tracked separately from originals, and ack latency is recorded from the
//! first transmission of a message to the arrival of its acknowledgement.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for thread-safe metric updates.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters for messages sent and received over a set of channels.
#[derive(Debug, Default)]
pub struct MessageStats {
    messages_sent: Counter,
    duplicates_sent: Counter,
    messages_received: Counter,
    duplicates_received: Counter,
    acks_received: Counter,
    ack_latency_total_ms: Counter,
    ack_latency_max_ms: AtomicU64,
}

impl MessageStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message fully drained to the socket.
    pub fn message_sent(&self, duplicate: bool) {
        self.messages_sent.inc();
        if duplicate {
            self.duplicates_sent.inc();
        }
    }

    /// Record a complete message parsed off the wire.
    pub fn message_received(&self, duplicate: bool) {
        self.messages_received.inc();
        if duplicate {
            self.duplicates_received.inc();
        }
    }

    /// Record the latency between a message's first transmission and its ack.
    pub fn message_acked(&self, latency_ms: u64) {
        self.acks_received.inc();
        self.ack_latency_total_ms.add(latency_ms);
        self.ack_latency_max_ms.fetch_max(latency_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let acks = self.acks_received.get();
        let total = self.ack_latency_total_ms.get();
        StatsSnapshot {
            messages_sent: self.messages_sent.get(),
            duplicates_sent: self.duplicates_sent.get(),
            messages_received: self.messages_received.get(),
            duplicates_received: self.duplicates_received.get(),
            acks_received: acks,
            max_ack_latency_ms: self.ack_latency_max_ms.load(Ordering::Relaxed),
            average_ack_latency_ms: if acks == 0 {
                0.0
            } else {
                total as f64 / acks as f64
            },
        }
    }
}

/// Point-in-time view of [`MessageStats`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub messages_sent: u64,
    pub duplicates_sent: u64,
    pub messages_received: u64,
    pub duplicates_received: u64,
    pub acks_received: u64,
    pub max_ack_latency_ms: u64,
    pub average_ack_latency_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_duplicates_separately() {
        let stats = MessageStats::new();
        stats.message_sent(false);
        stats.message_sent(true);
        stats.message_received(false);

        let snap = stats.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.duplicates_sent, 1);
        assert_eq!(snap.messages_received, 1);
        assert_eq!(snap.duplicates_received, 0);
    }

    #[test]
    fn ack_latency_aggregates() {
        let stats = MessageStats::new();
        stats.message_acked(10);
        stats.message_acked(30);

        let snap = stats.snapshot();
        assert_eq!(snap.acks_received, 2);
        assert_eq!(snap.max_ack_latency_ms, 30);
        assert!((snap.average_ack_latency_ms - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_snapshot_has_zero_average() {
        let snap = MessageStats::new().snapshot();
        assert_eq!(snap.average_ack_latency_ms, 0.0);
    }
}
