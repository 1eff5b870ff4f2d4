//! Per-endpoint traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Add a value to the counter.
    pub fn add(&self, v: u64) {
        self.0.fetch_add(v, Ordering::Relaxed);
    }

    /// Get the current counter value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Lock-free counters updated by the pumps and the public API.
#[derive(Debug, Default)]
pub struct EndpointStats {
    pub messages_sent: Counter,
    pub bytes_sent: Counter,
    pub messages_received: Counter,
    pub bytes_received: Counter,
    /// ProbeReqs sent by the link monitor.
    pub probes_sent: Counter,
    /// ProbeAcks received for our probes.
    pub probes_acked: Counter,
    /// ProbeReqs from the peer that we answered.
    pub probes_answered: Counter,
    /// Times a shutdown was initiated (stays at 1: later stops are no-ops).
    pub shutdowns_initiated: Counter,
}

/// Point-in-time copy of [`EndpointStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub probes_sent: u64,
    pub probes_acked: u64,
    pub probes_answered: u64,
    pub shutdowns_initiated: u64,
}

impl EndpointStats {
    /// Capture the current values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_sent: self.messages_sent.get(),
            bytes_sent: self.bytes_sent.get(),
            messages_received: self.messages_received.get(),
            bytes_received: self.bytes_received.get(),
            probes_sent: self.probes_sent.get(),
            probes_acked: self.probes_acked.get(),
            probes_answered: self.probes_answered.get(),
            shutdowns_initiated: self.shutdowns_initiated.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = EndpointStats::default();
        stats.messages_sent.inc();
        stats.bytes_sent.add(128);
        stats.probes_sent.inc();
        stats.probes_sent.inc();
        let snap = stats.snapshot();
        assert_eq!(snap.messages_sent, 1);
        assert_eq!(snap.bytes_sent, 128);
        assert_eq!(snap.probes_sent, 2);
        assert_eq!(snap.messages_received, 0);
    }
}
