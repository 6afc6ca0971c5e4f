//! Sink counters.
//!
//! Plain atomics read by the status procedure; no exporter is wired in.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by a running pipeline.
#[derive(Debug, Default)]
pub struct SinkMetrics {
    received: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    batches: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Events consumed from the transport.
    pub received: u64,
    /// Events successfully applied to the graph.
    pub applied: u64,
    /// Events that failed to apply.
    pub failed: u64,
    /// Failed events routed to the dead-letter topic.
    pub dead_lettered: u64,
    /// Batches processed.
    pub batches: u64,
}

impl SinkMetrics {
    pub fn record_received(&self, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_applied(&self, n: u64) {
        self.applied.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_failed(&self, n: u64) {
        self.failed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self, n: u64) {
        self.dead_lettered.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
        }
    }
}
