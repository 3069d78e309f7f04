//! Importer metrics.
//!
//! Counters are updated by the dispatch loop and by ack delivery; read them
//! through [`ImporterMetrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by one importer.
#[derive(Debug)]
pub struct ImporterMetrics {
    /// Batches handed to the sink.
    pub batches_dispatched: AtomicU64,

    /// Data records handed to the sink.
    pub records_dispatched: AtomicU64,

    /// Acks that matched an in-flight batch.
    pub acks_total: AtomicU64,

    /// Acks for unknown, expired or already acknowledged ids.
    pub unknown_acks_total: AtomicU64,

    /// Control-only batches acknowledged without a sink write.
    pub control_batches_total: AtomicU64,

    /// Sink write failures.
    pub write_errors_total: AtomicU64,
}

impl ImporterMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self {
            batches_dispatched: AtomicU64::new(0),
            records_dispatched: AtomicU64::new(0),
            acks_total: AtomicU64::new(0),
            unknown_acks_total: AtomicU64::new(0),
            control_batches_total: AtomicU64::new(0),
            write_errors_total: AtomicU64::new(0),
        }
    }

    /// Records a batch handed to the sink.
    pub fn record_dispatch(&self, record_count: u64) {
        self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
        self.records_dispatched
            .fetch_add(record_count, Ordering::Relaxed);
    }

    /// Records an ack that matched an in-flight batch.
    pub fn record_ack(&self) {
        self.acks_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an ack with no matching batch.
    pub fn record_unknown_ack(&self) {
        self.unknown_acks_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a control-only batch.
    pub fn record_control_batch(&self) {
        self.control_batches_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a sink write failure.
    pub fn record_write_error(&self) {
        self.write_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of the current metrics.
    #[must_use]
    pub fn snapshot(&self) -> ImporterMetricsSnapshot {
        ImporterMetricsSnapshot {
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            records_dispatched: self.records_dispatched.load(Ordering::Relaxed),
            acks_total: self.acks_total.load(Ordering::Relaxed),
            unknown_acks_total: self.unknown_acks_total.load(Ordering::Relaxed),
            control_batches_total: self.control_batches_total.load(Ordering::Relaxed),
            write_errors_total: self.write_errors_total.load(Ordering::Relaxed),
        }
    }
}

impl Default for ImporterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of importer metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImporterMetricsSnapshot {
    /// Batches handed to the sink.
    pub batches_dispatched: u64,

    /// Data records handed to the sink.
    pub records_dispatched: u64,

    /// Matched acks.
    pub acks_total: u64,

    /// Unmatched acks.
    pub unknown_acks_total: u64,

    /// Control-only batches.
    pub control_batches_total: u64,

    /// Sink write failures.
    pub write_errors_total: u64,
}
