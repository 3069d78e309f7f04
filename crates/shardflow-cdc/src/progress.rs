//! Progress reporting for channel members.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Receives processed-record counts for one channel.
///
/// Called once per acknowledged batch, from whichever task delivers the ack.
pub trait ProgressListener: Send + Sync {
    /// Reports that `processed_records` more data records were applied.
    fn on_progress_updated(&self, processed_records: usize);
}

/// Listener that accumulates processed records and update calls.
#[derive(Default)]
pub struct IncrementalProgress {
    processed_records: AtomicU64,
    updates: AtomicU64,
}

impl IncrementalProgress {
    /// Creates a listener with zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total data records reported so far.
    #[must_use]
    pub fn processed_records(&self) -> u64 {
        self.processed_records.load(Ordering::Relaxed)
    }

    /// Number of progress reports received, including zero-count ones.
    #[must_use]
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }
}

impl ProgressListener for IncrementalProgress {
    fn on_progress_updated(&self, processed_records: usize) {
        self.processed_records
            .fetch_add(processed_records as u64, Ordering::Relaxed);
        self.updates.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for IncrementalProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncrementalProgress")
            .field("processed_records", &self.processed_records())
            .field("updates", &self.updates())
            .finish()
    }
}
