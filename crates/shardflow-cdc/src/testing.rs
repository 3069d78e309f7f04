//! Testing utilities for importers.
//!
//! Provides an in-memory recording sink and helpers to build channel
//! members and record batches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::channel::{MemoryPipelineChannel, PipelineChannel};
use crate::error::{ImporterError, Result};
use crate::member::ChannelMember;
use crate::progress::IncrementalProgress;
use crate::record::{Csn, DataRecord, IngestPosition, Record, RowOperation};
use crate::registry::ImporterRegistry;
use crate::sink::{AckId, ImporterSink, WriteResult};

/// Capacity of channels created by [`member_with_channel`].
pub const TEST_CHANNEL_CAPACITY: usize = 64;

/// Creates a member backed by a fresh in-memory channel and counting
/// listener, returning handles to both.
#[must_use]
pub fn member_with_channel(
    name: &str,
) -> (
    ChannelMember,
    Arc<MemoryPipelineChannel>,
    Arc<IncrementalProgress>,
) {
    let channel = Arc::new(MemoryPipelineChannel::new(TEST_CHANNEL_CAPACITY));
    let progress = Arc::new(IncrementalProgress::new());
    let member = ChannelMember::new(
        name,
        Arc::clone(&channel) as Arc<dyn PipelineChannel>,
        Arc::clone(&progress) as Arc<dyn crate::progress::ProgressListener>,
    );
    (member, channel, progress)
}

/// Creates one insert data record per CSN, positioned at `csn-<n>`.
#[must_use]
pub fn data_batch(csns: &[Csn]) -> Vec<Record> {
    csns.iter()
        .map(|&csn| {
            Record::Data(
                DataRecord::new(csn, "t_order", RowOperation::Insert)
                    .with_position(IngestPosition::new(format!("csn-{csn}"))),
            )
        })
        .collect()
}

/// Polls `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition was met.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// One write captured by [`RecordingSink`].
#[derive(Debug, Clone)]
pub struct RecordedWrite {
    /// Ack id the batch was written with.
    pub ack_id: AckId,
    /// Records of the batch.
    pub records: Vec<DataRecord>,
}

/// Sink that keeps every write in memory.
///
/// Optionally acknowledges each write right away through a registry, the
/// way a synchronous downstream would.
#[derive(Debug, Default)]
pub struct RecordingSink {
    writes: Mutex<Vec<RecordedWrite>>,
    fail_writes: AtomicBool,
    auto_ack: Mutex<Option<(ImporterRegistry, String)>>,
}

impl RecordingSink {
    /// Creates a sink that records writes and never acknowledges.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acknowledges every subsequent write through `registry` for the
    /// importer registered under `importer_id`.
    pub fn auto_ack(&self, registry: ImporterRegistry, importer_id: impl Into<String>) {
        *self.auto_ack.lock() = Some((registry, importer_id.into()));
    }

    /// Makes subsequent writes fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Returns all recorded writes.
    #[must_use]
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.writes.lock().clone()
    }

    /// Returns the number of recorded writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    /// Returns the CSNs of every write, one vector per write.
    #[must_use]
    pub fn csns(&self) -> Vec<Vec<Csn>> {
        self.writes
            .lock()
            .iter()
            .map(|w| w.records.iter().map(|r| r.csn).collect())
            .collect()
    }
}

#[async_trait]
impl ImporterSink for RecordingSink {
    async fn write(&self, ack_id: &AckId, records: Vec<DataRecord>) -> Result<WriteResult> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(ImporterError::WriteError("injected failure".into()));
        }
        let count = records.len();
        self.writes.lock().push(RecordedWrite {
            ack_id: ack_id.clone(),
            records,
        });
        let auto_ack = self.auto_ack.lock().clone();
        if let Some((registry, importer_id)) = auto_ack {
            registry.ack(&importer_id, ack_id);
        }
        Ok(WriteResult::new(count))
    }
}
