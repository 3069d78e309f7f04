//! Per-shard record channels.
//!
//! A [`PipelineChannel`] sits between one change-log reader (the producer)
//! and the importer (the consumer). Producers push whole batches; the
//! importer peeks, polls or fetches them and acknowledges them once the sink
//! has made them durable. Acknowledging a record acknowledges everything the
//! channel delivered up to and including it.
//!
//! Acks are cumulative, so an ack for a batch that an earlier ack already
//! covered is stale: [`MemoryPipelineChannel`] ignores it and its checkpoint
//! never moves backwards.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ImporterError, Result};
use crate::record::{IngestPosition, Record};

/// Consumer side of a per-shard record channel.
#[async_trait]
pub trait PipelineChannel: Send + Sync {
    /// Returns the head batch without consuming it.
    ///
    /// Returns an empty vector when nothing is buffered.
    fn peek(&self) -> Vec<Record>;

    /// Removes and returns the head batch without blocking.
    ///
    /// Returns an empty vector when nothing is buffered.
    fn poll(&self) -> Vec<Record>;

    /// Collects up to roughly `batch_size` records, waiting at most `timeout`.
    ///
    /// Batches are never split, so the result may exceed `batch_size` by
    /// less than one batch. Returns early once an end-of-stream record has
    /// been collected.
    async fn fetch(&self, batch_size: usize, timeout: Duration) -> Vec<Record>;

    /// Acknowledges everything delivered up to and including the last record.
    ///
    /// Acks for records an earlier ack already covered are ignored. When
    /// several unacknowledged batches end at the same position, the oldest
    /// one is matched.
    fn ack(&self, records: &[Record]);
}

/// Callback invoked with every acknowledged batch.
pub type AckCallback = Arc<dyn Fn(&[Record]) + Send + Sync>;

struct ChannelState {
    batches: VecDeque<Vec<Record>>,
    closed: bool,
}

#[derive(Default)]
struct AckState {
    // Last position and record count of every delivered batch not yet
    // covered by an ack, oldest first.
    outstanding: VecDeque<(IngestPosition, usize)>,
    position: Option<IngestPosition>,
    records: u64,
}

/// Bounded in-memory channel holding whole batches.
pub struct MemoryPipelineChannel {
    capacity: usize,
    state: Mutex<ChannelState>,
    pushed: Notify,
    drained: Notify,
    acked: Mutex<AckState>,
    ack_callback: Option<AckCallback>,
}

impl MemoryPipelineChannel {
    /// Creates a channel buffering at most `capacity` batches.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(ChannelState {
                batches: VecDeque::new(),
                closed: false,
            }),
            pushed: Notify::new(),
            drained: Notify::new(),
            acked: Mutex::new(AckState::default()),
            ack_callback: None,
        }
    }

    /// Creates a channel that reports every acknowledgment to `callback`.
    #[must_use]
    pub fn with_ack_callback(capacity: usize, callback: AckCallback) -> Self {
        Self {
            ack_callback: Some(callback),
            ..Self::new(capacity)
        }
    }

    /// Pushes a batch, waiting while the channel is full.
    ///
    /// Empty batches are ignored.
    ///
    /// # Errors
    ///
    /// Returns `ImporterError::ChannelClosed` if the channel was closed.
    pub async fn push(&self, records: Vec<Record>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(ImporterError::ChannelClosed(
                        "push into closed channel".into(),
                    ));
                }
                if state.batches.len() < self.capacity {
                    state.batches.push_back(records);
                    drop(state);
                    self.pushed.notify_one();
                    return Ok(());
                }
            }
            self.drained.notified().await;
        }
    }

    /// Pushes a batch if there is room, without waiting.
    ///
    /// Returns the batch back when the channel is full or closed.
    pub fn try_push(&self, records: Vec<Record>) -> std::result::Result<(), Vec<Record>> {
        let mut state = self.state.lock();
        if state.closed || state.batches.len() >= self.capacity {
            return Err(records);
        }
        if !records.is_empty() {
            state.batches.push_back(records);
            drop(state);
            self.pushed.notify_one();
        }
        Ok(())
    }

    /// Rejects further pushes. Buffered batches stay readable.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.drained.notify_waiters();
    }

    /// Returns the number of buffered batches.
    #[must_use]
    pub fn buffered_batches(&self) -> usize {
        self.state.lock().batches.len()
    }

    /// Returns the position of the last acknowledged record.
    #[must_use]
    pub fn acked_position(&self) -> Option<IngestPosition> {
        self.acked.lock().position.clone()
    }

    /// Returns how many delivered records have been covered by
    /// acknowledgments.
    #[must_use]
    pub fn acked_records(&self) -> u64 {
        self.acked.lock().records
    }

    fn take_head(&self) -> Option<Vec<Record>> {
        let batch = self.state.lock().batches.pop_front()?;
        self.drained.notify_one();
        if let Some(last) = batch.last() {
            self.acked
                .lock()
                .outstanding
                .push_back((last.position().clone(), batch.len()));
        }
        Some(batch)
    }
}

#[async_trait]
impl PipelineChannel for MemoryPipelineChannel {
    fn peek(&self) -> Vec<Record> {
        self.state
            .lock()
            .batches
            .front()
            .cloned()
            .unwrap_or_default()
    }

    fn poll(&self) -> Vec<Record> {
        self.take_head().unwrap_or_default()
    }

    async fn fetch(&self, batch_size: usize, timeout: Duration) -> Vec<Record> {
        let deadline = Instant::now() + timeout;
        let mut result = Vec::new();
        loop {
            while result.len() < batch_size {
                match self.take_head() {
                    Some(batch) => result.extend(batch),
                    None => break,
                }
            }
            if result.len() >= batch_size || result.last().is_some_and(Record::is_finished) {
                return result;
            }
            let now = Instant::now();
            if now >= deadline {
                return result;
            }
            if tokio::time::timeout(deadline - now, self.pushed.notified())
                .await
                .is_err()
            {
                // One last drain so a push racing the deadline is not missed.
                while result.len() < batch_size {
                    match self.take_head() {
                        Some(batch) => result.extend(batch),
                        None => break,
                    }
                }
                return result;
            }
        }
    }

    fn ack(&self, records: &[Record]) {
        let Some(last) = records.last() else {
            return;
        };
        let position = last.position();
        {
            let mut acked = self.acked.lock();
            let Some(index) = acked.outstanding.iter().position(|(p, _)| p == position) else {
                debug!(%position, "ignoring ack for a position that is not outstanding");
                return;
            };
            let covered: usize = acked.outstanding.drain(..=index).map(|(_, n)| n).sum();
            acked.records += covered as u64;
            acked.position = Some(position.clone());
        }
        if let Some(callback) = &self.ack_callback {
            callback(records);
        }
    }
}

impl fmt::Debug for MemoryPipelineChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPipelineChannel")
            .field("capacity", &self.capacity)
            .field("buffered_batches", &self.buffered_batches())
            .field("acked_position", &self.acked_position())
            .finish_non_exhaustive()
    }
}
