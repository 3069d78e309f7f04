//! Per-channel dispatch without cross-channel ordering.
//!
//! Used when every channel is consistent on its own downstream. Each member
//! is fetched in turn and its batch becomes one sink write; nothing is held
//! back waiting for other channels.

use std::time::Duration;

use tracing::trace;

use crate::error::Result;
use crate::member::ChannelMember;
use crate::ordering::{ControlBatch, DispatchBatch};
use crate::record;

/// What one member's fetch produced.
#[derive(Debug)]
pub enum FetchedBatch {
    /// Nothing arrived before the timeout.
    Empty,
    /// Only control records arrived.
    Control(ControlBatch),
    /// Data to write to the sink.
    Data(DispatchBatch),
}

/// Fetches one batch per member and classifies it.
#[derive(Debug, Clone, Copy)]
pub struct IndependentDispatcher {
    batch_size: usize,
    fetch_timeout: Duration,
}

impl IndependentDispatcher {
    /// Creates a dispatcher fetching up to `batch_size` records per member,
    /// waiting at most `fetch_timeout` for each.
    #[must_use]
    pub fn new(batch_size: usize, fetch_timeout: Duration) -> Self {
        Self {
            batch_size,
            fetch_timeout,
        }
    }

    /// Fetches the next batch of `member`.
    ///
    /// Control-only batches that do not end the stream are acknowledged on
    /// the channel before this returns.
    ///
    /// # Errors
    ///
    /// Returns `ImporterError::MissingDataRecord` only on an internal
    /// inconsistency while building the sink batch.
    pub async fn fetch(&self, member: &ChannelMember) -> Result<FetchedBatch> {
        let records = member
            .channel()
            .fetch(self.batch_size, self.fetch_timeout)
            .await;
        if records.is_empty() {
            return Ok(FetchedBatch::Empty);
        }
        if record::first_data_record(&records).is_none() {
            return Ok(FetchedBatch::Control(ControlBatch::new(member, records)));
        }
        trace!(member = member.name(), records = records.len(), "fetched batch");
        DispatchBatch::from_member(member.clone(), records).map(FetchedBatch::Data)
    }
}
