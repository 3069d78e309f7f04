//! Downstream sink contract.
//!
//! The importer hands every dispatched batch to an [`ImporterSink`] together
//! with an [`AckId`]. Once the batch is durable downstream, the sink (or
//! whoever observes durability) calls `Importer::ack` with that id. A sink
//! that never acknowledges simply lets the entry expire from the ack cache.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::record::DataRecord;

/// Opaque token correlating a dispatched batch with its acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AckId(String);

impl AckId {
    /// Generates a fresh random ack id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Wraps an existing id, e.g. one echoed back by a remote peer.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the textual form of the id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AckId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Result of handing a batch to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    /// Number of records accepted.
    pub records_written: usize,
}

impl WriteResult {
    /// Creates a new write result.
    #[must_use]
    pub fn new(records_written: usize) -> Self {
        Self { records_written }
    }
}

/// Destination for dispatched batches.
///
/// `write` returning `Ok` means the batch was accepted for delivery, not
/// that it is durable; durability is signalled through the ack id.
#[async_trait]
pub trait ImporterSink: Send + Sync {
    /// Writes one atomic batch.
    ///
    /// # Errors
    ///
    /// Returns `ImporterError::WriteError` if the batch cannot be accepted.
    /// The importer stops dispatching after a write error.
    async fn write(&self, ack_id: &AckId, records: Vec<DataRecord>) -> Result<WriteResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ack_ids_are_unique() {
        let a = AckId::generate();
        let b = AckId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_ack_id_round_trips_text() {
        let id = AckId::from("batch-17");
        assert_eq!(id.to_string(), "batch-17");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"batch-17\"");
    }
}
