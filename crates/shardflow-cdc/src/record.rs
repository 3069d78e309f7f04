//! Change records flowing from source channels to the sink.
//!
//! A channel delivers a stream of [`Record`]s. Only [`DataRecord`]s are
//! written to the sink; [`PlaceholderRecord`]s and [`FinishedRecord`]s are
//! control records that exist so the channel checkpoint can advance.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Commit sequence number: the merge key used to rebuild global commit order.
pub type Csn = i64;

/// Opaque source position (binlog file/offset, WAL LSN, primary-key cursor).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IngestPosition(String);

impl IngestPosition {
    /// Creates a position from its textual form.
    #[must_use]
    pub fn new(position: impl Into<String>) -> Self {
        Self(position.into())
    }

    /// Returns the textual form of the position.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IngestPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Row-level operation carried by a data record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RowOperation {
    /// Row inserted.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
}

impl fmt::Display for RowOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowOperation::Insert => write!(f, "INSERT"),
            RowOperation::Update => write!(f, "UPDATE"),
            RowOperation::Delete => write!(f, "DELETE"),
        }
    }
}

/// A single row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    /// Commit sequence number of the transaction this change belongs to.
    pub csn: Csn,
    /// Logic table name.
    pub table: String,
    /// Row operation.
    pub operation: RowOperation,
    /// Source position of this change.
    #[serde(default)]
    pub position: IngestPosition,
    /// Row image.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl DataRecord {
    /// Creates a data record with an empty payload.
    #[must_use]
    pub fn new(csn: Csn, table: impl Into<String>, operation: RowOperation) -> Self {
        Self {
            csn,
            table: table.into(),
            operation,
            position: IngestPosition::default(),
            payload: serde_json::Value::Null,
        }
    }

    /// Sets the source position.
    #[must_use]
    pub fn with_position(mut self, position: IngestPosition) -> Self {
        self.position = position;
        self
    }

    /// Sets the row image.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Position-only control record, e.g. a transaction boundary or heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderRecord {
    /// Source position reached.
    #[serde(default)]
    pub position: IngestPosition,
}

/// End-of-stream sentinel for one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedRecord {
    /// Final source position.
    #[serde(default)]
    pub position: IngestPosition,
}

/// A record delivered by a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    /// Row change destined for the sink.
    Data(DataRecord),
    /// Control record that only advances the position.
    Placeholder(PlaceholderRecord),
    /// The channel has no more records.
    Finished(FinishedRecord),
}

impl Record {
    /// Shorthand for a data record with an empty payload.
    #[must_use]
    pub fn data(csn: Csn, table: impl Into<String>, operation: RowOperation) -> Self {
        Record::Data(DataRecord::new(csn, table, operation))
    }

    /// Shorthand for a finished record at the given position.
    #[must_use]
    pub fn finished(position: impl Into<String>) -> Self {
        Record::Finished(FinishedRecord {
            position: IngestPosition::new(position),
        })
    }

    /// Shorthand for a placeholder record at the given position.
    #[must_use]
    pub fn placeholder(position: impl Into<String>) -> Self {
        Record::Placeholder(PlaceholderRecord {
            position: IngestPosition::new(position),
        })
    }

    /// Returns the source position of this record.
    #[must_use]
    pub fn position(&self) -> &IngestPosition {
        match self {
            Record::Data(r) => &r.position,
            Record::Placeholder(r) => &r.position,
            Record::Finished(r) => &r.position,
        }
    }

    /// Returns the data record, if this is one.
    #[must_use]
    pub fn as_data(&self) -> Option<&DataRecord> {
        match self {
            Record::Data(r) => Some(r),
            _ => None,
        }
    }

    /// Returns `true` for the end-of-stream sentinel.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, Record::Finished(_))
    }
}

/// Returns the first data record of a batch.
#[must_use]
pub fn first_data_record(records: &[Record]) -> Option<&DataRecord> {
    records.iter().find_map(Record::as_data)
}

/// Counts the data records of a batch.
#[must_use]
pub fn count_data_records(records: &[Record]) -> usize {
    records.iter().filter(|r| r.as_data().is_some()).count()
}

/// Extracts the data records of a batch, dropping control records.
#[must_use]
pub fn into_data_records(records: Vec<Record>) -> Vec<DataRecord> {
    records
        .into_iter()
        .filter_map(|r| match r {
            Record::Data(data) => Some(data),
            _ => None,
        })
        .collect()
}
