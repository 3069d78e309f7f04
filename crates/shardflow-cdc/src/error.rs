//! Importer error types.
//!
//! A single error enum covers every failure the dispatcher can surface:
//! configuration problems, lifecycle misuse, sink write failures and
//! violations of the merge invariants.

use thiserror::Error;

/// Errors that can occur while configuring or running an importer.
#[derive(Debug, Error)]
pub enum ImporterError {
    /// Invalid importer configuration.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// A batch that must contain a data record did not.
    ///
    /// This is a logic fault in the merge and aborts the dispatch loop.
    #[error("batch from channel '{member}' has no data record")]
    MissingDataRecord {
        /// Name of the channel member the batch came from.
        member: String,
    },

    /// The importer is not in the expected lifecycle state.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// The expected state.
        expected: String,
        /// The actual state.
        actual: String,
    },

    /// The sink rejected a batch.
    #[error("write error: {0}")]
    WriteError(String),

    /// A channel was closed while records were still being pushed into it.
    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ImporterError>;
