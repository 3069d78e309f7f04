//! # shardflow CDC import
//!
//! Moves change events from many per-shard channels into one downstream
//! sink and advances each channel's checkpoint once the sink confirms the
//! batch.
//!
//! - [`channel`] - Per-shard record channels (`PipelineChannel`)
//! - [`ordering`] - CSN merge reconstructing global commit order
//! - [`independent`] - Per-channel dispatch without ordering
//! - [`ack`] - Bounded cache of in-flight batches awaiting acks
//! - [`importer`] - Dispatch loop and lifecycle
//! - [`registry`] - Routing of out-of-band acks to importers
//! - [`testing`] - Recording sink and test helpers
//!
//! ## Data flow
//!
//! ```text
//! channel(peek/poll/fetch) -> ordering | independent -> AckCache.put
//!                                                    -> ImporterSink::write(ack_id)
//! ImporterRegistry::ack(importer_id, ack_id) -> Importer::ack
//!     -> AckCache.take -> channel.ack(last record) + progress
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(
    test,
    allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss,
        clippy::similar_names,
        clippy::too_many_lines
    )
)]

/// Importer error types.
pub mod error;

/// Importer configuration.
pub mod config;

/// Importer metrics.
pub mod metrics;

/// Record model.
pub mod record;

/// Per-shard record channels.
pub mod channel;

/// Progress reporting.
pub mod progress;

/// Channel members.
pub mod member;

/// Sink contract.
pub mod sink;

/// Write throttling.
pub mod rate_limit;

/// In-flight batch tracking.
pub mod ack;

/// CSN merge.
pub mod ordering;

/// Unordered per-channel dispatch.
pub mod independent;

/// Importer id to importer lookup.
pub mod registry;

/// Importer orchestration.
pub mod importer;

/// Testing utilities (recording sink, helpers).
pub mod testing;

pub use ack::{AckCache, AckEntry};
pub use channel::{MemoryPipelineChannel, PipelineChannel};
pub use config::{ImporterConfig, JobConfig};
pub use error::{ImporterError, Result};
pub use importer::{Importer, ImporterState};
pub use member::ChannelMember;
pub use metrics::ImporterMetricsSnapshot;
pub use progress::{IncrementalProgress, ProgressListener};
pub use rate_limit::{JobOperationType, RateLimiter};
pub use record::{Csn, DataRecord, IngestPosition, Record, RowOperation};
pub use registry::ImporterRegistry;
pub use sink::{AckId, ImporterSink, WriteResult};
