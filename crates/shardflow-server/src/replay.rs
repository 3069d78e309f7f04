//! Replay of recorded change logs through an importer.
//!
//! A replay file is JSON mapping channel names to their batches:
//!
//! ```json
//! {
//!   "channels": {
//!     "ds_0": [[{"type": "data", "csn": 5, "table": "t_order", "operation": "INSERT"}]],
//!     "ds_1": [[{"type": "finished", "position": "binlog.000003:4"}]]
//!   }
//! }
//! ```
//!
//! Channels without a trailing finished record get one appended to their
//! last batch so the replay terminates.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shardflow_cdc::{
    AckId, ChannelMember, Csn, DataRecord, Importer, ImporterConfig, ImporterError,
    ImporterMetricsSnapshot, ImporterRegistry, ImporterSink, IncrementalProgress, JobConfig,
    MemoryPipelineChannel, PipelineChannel, ProgressListener, Record, WriteResult,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Recorded batches per channel.
#[derive(Debug, Default, Deserialize)]
pub struct ReplayFile {
    /// Batches keyed by channel name.
    pub channels: BTreeMap<String, Vec<Vec<Record>>>,
}

impl ReplayFile {
    /// Loads a replay file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading replay file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parsing replay file {}", path.display()))
    }

    fn ensure_finished(&mut self) {
        for (name, batches) in &mut self.channels {
            let finished = batches
                .last()
                .and_then(|batch| batch.last())
                .is_some_and(Record::is_finished);
            if finished {
                continue;
            }
            let end = Record::finished(format!("{name}:end"));
            match batches.last_mut() {
                Some(batch) => batch.push(end),
                None => batches.push(vec![end]),
            }
        }
    }
}

#[derive(Serialize)]
struct OutputLine<'a> {
    ack_id: &'a AckId,
    records: &'a [DataRecord],
}

/// Sink writing each batch as one JSON line and acknowledging it through a
/// separate task.
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
    dispatched: Mutex<Vec<Vec<Csn>>>,
    acks: mpsc::UnboundedSender<AckId>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    /// Creates a sink over `writer` that forwards ack ids to `acks`.
    pub fn new(writer: W, acks: mpsc::UnboundedSender<AckId>) -> Self {
        Self {
            writer: Mutex::new(writer),
            dispatched: Mutex::new(Vec::new()),
            acks,
        }
    }

    /// Consumes the sink, returning the writer and the CSNs of every batch.
    pub fn into_parts(self) -> (W, Vec<Vec<Csn>>) {
        (self.writer.into_inner(), self.dispatched.into_inner())
    }
}

#[async_trait]
impl<W: Write + Send> ImporterSink for JsonLinesSink<W> {
    async fn write(
        &self,
        ack_id: &AckId,
        records: Vec<DataRecord>,
    ) -> shardflow_cdc::Result<WriteResult> {
        {
            let mut writer = self.writer.lock();
            serde_json::to_writer(
                &mut *writer,
                &OutputLine {
                    ack_id,
                    records: &records,
                },
            )
            .map_err(|e| ImporterError::WriteError(e.to_string()))?;
            writer
                .write_all(b"\n")
                .map_err(|e| ImporterError::WriteError(e.to_string()))?;
        }
        self.dispatched
            .lock()
            .push(records.iter().map(|r| r.csn).collect());
        self.acks
            .send(ack_id.clone())
            .map_err(|_| ImporterError::WriteError("ack task is gone".into()))?;
        Ok(WriteResult::new(records.len()))
    }
}

/// Outcome of a replay.
#[derive(Debug)]
pub struct ReplaySummary {
    /// Importer counters at the end of the run.
    pub metrics: ImporterMetricsSnapshot,
    /// Data records acknowledged per channel.
    pub processed: BTreeMap<String, u64>,
    /// Commit sequence numbers in dispatch order, one vector per batch.
    pub dispatched: Vec<Vec<Csn>>,
}

/// Runs a replay to completion, writing batches to `writer`.
pub async fn run<W>(job: &JobConfig, mut replay: ReplayFile, writer: W) -> Result<(ReplaySummary, W)>
where
    W: Write + Send + 'static,
{
    let config = ImporterConfig::from_config(job)?;
    replay.ensure_finished();

    let mut members = Vec::with_capacity(replay.channels.len());
    let mut producers = Vec::with_capacity(replay.channels.len());
    let mut progress = Vec::with_capacity(replay.channels.len());
    for (name, batches) in replay.channels {
        let channel = Arc::new(MemoryPipelineChannel::new(batches.len().max(1)));
        let listener = Arc::new(IncrementalProgress::new());
        members.push(ChannelMember::new(
            name.as_str(),
            Arc::clone(&channel) as Arc<dyn PipelineChannel>,
            Arc::clone(&listener) as Arc<dyn ProgressListener>,
        ));
        progress.push((name, listener));
        producers.push((channel, batches));
    }
    for (channel, batches) in producers {
        for batch in batches {
            channel.push(batch).await?;
        }
        channel.close();
    }

    let registry = ImporterRegistry::new();
    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
    let sink = Arc::new(JsonLinesSink::new(writer, ack_tx));
    let importer = Importer::new(
        config,
        members,
        Arc::clone(&sink) as Arc<dyn ImporterSink>,
        None,
        registry.clone(),
    )?;

    let importer_id = importer.id().to_string();
    let acker = tokio::spawn(async move {
        while let Some(ack_id) = ack_rx.recv().await {
            debug!(%ack_id, "acknowledging batch");
            registry.ack(&importer_id, &ack_id);
        }
    });

    info!(job = job.job_name(), importer_id = importer.id(), "replay started");
    // Returns once every channel's batches have been acknowledged.
    importer.run().await?;
    let metrics = importer.metrics();
    drop(importer);
    acker.abort();
    let _ = acker.await;

    let processed = progress
        .into_iter()
        .map(|(name, listener)| (name, listener.processed_records()))
        .collect();
    let sink = Arc::try_unwrap(sink)
        .map_err(|_| anyhow::anyhow!("sink still shared after replay"))?;
    let (writer, dispatched) = sink.into_parts();
    info!(
        job = job.job_name(),
        batches = metrics.batches_dispatched,
        records = metrics.records_dispatched,
        "replay finished"
    );
    Ok((
        ReplaySummary {
            metrics,
            processed,
            dispatched,
        },
        writer,
    ))
}
