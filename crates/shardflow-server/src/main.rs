//! shardflow replay tool
//!
//! Feeds recorded per-shard change logs through the CDC importer and writes
//! the dispatched batches as JSON lines.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod job;
mod replay;

/// shardflow - replay sharded change logs through the CDC importer
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Job file path
    #[arg(short, long, default_value = "shardflow.toml")]
    config: PathBuf,

    /// Replay file (overrides the job file's `replay`)
    #[arg(short, long)]
    replay: Option<PathBuf>,

    /// Output file for dispatched batches (stdout if omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("shardflow={0},shardflow_cdc={0}", args.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    info!("Starting shardflow {}", env!("CARGO_PKG_VERSION"));
    info!("Job file: {}", args.config.display());

    let job = job::load(&args.config)?;
    let replay_path = args
        .replay
        .or(job.replay)
        .context("no replay file given on the command line or in the job file")?;
    let replay = replay::ReplayFile::load(&replay_path)?;

    let writer: Box<dyn Write + Send> = match &args.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout())),
    };

    let (summary, mut writer) = replay::run(&job.config, replay, writer).await?;
    writer.flush()?;

    info!(
        batches = summary.metrics.batches_dispatched,
        records = summary.metrics.records_dispatched,
        acks = summary.metrics.acks_total,
        control_batches = summary.metrics.control_batches_total,
        highest_csn = ?summary.dispatched.iter().flatten().max(),
        "Replay complete"
    );
    for (channel, processed) in &summary.processed {
        info!(channel = channel.as_str(), processed, "channel drained");
    }
    Ok(())
}
