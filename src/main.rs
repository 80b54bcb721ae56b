//! spillway: run the write pipeline over a JSON-lines message file.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use spillway::logging;
use spillway::output::{DirectoryLauncher, JsonLinesEmitter};
use spillway::{DestinationMessage, Pipeline, PipelineConfig, SizedInput, StreamDescriptor};

/// Batch destination messages to disk under a fixed memory budget
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "SPILLWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Read messages from this file instead of stdin
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Directory finished batches are moved into
    #[arg(short, long, default_value = "spillway-out")]
    output: PathBuf,

    /// Directory for in-progress batch files
    #[arg(long)]
    spill_dir: Option<PathBuf>,

    /// Memory budget in bytes
    #[arg(long)]
    memory_budget: Option<u64>,

    /// Cut a batch once it holds this many bytes
    #[arg(long)]
    max_batch_bytes: Option<u64>,

    /// Partitions per stream
    #[arg(short, long)]
    partitions: Option<usize>,

    /// Declared stream (`namespace.name` or `name`); repeatable
    #[arg(short, long = "stream")]
    streams: Vec<StreamDescriptor>,
}

impl Args {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(dir) = &self.spill_dir {
            config.spill_dir = dir.clone();
        }
        if let Some(bytes) = self.memory_budget {
            config.memory_budget_bytes = bytes;
        }
        if let Some(bytes) = self.max_batch_bytes {
            config.max_batch_bytes = bytes;
        }
        if let Some(partitions) = self.partitions {
            config.partitions_per_stream = partitions;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_tracing();

    let mut config = args.pipeline_config()?;
    let streams = match (&args.input, args.streams.is_empty()) {
        (_, false) => args.streams.clone(),
        (Some(path), true) => discover_streams(path).await?,
        (None, true) => anyhow::bail!("--stream is required when reading from stdin"),
    };
    if args.max_batch_bytes.is_none() {
        fit_batch_size(&mut config, streams.len());
    }
    tracing::info!(
        streams = streams.len(),
        output = %args.output.display(),
        spill_dir = %config.spill_dir.display(),
        "starting sync"
    );

    let launcher = Arc::new(DirectoryLauncher::new(&args.output));
    let emitter = Arc::new(JsonLinesEmitter::new(tokio::io::stdout()));
    let pipeline = Pipeline::with_default_flush(config, streams, launcher, emitter)?;
    let (producer, flow) = pipeline.input();

    let reader = tokio::spawn(read_input(args.input.clone(), producer));

    let run = pipeline.run(flow).await;
    let read = reader.await.context("input reader panicked")?;

    // A pipeline failure also breaks the reader; report the pipeline's error.
    let summary = run?;
    read?;

    for (stream, count) in &summary.records {
        tracing::info!(stream = %stream, records = count, "stream summary");
    }
    tracing::info!(
        batches = summary.batches,
        bytes = summary.bytes_flushed,
        checkpoints = summary.checkpoints_emitted,
        memory_high_water_bytes = summary.memory_high_water_bytes,
        "sync finished"
    );
    Ok(())
}

/// Shrink the batch size so every spill lane can hold an open batch at once.
fn fit_batch_size(config: &mut PipelineConfig, streams: usize) {
    if config.lane_bytes(streams) <= config.memory_budget_bytes {
        return;
    }
    let lanes = streams.saturating_mul(config.partitions_per_stream).max(1);
    let fitted = (config.memory_budget_bytes / lanes as u64).max(1);
    tracing::warn!(
        streams,
        from = config.max_batch_bytes,
        to = fitted,
        "lowering max_batch_bytes to fit memory budget"
    );
    config.max_batch_bytes = fitted;
}

async fn read_input(source: Option<PathBuf>, producer: SizedInput) -> Result<()> {
    let result = match source {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            feed(BufReader::new(file), &producer).await
        }
        None => feed(BufReader::new(tokio::io::stdin()), &producer).await,
    };
    producer.close();
    result
}

/// Parse JSON lines from `reader` and push them into the pipeline.
async fn feed<R>(reader: R, producer: &SizedInput) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_no = 0u64;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let mut message = parse_message(&line).with_context(|| format!("line {line_no}"))?;
        stamp_emitted_at(&mut message);
        producer.send(message).await?;
    }
    Ok(())
}

fn parse_message(line: &str) -> Result<DestinationMessage> {
    let mut message: DestinationMessage = serde_json::from_str(line)?;
    if let DestinationMessage::Record(record) = &mut message {
        if record.serialized_size_bytes == 0 {
            record.serialized_size_bytes = line.len() as u64;
        }
    }
    Ok(message)
}

fn stamp_emitted_at(message: &mut DestinationMessage) {
    let now = Utc::now().timestamp_millis();
    match message {
        DestinationMessage::Record(record) if record.emitted_at_ms == 0 => {
            record.emitted_at_ms = now;
        }
        DestinationMessage::StreamComplete { emitted_at_ms, .. }
        | DestinationMessage::StreamIncomplete { emitted_at_ms, .. }
            if *emitted_at_ms == 0 =>
        {
            *emitted_at_ms = now;
        }
        _ => {}
    }
}

/// First pass over `path`: every stream mentioned, in sorted order.
async fn discover_streams(path: &Path) -> Result<Vec<StreamDescriptor>> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut streams = BTreeSet::new();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message: DestinationMessage = serde_json::from_str(&line)?;
        match &message {
            DestinationMessage::GlobalCheckpoint(global) => {
                streams.extend(global.per_stream_checkpoints.iter().map(|c| c.stream.clone()));
            }
            other => streams.extend(other.stream().cloned()),
        }
    }
    if streams.is_empty() {
        anyhow::bail!("no streams found in {}", path.display());
    }
    Ok(streams.into_iter().collect())
}
