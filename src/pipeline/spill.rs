//! Spill-to-disk task.
//!
//! One task per (stream, partition). Records are appended as JSON lines to a
//! temporary file until the flush strategy cuts the batch; the finished file
//! is handed to the [`TaskLauncher`] and the records' memory is released.
//!
//! The open batch owns its temporary file and its reservations. Dropping it
//! (error, cancellation, queue closed without a terminal marker) deletes the
//! file and returns the memory, so partial batches are never handed off.

use std::ops::{Range, RangeInclusive};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;

use crate::error::{PipelineError, Result};
use crate::memory::Reservation;
use crate::message::{DestinationRecord, StreamDescriptor, WrappedMessage};
use crate::metrics::PipelineMetrics;
use crate::pipeline::flush::FlushStrategy;
use crate::queue::PartitionConsumer;

/// A finished batch file ready for loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub stream: StreamDescriptor,
    pub partition: usize,
    pub total_size_bytes: u64,
    pub record_count: u64,
    pub record_index_range: RangeInclusive<u64>,
    /// Owned by the launcher once handed off.
    pub local_file: PathBuf,
}

/// Schedules downstream processing of finished batches.
///
/// `launch` returning `Ok` means the batch is durably handed off; its records
/// then count as persisted for checkpoint release.
#[async_trait]
pub trait TaskLauncher: Send + Sync + 'static {
    async fn launch(&self, batch: Batch) -> anyhow::Result<()>;

    /// Called once per partition after its last batch, with the stream's final record count.
    async fn partition_complete(
        &self,
        _stream: &StreamDescriptor,
        _partition: usize,
        _record_count: u64,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Record indices of a stream that were handed off downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRange {
    pub stream: StreamDescriptor,
    pub range: Range<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillSummary {
    pub stream: StreamDescriptor,
    pub partition: usize,
    pub batches: u64,
    pub records: u64,
    pub bytes: u64,
    /// Saw the terminal marker (as opposed to the queue closing under it).
    pub completed: bool,
}

pub struct SpillToDisk {
    stream: StreamDescriptor,
    partition: usize,
    spill_dir: PathBuf,
    flush: Arc<dyn FlushStrategy>,
    launcher: Arc<dyn TaskLauncher>,
    persisted: mpsc::UnboundedSender<PersistedRange>,
    metrics: Arc<PipelineMetrics>,
}

impl SpillToDisk {
    pub fn new(
        stream: StreamDescriptor,
        partition: usize,
        spill_dir: PathBuf,
        flush: Arc<dyn FlushStrategy>,
        launcher: Arc<dyn TaskLauncher>,
        persisted: mpsc::UnboundedSender<PersistedRange>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            stream,
            partition,
            spill_dir,
            flush,
            launcher,
            persisted,
            metrics,
        }
    }

    pub async fn run(self, mut consumer: PartitionConsumer<WrappedMessage>) -> Result<SpillSummary> {
        let mut summary = SpillSummary {
            stream: self.stream.clone(),
            partition: self.partition,
            batches: 0,
            records: 0,
            bytes: 0,
            completed: false,
        };
        let mut open: Option<OpenBatch> = None;
        let mut last_index: Option<u64> = None;

        while let Some(message) = consumer.next().await {
            match message {
                WrappedMessage::Record {
                    index,
                    size_bytes,
                    record,
                } => {
                    if let Some(last) = last_index {
                        if index <= last {
                            return Err(PipelineError::IndexNonMonotonic {
                                stream: self.stream.clone(),
                                expected: last + 1,
                                actual: index,
                            });
                        }
                    }
                    last_index = Some(index);

                    // Keep every batch contiguous: a jump in indices (another
                    // partition took the gap) starts a new batch.
                    let mut batch = match open.take() {
                        Some(batch) if batch.last_index + 1 == index => batch,
                        Some(batch) => {
                            self.hand_off(batch, &mut summary).await?;
                            OpenBatch::create(&self.spill_dir, &self.stream, self.partition, index)?
                        }
                        None => {
                            OpenBatch::create(&self.spill_dir, &self.stream, self.partition, index)?
                        }
                    };

                    let (record, reservation) = record.into_parts();
                    batch.append(index, &record, size_bytes, reservation).await?;

                    if self
                        .flush
                        .should_flush(&self.stream, &batch.index_range(), batch.bytes)
                    {
                        self.hand_off(batch, &mut summary).await?;
                    } else {
                        open = Some(batch);
                    }
                }
                WrappedMessage::StreamComplete { index } => {
                    if let Some(batch) = open.take() {
                        self.hand_off(batch, &mut summary).await?;
                    }
                    self.launcher
                        .partition_complete(&self.stream, self.partition, index)
                        .await
                        .map_err(|e| PipelineError::Launcher(format!("{e:#}")))?;
                    summary.completed = true;
                    tracing::debug!(
                        stream = %self.stream,
                        partition = self.partition,
                        batches = summary.batches,
                        records = summary.records,
                        "partition complete"
                    );
                    return Ok(summary);
                }
                other @ (WrappedMessage::StreamCheckpoint { .. }
                | WrappedMessage::GlobalCheckpoint { .. }) => {
                    return Err(PipelineError::UnexpectedMessage {
                        kind: other.kind(),
                        queue: "stream queue",
                    });
                }
            }
        }

        if let Some(batch) = open.take() {
            tracing::warn!(
                stream = %self.stream,
                partition = self.partition,
                records = batch.records,
                "queue closed before stream completed; discarding partial batch"
            );
            self.metrics.batches_discarded.inc();
        }
        Ok(summary)
    }

    async fn hand_off(&self, batch: OpenBatch, summary: &mut SpillSummary) -> Result<()> {
        let (batch, reservation) = batch.finish(&self.stream, self.partition).await?;
        let range = *batch.record_index_range.start()..*batch.record_index_range.end() + 1;
        let bytes = batch.total_size_bytes;
        let records = batch.record_count;

        tracing::debug!(
            stream = %self.stream,
            partition = self.partition,
            first = range.start,
            last = range.end - 1,
            bytes,
            file = %batch.local_file.display(),
            "flushing batch"
        );

        self.launcher
            .launch(batch)
            .await
            .map_err(|e| PipelineError::Launcher(format!("{e:#}")))?;

        // Without the checkpoint task the batch can never release a checkpoint.
        self.persisted
            .send(PersistedRange {
                stream: self.stream.clone(),
                range: range.clone(),
            })
            .map_err(|_| PipelineError::PersistedRangeDropped {
                stream: self.stream.clone(),
                first: range.start,
                last: range.end - 1,
            })?;

        if let Some(reservation) = reservation {
            reservation.release();
        }
        self.metrics.on_batch_flushed(bytes);
        summary.batches += 1;
        summary.records += records;
        summary.bytes += bytes;
        Ok(())
    }
}

/// Batch being accumulated. Dropping it deletes the file and frees the memory.
struct OpenBatch {
    writer: BufWriter<File>,
    path: TempPath,
    line: BytesMut,
    first_index: u64,
    last_index: u64,
    records: u64,
    bytes: u64,
    reservation: Option<Reservation>,
}

impl OpenBatch {
    fn create(
        dir: &Path,
        stream: &StreamDescriptor,
        partition: usize,
        first_index: u64,
    ) -> Result<Self> {
        let prefix = format!("{}-p{}-{}-", file_safe(stream), partition, first_index);
        let named = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".jsonl")
            .tempfile_in(dir)?;
        let (file, path) = named.into_parts();
        Ok(Self {
            writer: BufWriter::new(File::from_std(file)),
            path,
            line: BytesMut::with_capacity(1024),
            first_index,
            last_index: first_index,
            records: 0,
            bytes: 0,
            reservation: None,
        })
    }

    async fn append(
        &mut self,
        index: u64,
        record: &DestinationRecord,
        size_bytes: u64,
        reservation: Reservation,
    ) -> Result<()> {
        self.line.clear();
        serde_json::to_writer((&mut self.line).writer(), &record.data)?;
        self.line.put_u8(b'\n');
        self.writer.write_all(&self.line).await?;

        self.last_index = index;
        self.records += 1;
        self.bytes += size_bytes;
        match self.reservation.as_mut() {
            Some(held) => held.merge(reservation),
            None => self.reservation = Some(reservation),
        }
        Ok(())
    }

    fn index_range(&self) -> RangeInclusive<u64> {
        self.first_index..=self.last_index
    }

    /// Flush and close the file, keeping it on disk.
    async fn finish(
        mut self,
        stream: &StreamDescriptor,
        partition: usize,
    ) -> Result<(Batch, Option<Reservation>)> {
        self.writer.flush().await?;
        self.writer.get_mut().sync_all().await?;

        let OpenBatch {
            writer,
            path,
            first_index,
            last_index,
            records,
            bytes,
            reservation,
            ..
        } = self;
        drop(writer);
        let local_file = path.keep().map_err(|e| PipelineError::Io(e.error))?;

        Ok((
            Batch {
                stream: stream.clone(),
                partition,
                total_size_bytes: bytes,
                record_count: records,
                record_index_range: first_index..=last_index,
                local_file,
            },
            reservation,
        ))
    }
}

fn file_safe(stream: &StreamDescriptor) -> String {
    stream
        .to_string()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
