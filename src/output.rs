//! Ready-made launcher and emitter for running the pipeline standalone.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::message::{CheckpointMessage, StreamDescriptor};
use crate::pipeline::{Batch, TaskLauncher};
use crate::state::CheckpointEmitter;

/// Moves each finished batch into `<output>/<stream>/p<partition>-<first>-<last>.jsonl`.
#[derive(Debug, Clone)]
pub struct DirectoryLauncher {
    output: PathBuf,
}

impl DirectoryLauncher {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Where `batch` ends up once launched.
    pub fn destination(&self, batch: &Batch) -> PathBuf {
        self.stream_dir(&batch.stream).join(format!(
            "p{}-{}-{}.jsonl",
            batch.partition,
            batch.record_index_range.start(),
            batch.record_index_range.end()
        ))
    }

    fn stream_dir(&self, stream: &StreamDescriptor) -> PathBuf {
        self.output.join(stream.to_string())
    }
}

#[async_trait]
impl TaskLauncher for DirectoryLauncher {
    async fn launch(&self, batch: Batch) -> anyhow::Result<()> {
        let target = self.destination(&batch);
        let dir = self.stream_dir(&batch.stream);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        if tokio::fs::rename(&batch.local_file, &target).await.is_err() {
            // Spill and output directories on different filesystems.
            tokio::fs::copy(&batch.local_file, &target)
                .await
                .with_context(|| {
                    format!(
                        "Failed to copy {} to {}",
                        batch.local_file.display(),
                        target.display()
                    )
                })?;
            tokio::fs::remove_file(&batch.local_file)
                .await
                .with_context(|| format!("Failed to remove {}", batch.local_file.display()))?;
        }

        tracing::info!(
            stream = %batch.stream,
            partition = batch.partition,
            records = batch.record_count,
            bytes = batch.total_size_bytes,
            file = %target.display(),
            "batch written"
        );
        Ok(())
    }

    async fn partition_complete(
        &self,
        stream: &StreamDescriptor,
        partition: usize,
        record_count: u64,
    ) -> anyhow::Result<()> {
        tracing::debug!(stream = %stream, partition, record_count, "partition complete");
        Ok(())
    }
}

/// Writes each checkpoint as one JSON line.
pub struct JsonLinesEmitter<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesEmitter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> CheckpointEmitter for JsonLinesEmitter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn emit(&self, checkpoint: CheckpointMessage) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(&checkpoint)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}
