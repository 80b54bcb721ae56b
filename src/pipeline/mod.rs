//! The destination write pipeline.
//!
//! ```text
//!                     +--> stream queue a [p0..pN] --> spill tasks --+
//! upstream --> input -+--> stream queue b [p0..pN] --> spill tasks --+--> launcher
//!             task    |                                               |
//!                     +--> checkpoint queue --> checkpoint task <-----+ persisted ranges
//!                                                   |
//!                                                   +--> emitter
//! ```
//!
//! Every message carries a memory reservation from the moment it enters the
//! flow until its batch is handed off (records) or it is emitted
//! (checkpoints). The upstream producer blocks when the budget is spent.

pub mod checkpoint;
pub mod flush;
pub mod input;
pub mod spill;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::channel::mpsc as flow;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::memory::MemoryManager;
use crate::message::{DestinationMessage, StreamDescriptor, WrappedMessage};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::queue::{PartitionedQueue, QueueSupplier};
use crate::state::{CheckpointEmitter, SyncManager};

pub use checkpoint::{CheckpointSummary, CheckpointTask};
pub use flush::{DefaultFlushStrategy, FlushStrategy};
pub use input::{InputConsumer, InputSummary, SizedMessage};
pub use spill::{Batch, PersistedRange, SpillSummary, SpillToDisk, TaskLauncher};

// =============================================================================
// Upstream helper
// =============================================================================

/// Producer side of the upstream flow.
///
/// `send` waits for memory before the message enters the flow, which is what
/// applies backpressure to the producer.
#[derive(Clone)]
pub struct SizedInput {
    memory: MemoryManager,
    tx: flow::UnboundedSender<SizedMessage>,
}

impl SizedInput {
    pub async fn send(&self, message: DestinationMessage) -> Result<()> {
        let size = message.estimated_size_bytes();
        let reserved = self.memory.reserve(size, message).await?;
        let hint = i64::try_from(size).unwrap_or(i64::MAX);
        self.tx
            .unbounded_send((hint, reserved))
            .map_err(|_| PipelineError::QueueClosed)
    }

    /// End the flow. Clones share the channel, so this ends it for all of them.
    pub fn close(&self) {
        self.tx.close_channel();
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Outcome of one sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    /// Records read per declared stream.
    pub records: BTreeMap<StreamDescriptor, u64>,
    pub batches: u64,
    pub records_flushed: u64,
    pub bytes_flushed: u64,
    pub checkpoints_emitted: u64,
    pub checkpoints_pending: u64,
    pub completed_streams: Vec<StreamDescriptor>,
    pub memory_high_water_bytes: u64,
    pub metrics: MetricsSnapshot,
}

enum TaskOutcome {
    Input(InputSummary),
    Spill(SpillSummary),
    Checkpoint(CheckpointSummary),
}

pub struct Pipeline {
    config: PipelineConfig,
    memory: MemoryManager,
    sync: Arc<SyncManager>,
    flush: Arc<dyn FlushStrategy>,
    launcher: Arc<dyn TaskLauncher>,
    emitter: Arc<dyn CheckpointEmitter>,
    metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        streams: impl IntoIterator<Item = StreamDescriptor>,
        flush: Arc<dyn FlushStrategy>,
        launcher: Arc<dyn TaskLauncher>,
        emitter: Arc<dyn CheckpointEmitter>,
    ) -> Result<Self> {
        config.validate()?;
        let sync = SyncManager::new(streams);
        if sync.is_empty() {
            return Err(PipelineError::Config(
                "at least one stream must be declared".to_string(),
            ));
        }
        config.validate_for_streams(sync.len())?;

        let mut memory = MemoryManager::new(config.memory_budget_bytes);
        if let Some(timeout) = config.reservation_timeout() {
            memory = memory.with_timeout(timeout);
        }

        Ok(Self {
            config,
            memory,
            sync: Arc::new(sync),
            flush,
            launcher,
            emitter,
            metrics: Arc::new(PipelineMetrics::default()),
        })
    }

    /// Pipeline with the size/record cut from `config`.
    pub fn with_default_flush(
        config: PipelineConfig,
        streams: impl IntoIterator<Item = StreamDescriptor>,
        launcher: Arc<dyn TaskLauncher>,
        emitter: Arc<dyn CheckpointEmitter>,
    ) -> Result<Self> {
        let flush = Arc::new(DefaultFlushStrategy::from_config(&config));
        Self::new(config, streams, flush, launcher, emitter)
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn sync_manager(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// A producer handle and the flow to pass to [`Pipeline::run`].
    pub fn input(&self) -> (SizedInput, flow::UnboundedReceiver<SizedMessage>) {
        let (tx, rx) = flow::unbounded();
        (
            SizedInput {
                memory: self.memory.clone(),
                tx,
            },
            rx,
        )
    }

    /// Drive the sync until `input` ends or something fails.
    ///
    /// The first failure cancels every queue and aborts the other tasks; it is
    /// the error returned. A sync whose input ends before every declared
    /// stream completed fails with [`PipelineError::StreamsNotCompleted`].
    /// Either way each stream's [`crate::state::StreamResult`] is recorded.
    pub async fn run<S>(self, input: S) -> Result<SyncSummary>
    where
        S: Stream<Item = SizedMessage> + Send + Unpin + 'static,
    {
        tokio::fs::create_dir_all(&self.config.spill_dir).await?;

        let partitions = self.config.partitions_per_stream;
        let queues: Arc<QueueSupplier<StreamDescriptor, WrappedMessage>> =
            Arc::new(QueueSupplier::new(partitions));
        let checkpoint_queue = Arc::new(PartitionedQueue::new(1));
        let (persisted_tx, persisted_rx) = mpsc::unbounded_channel();

        let mut tasks: JoinSet<Result<TaskOutcome>> = JoinSet::new();

        for descriptor in self.sync.descriptors() {
            let queue = queues.get(descriptor);
            for partition in 0..queues.partitions() {
                let consumer = queue.consume(partition)?;
                let task = SpillToDisk::new(
                    descriptor.clone(),
                    partition,
                    self.config.spill_dir.clone(),
                    self.flush.clone(),
                    self.launcher.clone(),
                    persisted_tx.clone(),
                    self.metrics.clone(),
                );
                tasks.spawn(async move { task.run(consumer).await.map(TaskOutcome::Spill) });
            }
        }
        drop(persisted_tx);

        let checkpoints = CheckpointTask::new(self.emitter.clone(), self.metrics.clone());
        let checkpoint_consumer = checkpoint_queue.consume(0)?;
        tasks.spawn(async move {
            checkpoints
                .run(checkpoint_consumer, persisted_rx)
                .await
                .map(TaskOutcome::Checkpoint)
        });

        let consumer = InputConsumer::new(
            self.sync.clone(),
            queues.clone(),
            checkpoint_queue.clone(),
            self.config.partition_run_records,
            self.metrics.clone(),
        );
        tasks.spawn(async move { consumer.run(input).await.map(TaskOutcome::Input) });

        tracing::info!(
            streams = self.sync.len(),
            partitions,
            memory_budget_bytes = self.memory.total_bytes(),
            "pipeline started"
        );

        let mut first_error: Option<PipelineError> = None;
        let mut spills = Vec::new();
        let mut checkpoint_summary = CheckpointSummary::default();

        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        tracing::error!(error = %e, "pipeline task failed; shutting down");
                        queues.cancel_all();
                        checkpoint_queue.cancel();
                        tasks.abort_all();
                        first_error = Some(e);
                    }
                    continue;
                }
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    if first_error.is_none() {
                        queues.cancel_all();
                        checkpoint_queue.cancel();
                        tasks.abort_all();
                        first_error = Some(PipelineError::TaskPanicked(e.to_string()));
                    }
                    continue;
                }
            };
            match outcome {
                TaskOutcome::Input(summary) => {
                    tracing::debug!(messages = summary.messages, "input task finished");
                }
                TaskOutcome::Spill(summary) => spills.push(summary),
                TaskOutcome::Checkpoint(summary) => checkpoint_summary = summary,
            }
        }

        if let Some(e) = first_error.or_else(|| self.memory.check().err()) {
            let reason = e.to_string();
            for manager in self.sync.streams() {
                manager.mark_processing_failed(reason.as_str());
            }
            return Err(e);
        }

        let summary = self.summarize(&spills, checkpoint_summary)?;
        tracing::info!(
            batches = summary.batches,
            records = summary.records_flushed,
            bytes = summary.bytes_flushed,
            checkpoints = summary.checkpoints_emitted,
            "pipeline finished"
        );
        Ok(summary)
    }

    /// Record each stream's result and total up the spill and checkpoint work.
    ///
    /// Fails naming every stream that did not complete.
    fn summarize(
        &self,
        spills: &[SpillSummary],
        checkpoints: CheckpointSummary,
    ) -> Result<SyncSummary> {
        let mut completed_streams = Vec::new();
        let mut incomplete_streams = Vec::new();
        for manager in self.sync.streams() {
            let descriptor = manager.descriptor();
            let all_partitions_done = spills
                .iter()
                .filter(|s| &s.stream == descriptor)
                .all(|s| s.completed);
            if !manager.end_of_stream_read() {
                manager.mark_processing_failed("input ended before end-of-stream");
                incomplete_streams.push(descriptor.clone());
            } else if !all_partitions_done {
                manager.mark_processing_failed("a partition did not finish its batches");
                incomplete_streams.push(descriptor.clone());
            } else {
                manager.mark_processing_succeeded()?;
                completed_streams.push(descriptor.clone());
            }
        }
        if !incomplete_streams.is_empty() {
            tracing::error!(
                completed = completed_streams.len(),
                incomplete = incomplete_streams.len(),
                checkpoints_pending = checkpoints.pending,
                "input ended before every stream completed"
            );
            return Err(PipelineError::StreamsNotCompleted {
                streams: incomplete_streams,
            });
        }

        Ok(SyncSummary {
            records: self
                .sync
                .streams()
                .map(|m| (m.descriptor().clone(), m.record_count()))
                .collect(),
            batches: spills.iter().map(|s| s.batches).sum(),
            records_flushed: spills.iter().map(|s| s.records).sum(),
            bytes_flushed: spills.iter().map(|s| s.bytes).sum(),
            checkpoints_emitted: checkpoints.emitted,
            checkpoints_pending: checkpoints.pending,
            completed_streams,
            memory_high_water_bytes: self.memory.high_water_bytes(),
            metrics: self.metrics.snapshot(),
        })
    }
}
