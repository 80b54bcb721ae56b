//! Checkpoint release task.
//!
//! Consumes the checkpoint queue and the persisted ranges reported by the
//! spill tasks, and emits each checkpoint once its records are handed off.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{PipelineError, Result};
use crate::message::WrappedMessage;
use crate::metrics::PipelineMetrics;
use crate::pipeline::spill::PersistedRange;
use crate::queue::PartitionConsumer;
use crate::state::{CheckpointEmitter, CheckpointManager};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointSummary {
    pub emitted: u64,
    /// Still held when the run ended; their records never reached a batch.
    pub pending: u64,
}

pub struct CheckpointTask {
    manager: CheckpointManager,
    emitter: Arc<dyn CheckpointEmitter>,
    metrics: Arc<PipelineMetrics>,
    emitted: u64,
}

impl CheckpointTask {
    pub fn new(emitter: Arc<dyn CheckpointEmitter>, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            manager: CheckpointManager::new(),
            emitter,
            metrics,
            emitted: 0,
        }
    }

    /// Run until both the checkpoint queue and every persisted-range sender are gone.
    pub async fn run(
        mut self,
        mut checkpoints: PartitionConsumer<WrappedMessage>,
        mut persisted: mpsc::UnboundedReceiver<PersistedRange>,
    ) -> Result<CheckpointSummary> {
        let mut queue_done = false;
        let mut persisted_done = false;

        loop {
            tokio::select! {
                message = checkpoints.next(), if !queue_done => match message {
                    Some(message) => self.accept(message)?,
                    None => queue_done = true,
                },
                range = persisted.recv(), if !persisted_done => match range {
                    Some(PersistedRange { stream, range }) => {
                        self.manager.mark_persisted(&stream, range);
                    }
                    None => persisted_done = true,
                },
                else => break,
            }
            self.emit_ready().await?;
        }

        let pending = self.manager.pending_count() as u64;
        if pending > 0 {
            tracing::warn!(pending, "checkpoints never became ready; not emitted");
        }
        Ok(CheckpointSummary {
            emitted: self.emitted,
            pending,
        })
    }

    fn accept(&mut self, message: WrappedMessage) -> Result<()> {
        match message {
            WrappedMessage::StreamCheckpoint { index, checkpoint } => {
                self.manager.add_stream_checkpoint(index, checkpoint)
            }
            WrappedMessage::GlobalCheckpoint {
                stream_indexes,
                checkpoint,
            } => self.manager.add_global_checkpoint(stream_indexes, checkpoint),
            other @ (WrappedMessage::Record { .. } | WrappedMessage::StreamComplete { .. }) => {
                Err(PipelineError::UnexpectedMessage {
                    kind: other.kind(),
                    queue: "checkpoint queue",
                })
            }
        }
    }

    async fn emit_ready(&mut self) -> Result<()> {
        for ready in self.manager.take_ready() {
            let (checkpoint, reservation) = ready.into_parts();
            self.emitter
                .emit(checkpoint)
                .await
                .map_err(|e| PipelineError::Emitter(format!("{e:#}")))?;
            reservation.release();
            self.emitted += 1;
            self.metrics.checkpoints_emitted.inc();
        }
        Ok(())
    }
}
