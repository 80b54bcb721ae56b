use std::time::Duration;

use thiserror::Error;

use crate::message::StreamDescriptor;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Stream {stream} ended incomplete upstream; aborting sync")]
    StreamIncomplete { stream: StreamDescriptor },

    #[error("Stream {stream} cannot succeed before its end-of-stream marker")]
    StreamNotEnded { stream: StreamDescriptor },

    #[error("Sync ended before streams completed: {}", join_streams(.streams))]
    StreamsNotCompleted { streams: Vec<StreamDescriptor> },

    #[error("Stream {stream} sent a negative size hint ({hint})")]
    InvalidSizeHint { stream: StreamDescriptor, hint: i64 },

    #[error("Checkpoint tracking stopped before batch {first}..={last} of {stream} was recorded")]
    PersistedRangeDropped {
        stream: StreamDescriptor,
        first: u64,
        last: u64,
    },

    #[error("Stream {stream} was not declared for this sync")]
    UnknownStream { stream: StreamDescriptor },

    #[error("Stream {stream} already received its end-of-stream marker")]
    StreamAlreadyEnded { stream: StreamDescriptor },

    #[error("Released {released} bytes but only {outstanding} were outstanding")]
    OverRelease { released: u64, outstanding: u64 },

    #[error("Reservation of {requested} bytes can never fit in a {budget} byte budget")]
    ReservationTooLarge { requested: u64, budget: u64 },

    #[error("Timed out after {waited:?} waiting to reserve {requested} bytes")]
    ReservationTimeout { requested: u64, waited: Duration },

    #[error("Index for stream {stream} went backwards: expected {expected}, got {actual}")]
    IndexNonMonotonic {
        stream: StreamDescriptor,
        expected: u64,
        actual: u64,
    },

    #[error("Checkpoint for {stream} at index {index} arrived after one at index {previous}")]
    CheckpointOutOfOrder {
        stream: StreamDescriptor,
        index: u64,
        previous: u64,
    },

    #[error("Unexpected {kind} message on {queue}")]
    UnexpectedMessage {
        kind: &'static str,
        queue: &'static str,
    },

    #[error("Queue is closed")]
    QueueClosed,

    #[error("Partition {partition} out of range for a queue with {partitions} partitions")]
    NoSuchPartition { partition: usize, partitions: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task launcher failed: {0}")]
    Launcher(String),

    #[error("Checkpoint emitter failed: {0}")]
    Emitter(String),

    #[error("Pipeline task panicked: {0}")]
    TaskPanicked(String),
}

impl PipelineError {
    /// Correctness violations that no retry of the same input can fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::StreamIncomplete { .. }
                | PipelineError::StreamsNotCompleted { .. }
                | PipelineError::StreamNotEnded { .. }
                | PipelineError::InvalidSizeHint { .. }
                | PipelineError::OverRelease { .. }
                | PipelineError::IndexNonMonotonic { .. }
                | PipelineError::CheckpointOutOfOrder { .. }
                | PipelineError::StreamAlreadyEnded { .. }
                | PipelineError::UnexpectedMessage { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

fn join_streams(streams: &[StreamDescriptor]) -> String {
    streams
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
