//! Input consumption task.
//!
//! The only reader of the upstream flow and the only writer into every queue
//! and into the stream counters. Because one task does all of it, index
//! assignment and checkpoint stamping need no further synchronisation: the
//! index a checkpoint records is exactly the number of records routed for
//! that stream before the checkpoint was read.

use std::collections::HashMap;
use std::sync::Arc;

use futures::{Stream, StreamExt};

use crate::error::{PipelineError, Result};
use crate::memory::{Reservation, Reserved};
use crate::message::{
    DestinationMessage, DestinationRecord, GlobalCheckpoint, StreamCheckpoint, StreamDescriptor,
    WrappedMessage,
};
use crate::metrics::PipelineMetrics;
use crate::queue::{PartitionedQueue, QueueSupplier};
use crate::state::SyncManager;

/// One item of the upstream flow: a size hint and the reserved message.
pub type SizedMessage = (i64, Reserved<DestinationMessage>);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputSummary {
    pub messages: u64,
    pub records: u64,
    pub checkpoints: u64,
    pub streams_completed: u64,
}

pub struct InputConsumer {
    sync: Arc<SyncManager>,
    queues: Arc<QueueSupplier<StreamDescriptor, WrappedMessage>>,
    checkpoint_queue: Arc<PartitionedQueue<WrappedMessage>>,
    partition_run_records: u64,
    metrics: Arc<PipelineMetrics>,
    /// Local handles so the hot path skips the supplier's map lock.
    stream_queues: HashMap<StreamDescriptor, Arc<PartitionedQueue<WrappedMessage>>>,
    summary: InputSummary,
}

impl InputConsumer {
    pub fn new(
        sync: Arc<SyncManager>,
        queues: Arc<QueueSupplier<StreamDescriptor, WrappedMessage>>,
        checkpoint_queue: Arc<PartitionedQueue<WrappedMessage>>,
        partition_run_records: u64,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            sync,
            queues,
            checkpoint_queue,
            partition_run_records: partition_run_records.max(1),
            metrics,
            stream_queues: HashMap::new(),
            summary: InputSummary::default(),
        }
    }

    /// Consume `input` until it ends or a message is fatal.
    ///
    /// Every queue is closed on return. On success consumers drain what is
    /// buffered; on failure buffered items are dropped so no partial batch
    /// gets flushed.
    pub async fn run<S>(mut self, mut input: S) -> Result<InputSummary>
    where
        S: Stream<Item = SizedMessage> + Unpin,
    {
        let mut result = Ok(());
        while let Some((size_hint, message)) = input.next().await {
            self.summary.messages += 1;
            if let Err(e) = self.accept(size_hint, message) {
                result = Err(e);
                break;
            }
        }

        match result {
            Ok(()) => {
                self.queues.close_all();
                self.checkpoint_queue.close();
                tracing::info!(
                    messages = self.summary.messages,
                    records = self.summary.records,
                    checkpoints = self.summary.checkpoints,
                    "input exhausted"
                );
                Ok(self.summary)
            }
            Err(e) => {
                tracing::error!(error = %e, "input consumption failed; cancelling queues");
                self.queues.cancel_all();
                self.checkpoint_queue.cancel();
                Err(e)
            }
        }
    }

    fn accept(&mut self, size_hint: i64, message: Reserved<DestinationMessage>) -> Result<()> {
        let (message, reservation) = message.into_parts();
        match message {
            DestinationMessage::Record(record) => {
                self.route_record(size_hint, record, reservation)
            }
            DestinationMessage::StreamComplete { stream, .. } => {
                self.complete_stream(&stream)?;
                reservation.release();
                Ok(())
            }
            DestinationMessage::StreamIncomplete { stream, .. } => {
                Err(PipelineError::StreamIncomplete { stream })
            }
            DestinationMessage::StreamCheckpoint(checkpoint) => {
                self.route_stream_checkpoint(checkpoint, reservation)
            }
            DestinationMessage::GlobalCheckpoint(checkpoint) => {
                self.route_global_checkpoint(checkpoint, reservation)
            }
        }
    }

    fn route_record(
        &mut self,
        size_hint: i64,
        record: DestinationRecord,
        reservation: Reservation,
    ) -> Result<()> {
        let manager = self.sync.get(&record.stream)?.clone();
        if manager.end_of_stream_read() {
            return Err(PipelineError::StreamAlreadyEnded {
                stream: record.stream,
            });
        }

        let size_bytes =
            u64::try_from(size_hint).map_err(|_| PipelineError::InvalidSizeHint {
                stream: record.stream.clone(),
                hint: size_hint,
            })?;

        let index = manager.record_count();
        let queue = self.queue_for(&record.stream);
        let partition = self.partition_for(index, queue.partition_count());

        queue.publish(
            WrappedMessage::Record {
                index,
                size_bytes,
                record: Reserved::from_parts(record, reservation),
            },
            partition,
        )?;

        let assigned = manager.increment_read_count()?;
        if assigned != index {
            return Err(PipelineError::IndexNonMonotonic {
                stream: manager.descriptor().clone(),
                expected: index,
                actual: assigned,
            });
        }

        self.summary.records += 1;
        self.metrics.records_routed.inc();
        Ok(())
    }

    fn complete_stream(&mut self, stream: &StreamDescriptor) -> Result<()> {
        let manager = self.sync.get(stream)?.clone();
        if manager.end_of_stream_read() {
            return Err(PipelineError::StreamAlreadyEnded {
                stream: stream.clone(),
            });
        }

        let index = manager.record_count();
        let queue = self.queue_for(stream);
        queue.broadcast(|| WrappedMessage::StreamComplete { index })?;
        manager.mark_end_of_stream()?;
        queue.close();

        self.summary.streams_completed += 1;
        tracing::info!(stream = %stream, records = index, "stream complete");
        Ok(())
    }

    fn route_stream_checkpoint(
        &mut self,
        mut checkpoint: StreamCheckpoint,
        reservation: Reservation,
    ) -> Result<()> {
        let manager = self.sync.get(&checkpoint.stream)?;
        let (index, count) = manager.mark_checkpoint();
        checkpoint.destination_record_count = Some(count);

        tracing::debug!(stream = %checkpoint.stream, index, "stream checkpoint");
        self.checkpoint_queue.publish(
            WrappedMessage::StreamCheckpoint {
                index,
                checkpoint: Reserved::from_parts(checkpoint, reservation),
            },
            0,
        )?;
        self.summary.checkpoints += 1;
        self.metrics.checkpoints_routed.inc();
        Ok(())
    }

    fn route_global_checkpoint(
        &mut self,
        mut checkpoint: GlobalCheckpoint,
        reservation: Reservation,
    ) -> Result<()> {
        // Every declared stream, not only the ones named in the payload.
        let mut stream_indexes = Vec::with_capacity(self.sync.len());
        let mut total = 0;
        for manager in self.sync.streams() {
            let (index, count) = manager.mark_checkpoint();
            total += count;
            stream_indexes.push((manager.descriptor().clone(), index));
        }
        checkpoint.destination_record_count = Some(total);

        tracing::debug!(streams = stream_indexes.len(), "global checkpoint");
        self.checkpoint_queue.publish(
            WrappedMessage::GlobalCheckpoint {
                stream_indexes,
                checkpoint: Reserved::from_parts(checkpoint, reservation),
            },
            0,
        )?;
        self.summary.checkpoints += 1;
        self.metrics.checkpoints_routed.inc();
        Ok(())
    }

    fn queue_for(&mut self, stream: &StreamDescriptor) -> Arc<PartitionedQueue<WrappedMessage>> {
        if let Some(queue) = self.stream_queues.get(stream) {
            return queue.clone();
        }
        let queue = self.queues.get(stream);
        self.stream_queues.insert(stream.clone(), queue.clone());
        queue
    }

    fn partition_for(&self, index: u64, partitions: usize) -> usize {
        ((index / self.partition_run_records) % partitions as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryManager;
    use crate::queue::PartitionConsumer;
    use serde_json::json;

    struct Fixture {
        memory: MemoryManager,
        sync: Arc<SyncManager>,
        queues: Arc<QueueSupplier<StreamDescriptor, WrappedMessage>>,
        checkpoints: Arc<PartitionedQueue<WrappedMessage>>,
    }

    fn a() -> StreamDescriptor {
        StreamDescriptor::new(None, "a")
    }

    fn b() -> StreamDescriptor {
        StreamDescriptor::new(None, "b")
    }

    fn fixture(partitions: usize) -> Fixture {
        Fixture {
            memory: MemoryManager::new(1 << 20),
            sync: Arc::new(SyncManager::new(vec![a(), b()])),
            queues: Arc::new(QueueSupplier::new(partitions)),
            checkpoints: Arc::new(PartitionedQueue::new(1)),
        }
    }

    impl Fixture {
        fn consumer(&self, run: u64) -> InputConsumer {
            InputConsumer::new(
                self.sync.clone(),
                self.queues.clone(),
                self.checkpoints.clone(),
                run,
                Arc::new(PipelineMetrics::default()),
            )
        }

        fn sized(&self, message: DestinationMessage) -> SizedMessage {
            let size = message.estimated_size_bytes();
            (size as i64, self.memory.try_reserve(size, message).unwrap())
        }

        fn record(&self, stream: StreamDescriptor, id: u64) -> SizedMessage {
            self.sized(DestinationMessage::Record(DestinationRecord {
                stream,
                data: json!({ "id": id }),
                emitted_at_ms: 0,
                serialized_size_bytes: 2,
            }))
        }

        fn complete(&self, stream: StreamDescriptor) -> SizedMessage {
            self.sized(DestinationMessage::StreamComplete {
                stream,
                emitted_at_ms: 0,
            })
        }

        fn checkpoint(&self, stream: StreamDescriptor) -> SizedMessage {
            self.sized(DestinationMessage::StreamCheckpoint(StreamCheckpoint {
                stream,
                payload: json!({"cursor": 1}),
                source_record_count: None,
                destination_record_count: None,
            }))
        }

        fn global(&self) -> SizedMessage {
            self.sized(DestinationMessage::GlobalCheckpoint(GlobalCheckpoint {
                payload: json!({}),
                source_record_count: None,
                per_stream_checkpoints: vec![],
                destination_record_count: None,
            }))
        }
    }

    async fn drain(mut consumer: PartitionConsumer<WrappedMessage>) -> Vec<WrappedMessage> {
        let mut out = Vec::new();
        while let Some(m) = consumer.next().await {
            out.push(m);
        }
        out
    }

    fn indices(messages: &[WrappedMessage]) -> Vec<u64> {
        messages
            .iter()
            .filter_map(|m| match m {
                WrappedMessage::Record { index, .. } => Some(*index),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_assigns_dense_indices_per_stream() {
        let f = fixture(1);
        let mut input = Vec::new();
        for i in 0..5 {
            input.push(f.record(a(), i));
            if i % 2 == 0 {
                input.push(f.record(b(), i));
            }
        }

        let summary = f
            .consumer(100)
            .run(futures::stream::iter(input))
            .await
            .unwrap();
        assert_eq!(summary.records, 8);
        assert_eq!(f.sync.record_count(&a()).unwrap(), 5);
        assert_eq!(f.sync.record_count(&b()).unwrap(), 3);

        let a_items = drain(f.queues.get(&a()).consume(0).unwrap()).await;
        assert_eq!(indices(&a_items), vec![0, 1, 2, 3, 4]);
        let b_items = drain(f.queues.get(&b()).consume(0).unwrap()).await;
        assert_eq!(indices(&b_items), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_checkpoint_captures_index_at_read_time() {
        let f = fixture(1);
        let mut input = Vec::new();
        for i in 0..10 {
            input.push(f.record(a(), i));
        }
        input.push(f.checkpoint(a()));
        for i in 0..4 {
            input.push(f.record(b(), i));
        }
        input.push(f.global());

        f.consumer(100)
            .run(futures::stream::iter(input))
            .await
            .unwrap();

        let checkpoints = drain(f.checkpoints.consume(0).unwrap()).await;
        assert_eq!(checkpoints.len(), 2);
        match &checkpoints[0] {
            WrappedMessage::StreamCheckpoint { index, checkpoint } => {
                assert_eq!(*index, 10);
                assert_eq!(checkpoint.payload().destination_record_count, Some(10));
            }
            other => panic!("Expected stream checkpoint, got {:?}", other),
        }
        match &checkpoints[1] {
            WrappedMessage::GlobalCheckpoint {
                stream_indexes,
                checkpoint,
            } => {
                assert_eq!(stream_indexes, &vec![(a(), 10), (b(), 4)]);
                // a was already counted by its stream checkpoint.
                assert_eq!(checkpoint.payload().destination_record_count, Some(4));
            }
            other => panic!("Expected global checkpoint, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_completion_marks_only_its_stream() {
        let f = fixture(1);
        let input = vec![
            f.record(a(), 0),
            f.record(b(), 0),
            f.record(a(), 1),
            f.complete(a()),
            f.record(b(), 1),
        ];
        let summary = f
            .consumer(100)
            .run(futures::stream::iter(input))
            .await
            .unwrap();
        assert_eq!(summary.streams_completed, 1);
        assert!(f.sync.end_of_stream_read(&a()).unwrap());
        assert!(!f.sync.end_of_stream_read(&b()).unwrap());

        let a_items = drain(f.queues.get(&a()).consume(0).unwrap()).await;
        assert_eq!(a_items.len() as u64, f.sync.record_count(&a()).unwrap() + 1);
        assert!(matches!(
            a_items.last(),
            Some(WrappedMessage::StreamComplete { index: 2 })
        ));
    }

    #[tokio::test]
    async fn test_stream_incomplete_is_fatal() {
        let f = fixture(1);
        let input = vec![
            f.record(a(), 0),
            f.sized(DestinationMessage::StreamIncomplete {
                stream: a(),
                emitted_at_ms: 0,
            }),
            f.record(a(), 1),
        ];
        let err = f
            .consumer(100)
            .run(futures::stream::iter(input))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StreamIncomplete { .. }));
        assert!(err.is_fatal());

        // Nothing after the failure was routed, and the buffered record was dropped.
        assert_eq!(f.sync.record_count(&a()).unwrap(), 1);
        let queue = f.queues.get(&a());
        assert!(queue.is_closed());
        assert!(drain(queue.consume(0).unwrap()).await.is_empty());
        assert_eq!(f.memory.reserved_bytes(), 0);
    }

    #[tokio::test]
    async fn test_record_after_completion_is_rejected() {
        let f = fixture(1);
        let input = vec![f.complete(a()), f.record(a(), 0)];
        let err = f
            .consumer(100)
            .run(futures::stream::iter(input))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StreamAlreadyEnded { .. }));
    }

    #[tokio::test]
    async fn test_negative_size_hint_is_rejected() {
        let f = fixture(1);
        let (_, reserved) = f.record(a(), 0);
        let input = vec![f.record(a(), 0), (-5, reserved), f.record(a(), 2)];
        let err = f
            .consumer(100)
            .run(futures::stream::iter(input))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidSizeHint { ref stream, hint: -5 } if stream == &a()
        ));
        assert!(err.is_fatal());
        assert_eq!(f.sync.record_count(&a()).unwrap(), 1);
        assert_eq!(f.memory.reserved_bytes(), 0);
    }

    #[tokio::test]
    async fn test_unknown_stream_is_rejected() {
        let f = fixture(1);
        let input = vec![f.record(StreamDescriptor::new(None, "zzz"), 0)];
        let err = f
            .consumer(100)
            .run(futures::stream::iter(input))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownStream { .. }));
    }

    #[tokio::test]
    async fn test_partitions_receive_runs_and_markers() {
        let f = fixture(2);
        let mut input = Vec::new();
        for i in 0..7 {
            input.push(f.record(a(), i));
        }
        input.push(f.complete(a()));
        f.consumer(3)
            .run(futures::stream::iter(input))
            .await
            .unwrap();

        let queue = f.queues.get(&a());
        let p0 = drain(queue.consume(0).unwrap()).await;
        let p1 = drain(queue.consume(1).unwrap()).await;
        assert_eq!(indices(&p0), vec![0, 1, 2, 6]);
        assert_eq!(indices(&p1), vec![3, 4, 5]);
        assert!(matches!(
            p0.last(),
            Some(WrappedMessage::StreamComplete { index: 7 })
        ));
        assert!(matches!(
            p1.last(),
            Some(WrappedMessage::StreamComplete { index: 7 })
        ));
    }
}
