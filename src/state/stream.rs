//! Per-stream read state.
//!
//! Counters here are written by exactly one task, the input consumer. Everyone
//! else only reads, so plain atomics are enough and no lock is taken. The
//! mutators are crate-private to keep it that way. The processing result is
//! set once, by the orchestrator, after the stream's tasks have finished.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::Notify;

use crate::error::{PipelineError, Result};
use crate::message::StreamDescriptor;

/// How processing of one stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamResult {
    Succeeded,
    Failed(String),
}

impl StreamResult {
    pub fn is_success(&self) -> bool {
        matches!(self, StreamResult::Succeeded)
    }
}

#[derive(Debug)]
pub struct StreamManager {
    descriptor: StreamDescriptor,
    record_count: AtomicU64,
    end_of_stream_read: AtomicBool,
    /// Record count at the last checkpoint mark.
    last_checkpoint_index: AtomicU64,
    checkpoint_id: AtomicU64,
    result: OnceLock<StreamResult>,
    result_set: Notify,
}

impl StreamManager {
    pub fn new(descriptor: StreamDescriptor) -> Self {
        Self {
            descriptor,
            record_count: AtomicU64::new(0),
            end_of_stream_read: AtomicBool::new(false),
            last_checkpoint_index: AtomicU64::new(0),
            checkpoint_id: AtomicU64::new(0),
            result: OnceLock::new(),
            result_set: Notify::new(),
        }
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    /// Records routed so far; also the index the next record will get.
    pub fn record_count(&self) -> u64 {
        self.record_count.load(Ordering::Acquire)
    }

    pub fn end_of_stream_read(&self) -> bool {
        self.end_of_stream_read.load(Ordering::Acquire)
    }

    /// Number of checkpoints marked so far.
    pub fn checkpoint_id(&self) -> u64 {
        self.checkpoint_id.load(Ordering::Acquire)
    }

    /// The processing result, once one has been recorded.
    pub fn result(&self) -> Option<&StreamResult> {
        self.result.get()
    }

    /// Wait until the stream is marked succeeded or failed.
    pub async fn await_stream_result(&self) -> StreamResult {
        loop {
            let notified = self.result_set.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(result) = self.result.get() {
                return result.clone();
            }
            notified.await;
        }
    }

    /// Record success. Only legal once the end-of-stream marker was read.
    ///
    /// The first recorded result wins; later marks are ignored.
    pub(crate) fn mark_processing_succeeded(&self) -> Result<()> {
        if !self.end_of_stream_read() {
            return Err(PipelineError::StreamNotEnded {
                stream: self.descriptor.clone(),
            });
        }
        self.set_result(StreamResult::Succeeded);
        Ok(())
    }

    pub(crate) fn mark_processing_failed(&self, reason: impl Into<String>) {
        self.set_result(StreamResult::Failed(reason.into()));
    }

    fn set_result(&self, result: StreamResult) {
        if self.result.set(result).is_ok() {
            self.result_set.notify_waiters();
        }
    }

    /// Count one more record. Returns the index it was assigned.
    pub(crate) fn increment_read_count(&self) -> Result<u64> {
        if self.end_of_stream_read() {
            return Err(PipelineError::StreamAlreadyEnded {
                stream: self.descriptor.clone(),
            });
        }
        Ok(self.record_count.fetch_add(1, Ordering::AcqRel))
    }

    /// Set the end-of-stream flag. Returns the final record count.
    pub(crate) fn mark_end_of_stream(&self) -> Result<u64> {
        if self.end_of_stream_read.swap(true, Ordering::AcqRel) {
            return Err(PipelineError::StreamAlreadyEnded {
                stream: self.descriptor.clone(),
            });
        }
        Ok(self.record_count())
    }

    /// Close the current checkpoint window.
    ///
    /// Returns `(index, count)`: the record count now, and how many records
    /// arrived since the previous mark.
    pub(crate) fn mark_checkpoint(&self) -> (u64, u64) {
        let index = self.record_count();
        let previous = self.last_checkpoint_index.swap(index, Ordering::AcqRel);
        self.checkpoint_id.fetch_add(1, Ordering::AcqRel);
        (index, index - previous)
    }
}

/// Registry of every stream declared for a sync.
///
/// The set of streams is fixed at construction; only the per-stream counters
/// change afterwards.
#[derive(Debug)]
pub struct SyncManager {
    order: Vec<StreamDescriptor>,
    streams: HashMap<StreamDescriptor, Arc<StreamManager>>,
}

impl SyncManager {
    pub fn new(streams: impl IntoIterator<Item = StreamDescriptor>) -> Self {
        let mut order = Vec::new();
        let mut managers = HashMap::new();
        for descriptor in streams {
            if managers.contains_key(&descriptor) {
                continue;
            }
            order.push(descriptor.clone());
            managers.insert(descriptor.clone(), Arc::new(StreamManager::new(descriptor)));
        }
        Self {
            order,
            streams: managers,
        }
    }

    pub fn get(&self, stream: &StreamDescriptor) -> Result<&Arc<StreamManager>> {
        self.streams
            .get(stream)
            .ok_or_else(|| PipelineError::UnknownStream {
                stream: stream.clone(),
            })
    }

    pub fn record_count(&self, stream: &StreamDescriptor) -> Result<u64> {
        Ok(self.get(stream)?.record_count())
    }

    pub fn end_of_stream_read(&self, stream: &StreamDescriptor) -> Result<bool> {
        Ok(self.get(stream)?.end_of_stream_read())
    }

    /// Declared streams in declaration order.
    pub fn streams(&self) -> impl Iterator<Item = &Arc<StreamManager>> {
        self.order.iter().filter_map(|d| self.streams.get(d))
    }

    pub fn descriptors(&self) -> &[StreamDescriptor] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn total_record_count(&self) -> u64 {
        self.streams().map(|s| s.record_count()).sum()
    }

    pub fn all_streams_complete(&self) -> bool {
        self.streams().all(|s| s.end_of_stream_read())
    }

    /// Streams not marked succeeded, in declaration order.
    pub fn unsuccessful_streams(&self) -> Vec<StreamDescriptor> {
        self.streams()
            .filter(|s| !s.result().is_some_and(StreamResult::is_success))
            .map(|s| s.descriptor().clone())
            .collect()
    }
}
