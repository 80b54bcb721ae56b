//! Checkpoint release bookkeeping.
//!
//! Checkpoints arrive stamped with per-stream record indices. A checkpoint
//! may only go back to the orchestrator once every record before those
//! indices has been handed off downstream. [`CheckpointManager`] holds
//! checkpoints until that is true and releases them in arrival order.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Range;

use async_trait::async_trait;

use crate::error::{PipelineError, Result};
use crate::memory::Reserved;
use crate::message::{CheckpointMessage, GlobalCheckpoint, StreamCheckpoint, StreamDescriptor};

/// Receives checkpoints once all the records they cover are persisted.
#[async_trait]
pub trait CheckpointEmitter: Send + Sync + 'static {
    async fn emit(&self, checkpoint: CheckpointMessage) -> anyhow::Result<()>;
}

// =============================================================================
// RangeSet
// =============================================================================

/// Disjoint, coalesced half-open ranges of record indices.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RangeSet {
    /// start -> end (exclusive)
    ranges: BTreeMap<u64, u64>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }
        let mut start = range.start;
        let mut end = range.end;

        if let Some((&s, &e)) = self.ranges.range(..=start).next_back() {
            if e >= start {
                start = s;
                end = end.max(e);
            }
        }

        let absorbed: Vec<u64> = self.ranges.range(start..=end).map(|(&s, _)| s).collect();
        for s in absorbed {
            if let Some(e) = self.ranges.remove(&s) {
                end = end.max(e);
            }
        }

        self.ranges.insert(start, end);
    }

    /// True when every index in `0..end` is present.
    pub fn covers_prefix(&self, end: u64) -> bool {
        if end == 0 {
            return true;
        }
        matches!(self.ranges.first_key_value(), Some((&0, &e)) if e >= end)
    }

    pub fn contains(&self, index: u64) -> bool {
        self.ranges
            .range(..=index)
            .next_back()
            .is_some_and(|(_, &e)| index < e)
    }

    pub fn ranges(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.ranges.iter().map(|(&s, &e)| s..e)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

// =============================================================================
// CheckpointManager
// =============================================================================

struct PendingGlobal {
    stream_indexes: Vec<(StreamDescriptor, u64)>,
    checkpoint: Reserved<GlobalCheckpoint>,
}

/// Holds checkpoints until the records they cover are persisted.
///
/// Owned by a single task; not shared.
#[derive(Default)]
pub struct CheckpointManager {
    persisted: HashMap<StreamDescriptor, RangeSet>,
    stream_checkpoints: HashMap<StreamDescriptor, VecDeque<(u64, Reserved<StreamCheckpoint>)>>,
    global_checkpoints: VecDeque<PendingGlobal>,
    /// Highest index seen per stream, across stream and global checkpoints.
    last_index: HashMap<StreamDescriptor, u64>,
}

impl CheckpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stream_checkpoint(
        &mut self,
        index: u64,
        checkpoint: Reserved<StreamCheckpoint>,
    ) -> Result<()> {
        let stream = checkpoint.payload().stream.clone();
        self.check_order(&stream, index)?;
        self.stream_checkpoints
            .entry(stream)
            .or_default()
            .push_back((index, checkpoint));
        Ok(())
    }

    pub fn add_global_checkpoint(
        &mut self,
        stream_indexes: Vec<(StreamDescriptor, u64)>,
        checkpoint: Reserved<GlobalCheckpoint>,
    ) -> Result<()> {
        for (stream, index) in &stream_indexes {
            self.check_order(stream, *index)?;
        }
        self.global_checkpoints.push_back(PendingGlobal {
            stream_indexes,
            checkpoint,
        });
        Ok(())
    }

    /// Record that indices `range` of `stream` were handed off downstream.
    pub fn mark_persisted(&mut self, stream: &StreamDescriptor, range: Range<u64>) {
        self.persisted
            .entry(stream.clone())
            .or_default()
            .insert(range);
    }

    pub fn is_persisted_until(&self, stream: &StreamDescriptor, end: u64) -> bool {
        match self.persisted.get(stream) {
            Some(set) => set.covers_prefix(end),
            None => end == 0,
        }
    }

    /// Remove and return every checkpoint whose records are all persisted.
    ///
    /// Per stream (and for globals) release stops at the first checkpoint that
    /// is not ready, so order is preserved.
    pub fn take_ready(&mut self) -> Vec<Reserved<CheckpointMessage>> {
        let mut ready = Vec::new();

        let persisted = &self.persisted;
        let covered = |stream: &StreamDescriptor, end: u64| match persisted.get(stream) {
            Some(set) => set.covers_prefix(end),
            None => end == 0,
        };

        let mut streams: Vec<&StreamDescriptor> = self.stream_checkpoints.keys().collect();
        streams.sort();
        let streams: Vec<StreamDescriptor> = streams.into_iter().cloned().collect();
        for stream in streams {
            let Some(queue) = self.stream_checkpoints.get_mut(&stream) else {
                continue;
            };
            while queue
                .front()
                .is_some_and(|(index, _)| covered(&stream, *index))
            {
                if let Some((_, checkpoint)) = queue.pop_front() {
                    ready.push(checkpoint.map(CheckpointMessage::Stream));
                }
            }
        }
        self.stream_checkpoints.retain(|_, q| !q.is_empty());

        while self.global_checkpoints.front().is_some_and(|g| {
            g.stream_indexes
                .iter()
                .all(|(stream, index)| covered(stream, *index))
        }) {
            if let Some(global) = self.global_checkpoints.pop_front() {
                ready.push(global.checkpoint.map(CheckpointMessage::Global));
            }
        }

        ready
    }

    pub fn pending_count(&self) -> usize {
        self.global_checkpoints.len()
            + self
                .stream_checkpoints
                .values()
                .map(VecDeque::len)
                .sum::<usize>()
    }

    fn check_order(&mut self, stream: &StreamDescriptor, index: u64) -> Result<()> {
        match self.last_index.get(stream) {
            Some(&previous) if index < previous => Err(PipelineError::CheckpointOutOfOrder {
                stream: stream.clone(),
                index,
                previous,
            }),
            _ => {
                self.last_index.insert(stream.clone(), index);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryManager;
    use serde_json::json;

    fn stream1() -> StreamDescriptor {
        StreamDescriptor::new(None, "stream1")
    }

    fn stream2() -> StreamDescriptor {
        StreamDescriptor::new(None, "stream2")
    }

    fn stream_cp(
        memory: &MemoryManager,
        stream: StreamDescriptor,
        payload: i64,
    ) -> Reserved<StreamCheckpoint> {
        let cp = StreamCheckpoint {
            stream,
            payload: json!(payload),
            source_record_count: None,
            destination_record_count: None,
        };
        memory.try_reserve(1, cp).unwrap()
    }

    fn global_cp(memory: &MemoryManager, payload: i64) -> Reserved<GlobalCheckpoint> {
        let cp = GlobalCheckpoint {
            payload: json!(payload),
            source_record_count: None,
            per_stream_checkpoints: vec![],
            destination_record_count: None,
        };
        memory.try_reserve(1, cp).unwrap()
    }

    fn payloads(ready: Vec<Reserved<CheckpointMessage>>) -> Vec<String> {
        ready
            .into_iter()
            .map(|r| match r.release() {
                CheckpointMessage::Stream(c) => format!("{}:{}", c.stream, c.payload),
                CheckpointMessage::Global(g) => format!("global:{}", g.payload),
            })
            .collect()
    }

    #[test]
    fn test_range_set_coalesces() {
        let mut set = RangeSet::new();
        set.insert(5..10);
        assert!(!set.covers_prefix(10));
        set.insert(0..5);
        assert!(set.covers_prefix(10));
        set.insert(12..15);
        set.insert(10..12);
        assert_eq!(set.ranges().collect::<Vec<_>>(), vec![0..15]);
        assert!(set.contains(14));
        assert!(!set.contains(15));
    }

    #[test]
    fn test_range_set_overlap_and_gaps() {
        let mut set = RangeSet::new();
        set.insert(10..20);
        set.insert(30..40);
        set.insert(15..35);
        assert_eq!(set.ranges().collect::<Vec<_>>(), vec![10..40]);
        assert!(!set.covers_prefix(1));
        assert!(set.covers_prefix(0));
        set.insert(3..3);
        assert_eq!(set.ranges().count(), 1);
    }

    #[test]
    fn test_flush_all_when_persisted() {
        let memory = MemoryManager::new(100);
        let mut manager = CheckpointManager::new();
        manager
            .add_stream_checkpoint(10, stream_cp(&memory, stream1(), 1))
            .unwrap();
        manager
            .add_stream_checkpoint(20, stream_cp(&memory, stream1(), 2))
            .unwrap();
        assert!(manager.take_ready().is_empty());

        manager.mark_persisted(&stream1(), 0..20);
        assert_eq!(
            payloads(manager.take_ready()),
            vec!["stream1:1", "stream1:2"]
        );
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(memory.reserved_bytes(), 0);
    }

    #[test]
    fn test_flush_only_covered_prefix() {
        let memory = MemoryManager::new(100);
        let mut manager = CheckpointManager::new();
        manager
            .add_stream_checkpoint(10, stream_cp(&memory, stream1(), 1))
            .unwrap();
        manager
            .add_stream_checkpoint(20, stream_cp(&memory, stream1(), 2))
            .unwrap();

        manager.mark_persisted(&stream1(), 10..20);
        assert!(manager.take_ready().is_empty(), "gap at the front");

        manager.mark_persisted(&stream1(), 0..10);
        assert_eq!(payloads(manager.take_ready()).len(), 2);
    }

    #[test]
    fn test_streams_release_independently() {
        let memory = MemoryManager::new(100);
        let mut manager = CheckpointManager::new();
        manager
            .add_stream_checkpoint(10, stream_cp(&memory, stream1(), 11))
            .unwrap();
        manager
            .add_stream_checkpoint(30, stream_cp(&memory, stream2(), 21))
            .unwrap();

        manager.mark_persisted(&stream2(), 0..30);
        assert_eq!(payloads(manager.take_ready()), vec!["stream2:21"]);
        assert_eq!(manager.pending_count(), 1);
    }

    #[test]
    fn test_out_of_order_is_fatal() {
        let memory = MemoryManager::new(100);
        let mut manager = CheckpointManager::new();
        manager
            .add_stream_checkpoint(20, stream_cp(&memory, stream1(), 2))
            .unwrap();
        let err = manager
            .add_stream_checkpoint(10, stream_cp(&memory, stream1(), 1))
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::CheckpointOutOfOrder {
                index: 10,
                previous: 20,
                ..
            }
        ));
    }

    #[test]
    fn test_global_needs_every_stream() {
        let memory = MemoryManager::new(100);
        let mut manager = CheckpointManager::new();
        manager
            .add_global_checkpoint(vec![(stream1(), 10), (stream2(), 20)], global_cp(&memory, 1))
            .unwrap();
        manager
            .add_global_checkpoint(vec![(stream1(), 20), (stream2(), 30)], global_cp(&memory, 2))
            .unwrap();

        manager.mark_persisted(&stream1(), 0..20);
        manager.mark_persisted(&stream2(), 0..20);
        assert_eq!(payloads(manager.take_ready()), vec!["global:1"]);

        manager.mark_persisted(&stream2(), 20..30);
        assert_eq!(payloads(manager.take_ready()), vec!["global:2"]);
    }

    #[test]
    fn test_global_with_empty_stream_is_ready() {
        let memory = MemoryManager::new(100);
        let mut manager = CheckpointManager::new();
        manager
            .add_global_checkpoint(vec![(stream1(), 0)], global_cp(&memory, 7))
            .unwrap();
        assert!(manager.is_persisted_until(&stream1(), 0));
        assert_eq!(payloads(manager.take_ready()), vec!["global:7"]);
    }
}
