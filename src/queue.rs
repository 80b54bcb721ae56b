//! Partitioned message queues.
//!
//! Each stream gets one [`PartitionedQueue`] with a fixed number of partitions.
//! Partitions are independent FIFO lanes, each an unbounded mpsc channel:
//! blocking on empty, and ending only once the queue is closed and the
//! buffered items are drained.
//! Memory use is bounded elsewhere (see `memory`), not by queue capacity.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::poll_fn;
use futures::Stream;
use tokio::sync::mpsc;

use crate::error::{PipelineError, Result};

/// One lane: an unbounded channel whose sender goes away on close.
struct Partition<T> {
    tx: Mutex<Option<mpsc::UnboundedSender<T>>>,
    rx: Mutex<mpsc::UnboundedReceiver<T>>,
}

impl<T> Partition<T> {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
        }
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<T>>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn receiver(&self) -> MutexGuard<'_, mpsc::UnboundedReceiver<T>> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct PartitionedQueue<T> {
    partitions: Vec<Partition<T>>,
    closed: AtomicBool,
}

impl<T> PartitionedQueue<T> {
    /// Create a queue with `partitions` lanes (at least one).
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| Partition::new()).collect(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Items buffered in one partition.
    pub fn buffered(&self, partition: usize) -> usize {
        self.partitions
            .get(partition)
            .map(|p| p.receiver().len())
            .unwrap_or(0)
    }

    pub fn publish(&self, item: T, partition: usize) -> Result<()> {
        let lane = self.partition(partition)?;
        let sender = lane.sender();
        match sender.as_ref() {
            Some(tx) => tx.send(item).map_err(|_| PipelineError::QueueClosed),
            None => Err(PipelineError::QueueClosed),
        }
    }

    /// Publish one item per partition, built by `make`.
    pub fn broadcast(&self, make: impl Fn() -> T) -> Result<()> {
        for partition in 0..self.partitions.len() {
            self.publish(make(), partition)?;
        }
        Ok(())
    }

    /// Stop accepting items. Consumers drain what is buffered, then end.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for lane in &self.partitions {
            lane.sender().take();
        }
    }

    /// Close and drop everything still buffered. Used on failure.
    pub fn cancel(&self) {
        self.close();
        for lane in &self.partitions {
            let mut rx = lane.receiver();
            while rx.try_recv().is_ok() {}
        }
    }

    fn partition(&self, partition: usize) -> Result<&Partition<T>> {
        self.partitions
            .get(partition)
            .ok_or(PipelineError::NoSuchPartition {
                partition,
                partitions: self.partitions.len(),
            })
    }
}

impl<T: Send + 'static> PartitionedQueue<T> {
    /// Start consuming one partition.
    pub fn consume(self: &Arc<Self>, partition: usize) -> Result<PartitionConsumer<T>> {
        self.partition(partition)?;
        Ok(PartitionConsumer {
            queue: self.clone(),
            partition,
        })
    }
}

/// Reader over one partition of a [`PartitionedQueue`].
pub struct PartitionConsumer<T> {
    queue: Arc<PartitionedQueue<T>>,
    partition: usize,
}

impl<T: Send + 'static> PartitionConsumer<T> {
    pub fn partition(&self) -> usize {
        self.partition
    }

    /// Next item in FIFO order; waits while the partition is empty.
    /// Returns `None` once the queue is closed and drained.
    ///
    /// Cancel safe: dropping the future never loses an item.
    pub async fn next(&mut self) -> Option<T> {
        let lane = &self.queue.partitions[self.partition];
        // The receiver lock is held only while polling, never across a wait.
        poll_fn(|cx| lane.receiver().poll_recv(cx)).await
    }

    pub fn into_stream(self) -> impl Stream<Item = T> + Send {
        futures::stream::unfold(self, |mut consumer| async move {
            let item = consumer.next().await?;
            Some((item, consumer))
        })
    }
}

/// Lazily creates one queue per key, all with the same partition count.
pub struct QueueSupplier<K, T> {
    partitions: usize,
    queues: Mutex<HashMap<K, Arc<PartitionedQueue<T>>>>,
}

impl<K: Eq + Hash + Clone, T> QueueSupplier<K, T> {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Return the queue for `key`, creating it on first use.
    pub fn get(&self, key: &K) -> Arc<PartitionedQueue<T>> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues
            .entry(key.clone())
            .or_insert_with(|| Arc::new(PartitionedQueue::new(self.partitions)))
            .clone()
    }

    pub fn close_all(&self) {
        for queue in self.snapshot() {
            queue.close();
        }
    }

    pub fn cancel_all(&self) {
        for queue in self.snapshot() {
            queue.cancel();
        }
    }

    fn snapshot(&self) -> Vec<Arc<PartitionedQueue<T>>> {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.values().cloned().collect()
    }
}
