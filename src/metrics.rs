use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn max(&self, value: u64) {
        self.0.fetch_max(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters shared by every task of one pipeline run.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub records_routed: Counter,
    pub checkpoints_routed: Counter,
    pub batches_flushed: Counter,
    pub bytes_spilled: Counter,
    pub batches_discarded: Counter,
    pub checkpoints_emitted: Counter,
    pub largest_batch_bytes: Gauge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub records_routed: u64,
    pub checkpoints_routed: u64,
    pub batches_flushed: u64,
    pub bytes_spilled: u64,
    pub batches_discarded: u64,
    pub checkpoints_emitted: u64,
    pub largest_batch_bytes: u64,
}

impl PipelineMetrics {
    pub fn on_batch_flushed(&self, bytes: u64) {
        self.batches_flushed.inc();
        self.bytes_spilled.inc_by(bytes);
        self.largest_batch_bytes.max(bytes);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_routed: self.records_routed.get(),
            checkpoints_routed: self.checkpoints_routed.get(),
            batches_flushed: self.batches_flushed.get(),
            bytes_spilled: self.bytes_spilled.get(),
            batches_discarded: self.batches_discarded.get(),
            checkpoints_emitted: self.checkpoints_emitted.get(),
            largest_batch_bytes: self.largest_batch_bytes.get(),
        }
    }
}
