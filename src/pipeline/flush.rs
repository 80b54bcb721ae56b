//! Batch cut policy.

use std::ops::RangeInclusive;

use crate::config::PipelineConfig;
use crate::message::StreamDescriptor;

/// Decides when an in-progress batch is cut.
///
/// Evaluated after every appended record. Must be pure: the same inputs always
/// give the same answer.
pub trait FlushStrategy: Send + Sync + 'static {
    fn should_flush(
        &self,
        stream: &StreamDescriptor,
        record_index_range: &RangeInclusive<u64>,
        bytes_accumulated: u64,
    ) -> bool;
}

/// Cut on accumulated bytes, and optionally on record count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultFlushStrategy {
    pub max_batch_bytes: u64,
    pub max_batch_records: Option<u64>,
}

impl DefaultFlushStrategy {
    pub fn new(max_batch_bytes: u64) -> Self {
        Self {
            max_batch_bytes,
            max_batch_records: None,
        }
    }

    pub fn with_max_records(mut self, max_batch_records: u64) -> Self {
        self.max_batch_records = Some(max_batch_records);
        self
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_batch_bytes: config.max_batch_bytes,
            max_batch_records: config.max_batch_records,
        }
    }
}

impl FlushStrategy for DefaultFlushStrategy {
    fn should_flush(
        &self,
        _stream: &StreamDescriptor,
        record_index_range: &RangeInclusive<u64>,
        bytes_accumulated: u64,
    ) -> bool {
        if bytes_accumulated >= self.max_batch_bytes {
            return true;
        }
        match self.max_batch_records {
            Some(max) => {
                let records = record_index_range.end() - record_index_range.start() + 1;
                records >= max
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> StreamDescriptor {
        StreamDescriptor::new(None, "a")
    }

    #[test]
    fn test_cuts_at_byte_threshold() {
        let strategy = DefaultFlushStrategy::new(1024);
        assert!(!strategy.should_flush(&stream(), &(0..=510), 1022));
        assert!(strategy.should_flush(&stream(), &(0..=511), 1024));
        assert!(strategy.should_flush(&stream(), &(0..=0), 4096));
    }

    #[test]
    fn test_cuts_at_record_count() {
        let strategy = DefaultFlushStrategy::new(u64::MAX).with_max_records(10);
        assert!(!strategy.should_flush(&stream(), &(20..=28), 9));
        assert!(strategy.should_flush(&stream(), &(20..=29), 10));
    }

    #[test]
    fn test_from_config() {
        let config = PipelineConfig {
            max_batch_bytes: 64,
            max_batch_records: Some(3),
            ..PipelineConfig::default()
        };
        let strategy = DefaultFlushStrategy::from_config(&config);
        assert_eq!(strategy.max_batch_bytes, 64);
        assert_eq!(strategy.max_batch_records, Some(3));
    }
}
