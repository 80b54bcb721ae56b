//! Pipeline configuration.
//!
//! Loaded from TOML; every field has a default so an empty file is valid.
//!
//! ```toml
//! memory_budget_bytes = 268435456
//! partitions_per_stream = 2
//! max_batch_bytes = 209715200
//! spill_dir = "/var/tmp/spillway"
//! reservation_timeout_ms = 60000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{PipelineError, Result};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Ceiling on bytes held by in-flight messages.
    pub memory_budget_bytes: u64,
    /// Parallel lanes per stream queue.
    pub partitions_per_stream: usize,
    /// Consecutive records routed to one partition before moving to the next.
    pub partition_run_records: u64,
    /// A batch is cut once it holds at least this many bytes.
    pub max_batch_bytes: u64,
    /// Optional record-count cut, checked alongside `max_batch_bytes`.
    pub max_batch_records: Option<u64>,
    /// Where batch files are written.
    pub spill_dir: PathBuf,
    /// Give up on a memory reservation after this long.
    pub reservation_timeout_ms: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 256 * MIB,
            partitions_per_stream: 1,
            partition_run_records: 10_000,
            max_batch_bytes: 200 * MIB,
            max_batch_records: None,
            spill_dir: std::env::temp_dir().join("spillway"),
            reservation_timeout_ms: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: PipelineConfig =
            toml::from_str(s).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory_budget_bytes == 0 {
            return Err(PipelineError::Config(
                "memory_budget_bytes must be greater than zero".to_string(),
            ));
        }
        if self.partitions_per_stream == 0 {
            return Err(PipelineError::Config(
                "partitions_per_stream must be greater than zero".to_string(),
            ));
        }
        if self.partition_run_records == 0 {
            return Err(PipelineError::Config(
                "partition_run_records must be greater than zero".to_string(),
            ));
        }
        if self.max_batch_bytes == 0 {
            return Err(PipelineError::Config(
                "max_batch_bytes must be greater than zero".to_string(),
            ));
        }
        if self.max_batch_records == Some(0) {
            return Err(PipelineError::Config(
                "max_batch_records must be greater than zero when set".to_string(),
            ));
        }
        if self.lane_bytes(1) > self.memory_budget_bytes {
            // Only a record-count cut or stream completion can flush such batches.
            tracing::warn!(
                max_batch_bytes = self.max_batch_bytes,
                partitions_per_stream = self.partitions_per_stream,
                memory_budget_bytes = self.memory_budget_bytes,
                "open batches can exceed memory budget; size-based flushes may never trigger"
            );
        }
        Ok(())
    }

    /// Bytes held when every spill lane of `streams` streams has an open batch
    /// just short of the size cut.
    pub fn lane_bytes(&self, streams: usize) -> u64 {
        let lanes = streams.saturating_mul(self.partitions_per_stream);
        u64::try_from(lanes)
            .unwrap_or(u64::MAX)
            .saturating_mul(self.max_batch_bytes)
    }

    /// Check that `streams` streams can always make progress within the budget.
    ///
    /// When every lane's open batch may together fill the budget, no lane can
    /// reach its size cut and the producer parks forever. That layout is
    /// rejected unless a reservation timeout turns the stall into an error.
    pub fn validate_for_streams(&self, streams: usize) -> Result<()> {
        let needed = self.lane_bytes(streams);
        if needed <= self.memory_budget_bytes {
            return Ok(());
        }
        if let Some(timeout) = self.reservation_timeout() {
            tracing::warn!(
                streams,
                needed_bytes = needed,
                memory_budget_bytes = self.memory_budget_bytes,
                ?timeout,
                "open batches can exhaust memory budget; relying on reservation timeout"
            );
            return Ok(());
        }
        Err(PipelineError::Config(format!(
            "{} streams x {} partitions x max_batch_bytes {} = {} bytes exceeds memory_budget_bytes {}; \
             lower max_batch_bytes, raise the budget, or set reservation_timeout_ms",
            streams,
            self.partitions_per_stream,
            self.max_batch_bytes,
            needed,
            self.memory_budget_bytes
        )))
    }

    pub fn reservation_timeout(&self) -> Option<Duration> {
        self.reservation_timeout_ms.map(Duration::from_millis)
    }
}
