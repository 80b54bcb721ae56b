//! Sync-wide state: per-stream counters and checkpoint release tracking.

pub mod checkpoint;
pub mod stream;

pub use checkpoint::{CheckpointEmitter, CheckpointManager, RangeSet};
pub use stream::{StreamManager, StreamResult, SyncManager};
