#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Destination-side write pipeline.
//!
//! Records from an upstream source are admitted against a fixed memory
//! budget, indexed per stream, spilled to disk in batches and handed to a
//! [`pipeline::TaskLauncher`]. Checkpoints are held back until every record
//! they cover has been handed off, then passed to a
//! [`state::CheckpointEmitter`].

pub mod config;
pub mod error;
pub mod logging;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod output;
pub mod pipeline;
pub mod queue;
pub mod state;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use memory::{MemoryManager, Reservation, Reserved};
pub use message::{CheckpointMessage, DestinationMessage, DestinationRecord, StreamDescriptor};
pub use pipeline::{Pipeline, SizedInput, SyncSummary};
