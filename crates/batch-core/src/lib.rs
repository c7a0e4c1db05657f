//! batch-core — shared types for the BatchGrid scheduler.
//!
//! Everything that crosses a crate boundary lives here:
//! - Operation kinds and the timed-operation model (durations, security
//!   and money effects, memory footprints)
//! - Task and result records exchanged over ports
//! - `batchgrid.toml` configuration

pub mod config;
pub mod model;
pub mod types;

pub use config::BatchgridConfig;
pub use types::{FailureKind, LandingOrder, OpKind, Task, TaskId, TaskResult, TargetSnapshot};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix epoch in milliseconds.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
