//! Operator-facing status snapshot, cached for the RPC handler.
//!
//! The RPC handler is synchronous, so it never touches the bus or the
//! allocator directly; a background loop refreshes this cache and the
//! handler serves whatever snapshot is current.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use batchgrid_dispatch::BatchReport;

/// Batches retained in the status snapshot, newest last.
const BATCH_HISTORY: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostStatus {
    pub name: String,
    pub total_gb: f64,
    pub available_gb: f64,
}

/// Everything `batchgridd status` reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub running: bool,
    pub workers: usize,
    pub backlog: usize,
    pub hosts: Vec<HostStatus>,
    pub batches: Vec<BatchReport>,
}

/// Shared snapshot: one writer (the refresh loop and the batch cycle),
/// any number of readers.
#[derive(Clone, Default)]
pub struct StatusCache {
    inner: Arc<RwLock<StatusReport>>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> StatusReport {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut StatusReport)) {
        let mut report = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut report);
    }

    /// Append a finished batch, dropping the oldest beyond the history
    /// bound.
    pub fn push_batch(&self, batch: BatchReport) {
        self.update(|report| {
            report.batches.push(batch);
            if report.batches.len() > BATCH_HISTORY {
                let excess = report.batches.len() - BATCH_HISTORY;
                report.batches.drain(..excess);
            }
        });
    }

    pub fn to_value(&self) -> Result<Value, String> {
        serde_json::to_value(self.get()).map_err(|e| e.to_string())
    }
}
