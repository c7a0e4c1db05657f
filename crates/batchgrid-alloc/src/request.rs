//! Launch requests and plans.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// How many threads the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadCount {
    /// Exactly this many threads, or fail.
    Exact(u32),
    /// As many threads as the grid can hold: the largest single host
    /// when splitting is disallowed, the grid-wide sum when allowed.
    Max,
}

/// Placement hints for a launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementOptions {
    /// Try this host first for whole-request placement.
    pub preferred_host: Option<String>,
    /// Whether the request may be split into multiple sub-launches.
    pub allow_split: bool,
    /// Hosts that must not receive any part of this launch.
    pub exclude_hosts: HashSet<String>,
}

impl Default for PlacementOptions {
    fn default() -> Self {
        Self {
            preferred_host: None,
            allow_split: true,
            exclude_hosts: HashSet::new(),
        }
    }
}

/// A request to run a script across the grid. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Script identity, e.g. "worker.js".
    pub script: String,
    /// Memory cost of one thread, in GB.
    pub ram_per_thread_gb: f64,
    pub threads: ThreadCount,
    pub args: Vec<String>,
    pub options: PlacementOptions,
}

impl LaunchRequest {
    pub fn new(script: impl Into<String>, ram_per_thread_gb: f64, threads: ThreadCount) -> Self {
        Self {
            script: script.into(),
            ram_per_thread_gb,
            threads,
            args: Vec::new(),
            options: PlacementOptions::default(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn no_split(mut self) -> Self {
        self.options.allow_split = false;
        self
    }

    pub fn prefer(mut self, host: impl Into<String>) -> Self {
        self.options.preferred_host = Some(host.into());
        self
    }

    pub fn exclude(mut self, host: impl Into<String>) -> Self {
        self.options.exclude_hosts.insert(host.into());
        self
    }
}

/// One sub-launch of a request: `threads` threads of the script on
/// `host`. The sum of threads across a request's plans equals the
/// requested count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchPlan {
    pub host: String,
    pub threads: u32,
    pub args: Vec<String>,
}
