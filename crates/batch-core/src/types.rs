//! Core record types shared across the workspace.

use serde::{Deserialize, Serialize};

/// Unique identifier for a submitted task.
pub type TaskId = u64;

/// The three timed remote operations a worker can run against a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Weaken,
    Grow,
    Hack,
}

impl OpKind {
    /// All operation kinds, in landing-policy declaration order.
    pub const ALL: [OpKind; 3] = [OpKind::Weaken, OpKind::Grow, OpKind::Hack];

    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Weaken => "weaken",
            OpKind::Grow => "grow",
            OpKind::Hack => "hack",
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Required completion order for the operations of one batch.
///
/// Ordering is configurable — the first variant element lands first,
/// each subsequent operation lands one spacing interval later.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LandingOrder {
    /// Hack lands first, then grow, then weaken re-hardens last.
    #[default]
    HackGrowWeaken,
    /// Weaken lands first, then grow, then hack extracts last.
    WeakenGrowHack,
}

impl LandingOrder {
    /// Operations in landing order (first element completes first).
    pub fn sequence(&self) -> [OpKind; 3] {
        match self {
            LandingOrder::HackGrowWeaken => [OpKind::Hack, OpKind::Grow, OpKind::Weaken],
            LandingOrder::WeakenGrowHack => [OpKind::Weaken, OpKind::Grow, OpKind::Hack],
        }
    }
}

/// Point-in-time read of a target host's hardening and money state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSnapshot {
    pub hostname: String,
    /// Current security level. Operations get slower as this rises.
    pub security: f64,
    /// Floor the security level can be weakened to.
    pub min_security: f64,
    /// Money currently available on the target.
    pub money: f64,
    /// Maximum money the target can hold.
    pub max_money: f64,
}

impl TargetSnapshot {
    /// Whether the target is fully prepared: security at minimum and
    /// money at (or above) the given fraction of max.
    pub fn is_prepared(&self, money_fraction: f64) -> bool {
        self.security <= self.min_security && self.money >= self.max_money * money_fraction
    }
}

/// Unit of work pushed into the worker mailbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: OpKind,
    /// Target hostname the operation runs against.
    pub target: String,
    /// Threads behind this operation. The effect of the operation
    /// scales linearly with it; the duration does not.
    pub threads: u32,
    /// Absolute start time (epoch ms). `None` means start immediately.
    pub start_time_ms: Option<u64>,
}

/// Why a task failed. Structured so callers never have to classify on
/// the human-readable error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// The operation ran and reported an error.
    Execution,
    /// A worker claimed the task too late to honor its start time.
    StartMissed,
    /// The claiming worker disappeared and the requeue was spent.
    WorkerLost,
}

/// Outcome of a single executed task, posted back under the task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub id: TaskId,
    pub success: bool,
    /// Money moved (hack/grow) or security removed (weaken).
    pub value: Option<f64>,
    /// How many executions this task took, including requeues.
    pub attempts: u32,
    pub failure: Option<FailureKind>,
    /// Human-readable failure detail, when the task failed.
    pub error: Option<String>,
}

impl TaskResult {
    pub fn ok(id: TaskId, value: f64, attempts: u32) -> Self {
        Self {
            id,
            success: true,
            value: Some(value),
            attempts,
            failure: None,
            error: None,
        }
    }

    pub fn failed(id: TaskId, attempts: u32, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            value: None,
            attempts,
            failure: Some(FailureKind::Execution),
            error: Some(error.into()),
        }
    }

    pub fn abandoned(id: TaskId, attempts: u32) -> Self {
        Self {
            id,
            success: false,
            value: None,
            attempts,
            failure: Some(FailureKind::StartMissed),
            error: Some("start time missed".to_string()),
        }
    }

    pub fn lost(id: TaskId, attempts: u32) -> Self {
        Self {
            id,
            success: false,
            value: None,
            attempts,
            failure: Some(FailureKind::WorkerLost),
            error: Some("worker lost".to_string()),
        }
    }
}
