//! Planner error types.

use thiserror::Error;

/// Errors that can occur while planning a batch.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Ordering constraints cannot be satisfied with the given policy.
    /// Not retried — the caller must adjust the policy.
    #[error("plan infeasible: {0}")]
    Infeasible(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),
}

pub type PlanResult<T> = Result<T, PlanError>;
