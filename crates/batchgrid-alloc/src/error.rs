//! Allocator error types.

use thiserror::Error;

use crate::request::LaunchPlan;

/// Errors that can occur while placing a launch request.
#[derive(Debug, Error)]
pub enum AllocError {
    /// The grid cannot hold the requested thread count. Carries any
    /// partial plan computed so the caller may opt into a partial run.
    #[error("insufficient capacity: placed {}/{} threads", placed_threads(placed), requested)]
    InsufficientCapacity {
        requested: u32,
        placed: Vec<LaunchPlan>,
    },

    #[error("invalid launch request: {0}")]
    InvalidRequest(String),

    #[error("unknown reservation: {0}")]
    UnknownReservation(u64),
}

fn placed_threads(plans: &[LaunchPlan]) -> u32 {
    plans.iter().map(|p| p.threads).sum()
}

pub type AllocResult<T> = Result<T, AllocError>;
