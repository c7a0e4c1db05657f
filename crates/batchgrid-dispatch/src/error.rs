//! Dispatcher error types.

use thiserror::Error;

use batchgrid_alloc::AllocError;
use batchgrid_planner::PlanError;
use batchgrid_pool::PoolError;

/// Errors that abort a batch dispatch.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("allocation error: {0}")]
    Alloc(#[from] AllocError),

    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),
}

pub type DispatchResult<T> = Result<T, DispatchError>;
