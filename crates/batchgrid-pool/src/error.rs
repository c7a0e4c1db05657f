//! Worker pool error types.

use thiserror::Error;

use batch_core::types::TaskId;

/// Errors that can occur operating the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The claiming worker disappeared and the task's single requeue
    /// was already spent.
    #[error("worker lost while executing task {0}")]
    WorkerLost(TaskId),

    #[error("no result for task {0} within the timeout")]
    ResultTimeout(TaskId),

    /// Graceful stop did not complete within the grace window.
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,

    /// The supervisor is gone; the pool requires an external restart.
    #[error("pool supervisor lost")]
    SupervisorLost,

    #[error("pool is not running")]
    NotRunning,

    #[error("port error: {0}")]
    Port(#[from] batchgrid_port::PortError),
}

pub type PoolResult<T> = Result<T, PoolError>;
