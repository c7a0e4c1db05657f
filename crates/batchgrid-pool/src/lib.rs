//! batchgrid-pool — the persistent worker pool.
//!
//! A supervisor starts N long-lived workers. Work flows through the
//! port bus: the supervisor (and any dispatcher holding a handle)
//! pushes tasks onto the task port, workers claim them atomically,
//! execute the timed remote operation, and post results keyed by task
//! id. Pool state — the running flag and the worker registry — lives in
//! the control port's slot record so that independent stop/inspect
//! commands can observe and mutate it without a supervisor reference.
//!
//! Ownership convention: the supervisor owns the pool's `running` flag
//! and the registry's existence; each worker owns its own record's
//! fields. All mutation goes through the bus write lock.

pub mod error;
pub mod executor;
pub mod mailbox;
pub mod supervisor;
pub mod worker;

pub use error::{PoolError, PoolResult};
pub use executor::{Executor, FnExecutor, OpFuture, OpOutcome, SimExecutor};
pub use mailbox::{Mailbox, PoolState, QueuedTask, WorkerRecord};
pub use supervisor::{PoolHandle, WorkerPool, WorkerPoolConfig};
pub use worker::Worker;
