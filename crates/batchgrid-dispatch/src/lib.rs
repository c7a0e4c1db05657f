//! batchgrid-dispatch — runs planned batches end to end.
//!
//! The dispatcher sits between the planner, the allocator and the
//! worker pool: it commits capacity for a whole batch up front, turns
//! the plan's relative start offsets into absolute epoch times, submits
//! one task per operation, and awaits all landings. The outcome of a
//! batch is a [`BatchReport`] — per-operation dispositions rather than
//! a single pass/fail, because a batch can partially degrade (a skewed
//! start abandoned here, a lost worker there) and still be worth
//! reporting.

pub mod dispatcher;
pub mod error;

pub use dispatcher::{BatchReport, Dispatcher, DispatcherConfig, OpReport, OpStatus};
pub use error::{DispatchError, DispatchResult};
