//! batchgrid-alloc — packs thread requests onto grid hosts.
//!
//! Given a memory cost per thread and a desired thread count, the
//! allocator decides which hosts run how many threads:
//! 1. Whole-request placement on a single host when possible
//! 2. Greedy largest-fit splitting across hosts when permitted
//! 3. `InsufficientCapacity` (carrying any partial plan) otherwise
//!
//! Committing an allocation reserves memory on each chosen host for the
//! lifetime of the launched processes; reservations are released when
//! the caller observes the processes exit, or reclaimed by the liveness
//! sweep when exits cannot be observed.

pub mod allocator;
pub mod error;
pub mod request;

pub use allocator::{Allocation, Allocator, pack};
pub use error::{AllocError, AllocResult};
pub use request::{LaunchPlan, LaunchRequest, PlacementOptions, ThreadCount};
