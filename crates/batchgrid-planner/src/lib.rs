//! batchgrid-planner — computes batch plans for a target.
//!
//! For one weaken/grow/hack cycle against a target, the planner decides
//! how many threads each operation needs and when each must start so
//! that all three *land* in the configured order with a minimum spacing
//! between landings. Offsets are computed backward from a common
//! completion anchor; the caller converts them to absolute times at
//! dispatch.
//!
//! Capacity is deliberately not a planner concern: the returned plan is
//! theoretical, and shortfalls surface in the allocator.

pub mod error;
pub mod planner;
pub mod policy;

pub use error::{PlanError, PlanResult};
pub use planner::{BatchPlan, OpPlan, plan};
pub use policy::PlanPolicy;
