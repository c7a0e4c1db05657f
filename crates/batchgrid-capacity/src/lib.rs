//! batchgrid-capacity — the capacity model for the compute grid.
//!
//! A pure data/query layer: point-in-time host snapshots, available
//! memory derived from capacity minus usage minus reservations, and the
//! conservative per-script memory cost computed from a worker's declared
//! capabilities. Nothing here launches or observes processes — mutation
//! happens through the allocator.

pub mod cost;
pub mod grid;
pub mod host;

pub use cost::script_cost_gb;
pub use grid::Grid;
pub use host::{Host, ReservationId};
