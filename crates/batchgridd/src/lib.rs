//! batchgridd — daemon assembly for the batch grid.
//!
//! The binary is a thin CLI over [`runtime::Standalone`], which wires
//! the port bus, the capacity grid, the worker pool and the dispatcher
//! together from one `batchgrid.toml`. Operator inspection goes through
//! the status RPC served on the configured port pair.

pub mod runtime;
pub mod status;

pub use runtime::Standalone;
pub use status::{HostStatus, StatusCache, StatusReport};
