//! batchgrid-port — process-wide addressable channels.
//!
//! A port is a small-integer-addressed channel holding two things:
//! - a single **slot** record, written once and mutated in place, whose
//!   readers always peek the latest snapshot (the mailbox pattern)
//! - a FIFO **queue** of records for work distribution, where a pop is
//!   the atomic claim of exactly one consumer
//!
//! Ports carry `serde_json::Value` so heterogeneous record types share
//! one bus; typed helpers serialize at the edges. On top of the bus,
//! [`service`] provides a synchronous request/response RPC façade with
//! at-most-one in-flight request per correlation id.
//!
//! There is no cross-port transaction: correctness relies on each slot
//! field being owned by exactly one writer, and on `update_slot` doing
//! its read-modify-write under the bus write lock.

pub mod bus;
pub mod error;
pub mod service;

pub use bus::PortBus;
pub use error::{PortError, PortResult};
pub use service::{Handler, PortService, ServiceClient};
