//! Port service error types.

use thiserror::Error;

/// Errors that can occur on the port bus or the RPC façade.
#[derive(Debug, Error)]
pub enum PortError {
    /// The port was never opened on this bus.
    #[error("port not open: {0}")]
    PortClosed(u16),

    /// A timed wait elapsed without the record appearing.
    #[error("timed out waiting on port")]
    Timeout,

    /// A request with this correlation id is already in flight.
    #[error("request already in flight: {0}")]
    InFlight(u64),

    #[error("record serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type PortResult<T> = Result<T, PortError>;
