//! A single host of the compute grid.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Identifier for a memory reservation held against a host.
pub type ReservationId = u64;

/// Memory capacity and usage for one host.
///
/// `available()` is derived: total minus used minus all outstanding
/// reservations, saturating at zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    /// Total memory capacity in GB.
    pub total_gb: f64,
    /// Memory used by processes already running, in GB.
    pub used_gb: f64,
    /// Outstanding reservations: reservation id → reserved GB.
    reserved: HashMap<ReservationId, f64>,
}

impl Host {
    pub fn new(name: impl Into<String>, total_gb: f64) -> Self {
        Self {
            name: name.into(),
            total_gb,
            used_gb: 0.0,
            reserved: HashMap::new(),
        }
    }

    /// Memory available for new launches, in GB.
    pub fn available_gb(&self) -> f64 {
        let reserved: f64 = self.reserved.values().sum();
        (self.total_gb - self.used_gb - reserved).max(0.0)
    }

    /// Sum of outstanding reservations, in GB.
    pub fn reserved_gb(&self) -> f64 {
        self.reserved.values().sum()
    }

    /// Hold `amount_gb` against this host under the given reservation id.
    pub fn reserve(&mut self, id: ReservationId, amount_gb: f64) {
        *self.reserved.entry(id).or_insert(0.0) += amount_gb;
    }

    /// Release a reservation, returning the freed amount if it existed.
    pub fn release(&mut self, id: ReservationId) -> Option<f64> {
        self.reserved.remove(&id)
    }

    /// Whether this host currently holds the given reservation.
    pub fn holds(&self, id: ReservationId) -> bool {
        self.reserved.contains_key(&id)
    }
}
