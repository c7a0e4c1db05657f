//! The grid — the registry of hosts and point-in-time capacity reads.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::host::{Host, ReservationId};

/// Registry of all hosts in the compute grid.
///
/// Reads are point-in-time snapshots; `hosts()` returns a fresh,
/// restartable sequence on every call. Hosts are destroyed and
/// recreated wholesale when a machine is decommissioned and
/// re-provisioned.
#[derive(Debug, Default, Clone)]
pub struct Grid {
    hosts: BTreeMap<String, Host>,
}

impl Grid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a host. Replacing drops any prior reservations —
    /// re-provisioning destroys the old record.
    pub fn provision(&mut self, host: Host) {
        info!(host = %host.name, total_gb = host.total_gb, "host provisioned");
        self.hosts.insert(host.name.clone(), host);
    }

    /// Remove a host entirely. Returns the removed record.
    pub fn decommission(&mut self, name: &str) -> Option<Host> {
        let removed = self.hosts.remove(name);
        if removed.is_some() {
            info!(host = name, "host decommissioned");
        }
        removed
    }

    /// Fresh snapshot sequence over all hosts.
    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    pub fn get(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Host> {
        self.hosts.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Grid-wide available memory, in GB.
    pub fn total_available_gb(&self) -> f64 {
        self.hosts.values().map(Host::available_gb).sum()
    }

    /// Largest single-host available memory, in GB.
    pub fn largest_available_gb(&self) -> f64 {
        self.hosts
            .values()
            .map(Host::available_gb)
            .fold(0.0, f64::max)
    }

    /// Release one reservation id across every host that holds it.
    /// Returns the total GB freed.
    pub fn release_everywhere(&mut self, id: ReservationId) -> f64 {
        let mut freed = 0.0;
        for host in self.hosts.values_mut() {
            if let Some(amount) = host.release(id) {
                debug!(host = %host.name, reservation = id, amount_gb = amount, "reservation released");
                freed += amount;
            }
        }
        freed
    }
}
