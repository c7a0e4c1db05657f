//! Per-script memory cost from declared capabilities.

use std::collections::HashSet;

use batch_core::model::{SCRIPT_BASE_GB, capability_footprint_gb};
use batch_core::types::OpKind;

/// Memory cost per thread of a worker script, in GB.
///
/// The footprint is the union of every operation the script is
/// statically capable of performing. Which operation actually runs is
/// chosen at runtime, so capacity must be reserved as if all of them
/// could be invoked.
pub fn script_cost_gb(capabilities: &[OpKind]) -> f64 {
    let distinct: HashSet<OpKind> = capabilities.iter().copied().collect();
    SCRIPT_BASE_GB
        + distinct
            .into_iter()
            .map(capability_footprint_gb)
            .sum::<f64>()
}
