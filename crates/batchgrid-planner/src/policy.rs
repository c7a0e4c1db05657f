//! Planner policy.

use serde::{Deserialize, Serialize};

use batch_core::config::BatchConfig;
use batch_core::types::LandingOrder;

/// Tunables for one batch plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPolicy {
    /// Minimum gap between consecutive landings, in ms. Negative values
    /// are rejected as infeasible.
    pub spacing_ms: i64,
    /// Fraction of max money a hack pass should extract.
    pub hack_fraction: f64,
    /// Money fraction below which the target counts as unprepared and
    /// gets zero hack threads.
    pub prep_money_fraction: f64,
    pub landing_order: LandingOrder,
}

impl Default for PlanPolicy {
    fn default() -> Self {
        Self {
            spacing_ms: 200,
            hack_fraction: 0.25,
            prep_money_fraction: 0.9,
            landing_order: LandingOrder::default(),
        }
    }
}

impl From<&BatchConfig> for PlanPolicy {
    fn from(config: &BatchConfig) -> Self {
        Self {
            spacing_ms: config.spacing_ms as i64,
            hack_fraction: config.hack_fraction,
            prep_money_fraction: config.prep_money_fraction,
            landing_order: config.landing_order,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_default_config() {
        let from_config = PlanPolicy::from(&BatchConfig::default());
        let default = PlanPolicy::default();
        assert_eq!(from_config.spacing_ms, default.spacing_ms);
        assert_eq!(from_config.hack_fraction, default.hack_fraction);
        assert_eq!(from_config.landing_order, default.landing_order);
    }
}
