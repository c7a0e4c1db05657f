//! batchgrid.toml configuration parser.
//!
//! Every field has a serde default so an empty file (or no file) is a
//! valid configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{LandingOrder, TargetSnapshot};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchgridConfig {
    pub batch: BatchConfig,
    pub pool: PoolConfig,
    pub ports: PortConfig,
    pub grid: GridConfig,
}

/// Planner and dispatcher tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Minimum gap between consecutive operation landings, in ms.
    pub spacing_ms: u64,
    /// A task whose planned start time passed by more than this is
    /// abandoned rather than executed late.
    pub start_slack_ms: u64,
    /// Fraction of max money a hack pass should extract.
    pub hack_fraction: f64,
    /// Money fraction below which a target counts as unprepared.
    pub prep_money_fraction: f64,
    pub landing_order: LandingOrder,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            spacing_ms: 200,
            start_slack_ms: 500,
            hack_fraction: 0.25,
            prep_money_fraction: 0.9,
            landing_order: LandingOrder::default(),
        }
    }
}

/// Worker pool tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of long-lived worker loops to start.
    pub workers: u32,
    /// Idle sleep between mailbox polls, in ms.
    pub poll_interval_ms: u64,
    /// How long graceful stop waits before force-killing, in ms.
    pub grace_window_ms: u64,
    /// A worker whose heartbeat is older than this is considered lost.
    pub heartbeat_timeout_ms: u64,
    /// How many times a task is requeued after a failed or lost
    /// execution before it is surfaced as permanently failed.
    pub max_requeues: u32,
    /// Posted results nobody consumes within this window are pruned, in
    /// ms.
    pub result_ttl_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 50,
            grace_window_ms: 2_000,
            heartbeat_timeout_ms: 1_500,
            max_requeues: 1,
            result_ttl_ms: 600_000,
        }
    }
}

/// Port numbers are the sole addressing scheme for mailboxes and
/// services; callers learn them from this section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Task queue the workers poll.
    pub tasks: u16,
    /// Results keyed by task id.
    pub results: u16,
    /// Pool control record (running flag, worker registry).
    pub control: u16,
    /// Request/response RPC service.
    pub rpc: u16,
    /// Reply slot for the RPC service.
    pub rpc_reply: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            tasks: 1,
            results: 2,
            control: 3,
            rpc: 4,
            rpc_reply: 5,
        }
    }
}

/// Static description of the compute grid for standalone mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub hosts: Vec<HostConfig>,
    /// Simulated targets the standalone daemon batches against.
    pub targets: Vec<TargetConfig>,
    /// Multiplier on simulated operation durations.
    pub time_scale: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            targets: Vec::new(),
            time_scale: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub name: String,
    pub ram_gb: f64,
}

/// A simulated target for standalone mode. Only the name and the money
/// ceiling are required; the rest defaults to a prepared target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub max_money: f64,
    #[serde(default = "TargetConfig::default_min_security")]
    pub min_security: f64,
    /// Current security level; defaults to the minimum.
    #[serde(default)]
    pub security: Option<f64>,
    /// Current money; defaults to the ceiling.
    #[serde(default)]
    pub money: Option<f64>,
}

impl TargetConfig {
    fn default_min_security() -> f64 {
        1.0
    }

    pub fn snapshot(&self) -> TargetSnapshot {
        TargetSnapshot {
            hostname: self.name.clone(),
            security: self.security.unwrap_or(self.min_security),
            min_security: self.min_security,
            money: self.money.unwrap_or(self.max_money),
            max_money: self.max_money,
        }
    }
}

impl BatchgridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&content)?)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_valid() {
        let config = BatchgridConfig::from_toml_str("").unwrap();
        assert_eq!(config.batch.spacing_ms, 200);
        assert_eq!(config.pool.workers, 4);
        assert_eq!(config.ports.tasks, 1);
        assert!(config.grid.hosts.is_empty());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config = BatchgridConfig::from_toml_str(
            r#"
[batch]
spacing_ms = 50
"#,
        )
        .unwrap();
        assert_eq!(config.batch.spacing_ms, 50);
        assert_eq!(config.batch.start_slack_ms, 500);
        assert_eq!(config.pool.grace_window_ms, 2_000);
    }

    #[test]
    fn grid_hosts_parse() {
        let config = BatchgridConfig::from_toml_str(
            r#"
[[grid.hosts]]
name = "h1"
ram_gb = 64.0

[[grid.hosts]]
name = "h2"
ram_gb = 32.0
"#,
        )
        .unwrap();
        assert_eq!(config.grid.hosts.len(), 2);
        assert_eq!(config.grid.hosts[0].name, "h1");
        assert_eq!(config.grid.hosts[1].ram_gb, 32.0);
    }

    #[test]
    fn target_defaults_to_prepared() {
        let config = BatchgridConfig::from_toml_str(
            r#"
[[grid.targets]]
name = "alpha"
max_money = 1e7
"#,
        )
        .unwrap();
        let snap = config.grid.targets[0].snapshot();
        assert_eq!(snap.security, 1.0);
        assert_eq!(snap.money, 1e7);
        assert!(snap.is_prepared(0.9));
    }

    #[test]
    fn unprepared_target_overrides() {
        let config = BatchgridConfig::from_toml_str(
            r#"
[[grid.targets]]
name = "beta"
max_money = 1e7
min_security = 2.0
security = 5.0
money = 1e6
"#,
        )
        .unwrap();
        let snap = config.grid.targets[0].snapshot();
        assert_eq!(snap.security, 5.0);
        assert_eq!(snap.money, 1e6);
        assert!(!snap.is_prepared(0.9));
    }

    #[test]
    fn landing_order_from_toml() {
        let config = BatchgridConfig::from_toml_str(
            r#"
[batch]
landing_order = "weaken-grow-hack"
"#,
        )
        .unwrap();
        assert_eq!(config.batch.landing_order, LandingOrder::WeakenGrowHack);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = BatchgridConfig::default();
        let s = config.to_toml_string().unwrap();
        let back = BatchgridConfig::from_toml_str(&s).unwrap();
        assert_eq!(back.pool.poll_interval_ms, config.pool.poll_interval_ms);
        assert_eq!(back.batch.hack_fraction, config.batch.hack_fraction);
    }
}
