use serde::Deserialize;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Installs the process-wide tracing subscriber; call once from the embedding
/// binary before anything else logs.
pub fn install_tracing() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
}

fn default_opportunity_scan_secs() -> u64 {
    180
}

fn default_stuck_check_secs() -> u64 {
    300
}

fn default_idle_assign_secs() -> u64 {
    10
}

fn default_completion_sweep_secs() -> u64 {
    30
}

fn default_supply_poll_secs() -> u64 {
    60
}

fn default_stuck_threshold_secs() -> u64 {
    900
}

fn default_dedup_window_secs() -> u64 {
    60
}

fn default_dedup_cache_cap() -> usize {
    10_000
}

fn default_max_concurrent_tasks() -> usize {
    5
}

fn default_max_fabrication_pipelines() -> usize {
    2
}

fn default_max_collection_pipelines() -> usize {
    0
}

fn default_min_purchase_price() -> i64 {
    1_000
}

fn default_worker_restart_cap() -> i32 {
    3
}

/// Engine configuration, loaded from `FLEET_*` environment variables.
#[derive(Deserialize, Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub player_id: i64,
    pub system_symbol: String,

    #[serde(default = "default_opportunity_scan_secs")]
    pub opportunity_scan_secs: u64,
    #[serde(default = "default_stuck_check_secs")]
    pub stuck_check_secs: u64,
    #[serde(default = "default_idle_assign_secs")]
    pub idle_assign_secs: u64,
    #[serde(default = "default_completion_sweep_secs")]
    pub completion_sweep_secs: u64,
    #[serde(default = "default_supply_poll_secs")]
    pub supply_poll_secs: u64,
    /// Pipelines whose tasks sit READY-but-unassignable longer than this are
    /// recycled. Not a first-class game constant; tune per deployment.
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_dedup_cache_cap")]
    pub dedup_cache_cap: usize,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_max_fabrication_pipelines")]
    pub max_fabrication_pipelines: usize,
    /// 0 means unlimited here, unlike the fabrication cap where 0 disables.
    #[serde(default = "default_max_collection_pipelines")]
    pub max_collection_pipelines: usize,
    #[serde(default = "default_min_purchase_price")]
    pub min_purchase_price: i64,
    #[serde(default = "default_worker_restart_cap")]
    pub worker_restart_cap: i32,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("FLEET_").from_env()
    }

    pub fn timing(&self) -> CoordinatorTiming {
        CoordinatorTiming {
            opportunity_scan: Duration::from_secs(self.opportunity_scan_secs),
            stuck_check: Duration::from_secs(self.stuck_check_secs),
            idle_assign: Duration::from_secs(self.idle_assign_secs),
            completion_sweep: Duration::from_secs(self.completion_sweep_secs),
            supply_poll: Duration::from_secs(self.supply_poll_secs),
            stuck_threshold: chrono::Duration::seconds(self.stuck_threshold_secs as i64),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorTiming {
    pub opportunity_scan: Duration,
    pub stuck_check: Duration,
    pub idle_assign: Duration,
    pub completion_sweep: Duration,
    pub supply_poll: Duration,
    pub stuck_threshold: chrono::Duration,
}

impl Default for CoordinatorTiming {
    fn default() -> Self {
        Self {
            opportunity_scan: Duration::from_secs(default_opportunity_scan_secs()),
            stuck_check: Duration::from_secs(default_stuck_check_secs()),
            idle_assign: Duration::from_secs(default_idle_assign_secs()),
            completion_sweep: Duration::from_secs(default_completion_sweep_secs()),
            supply_poll: Duration::from_secs(default_supply_poll_secs()),
            stuck_threshold: chrono::Duration::seconds(default_stuck_threshold_secs() as i64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_env_gets_the_documented_defaults() {
        let cfg: EngineConfig = envy::prefixed("FLEET_")
            .from_iter(vec![
                ("FLEET_DATABASE_URL".to_string(), "postgres://localhost/fleet".to_string()),
                ("FLEET_PLAYER_ID".to_string(), "1".to_string()),
                ("FLEET_SYSTEM_SYMBOL".to_string(), "X1-AU21".to_string()),
            ])
            .unwrap();

        assert_eq!(cfg.opportunity_scan_secs, 180);
        assert_eq!(cfg.stuck_check_secs, 300);
        assert_eq!(cfg.idle_assign_secs, 10);
        assert_eq!(cfg.completion_sweep_secs, 30);
        assert_eq!(cfg.dedup_window_secs, 60);
        assert_eq!(cfg.dedup_cache_cap, 10_000);
        assert_eq!(cfg.max_collection_pipelines, 0, "0 keeps collection unlimited");

        let timing = cfg.timing();
        assert_eq!(timing.idle_assign, Duration::from_secs(10));
        assert_eq!(timing.stuck_threshold, chrono::Duration::seconds(900));
    }

    #[test]
    fn overrides_win_over_defaults() {
        let cfg: EngineConfig = envy::prefixed("FLEET_")
            .from_iter(vec![
                ("FLEET_DATABASE_URL".to_string(), "postgres://localhost/fleet".to_string()),
                ("FLEET_PLAYER_ID".to_string(), "1".to_string()),
                ("FLEET_SYSTEM_SYMBOL".to_string(), "X1-AU21".to_string()),
                ("FLEET_STUCK_THRESHOLD_SECS".to_string(), "120".to_string()),
                ("FLEET_MAX_CONCURRENT_TASKS".to_string(), "9".to_string()),
            ])
            .unwrap();
        assert_eq!(cfg.max_concurrent_tasks, 9);
        assert_eq!(cfg.timing().stuck_threshold, chrono::Duration::seconds(120));
    }
}
