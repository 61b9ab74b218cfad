use crate::{PlayerId, ShipSymbol, SystemSymbol, WaypointSymbol};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn generate(prefix: &str) -> Self {
        ContainerId(format!("{}-{}", prefix, Uuid::new_v4()))
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Deserialize, Serialize, Debug, Copy, Clone, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerType {
    ManufacturingCoordinator,
    MiningCoordinator,
    ContractWorkflow,
    GasCoordinator,
    ManufacturingTaskWorker,
    MiningTransportWorker,
    ContractWorker,
}

impl ContainerType {
    pub fn is_coordinator(&self) -> bool {
        matches!(
            self,
            ContainerType::ManufacturingCoordinator
                | ContainerType::MiningCoordinator
                | ContainerType::ContractWorkflow
                | ContainerType::GasCoordinator
        )
    }

    pub fn is_worker(&self) -> bool {
        !self.is_coordinator()
    }
}

#[derive(Deserialize, Serialize, Debug, Copy, Clone, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerStatus {
    Pending,
    Running,
    Stopped,
}

impl ContainerStatus {
    /// PENDING -> RUNNING -> STOPPED, no resurrection.
    pub fn can_transition_to(&self, next: ContainerStatus) -> bool {
        matches!(
            (self, next),
            (ContainerStatus::Pending, ContainerStatus::Running)
                | (ContainerStatus::Pending, ContainerStatus::Stopped)
                | (ContainerStatus::Running, ContainerStatus::Stopped)
        )
    }
}

#[derive(Deserialize, Serialize, Debug, Copy, Clone, PartialEq, Eq, Hash, strum::Display, strum::EnumString, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RestartPolicy {
    #[default]
    None,
    OnFailure,
}

pub mod exit_reason {
    pub const STOPPED: &str = "stopped";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const ORPHANED_BY_COORDINATOR_RESTART: &str = "orphaned_by_coordinator_restart";
    pub const RESTART_BUDGET_EXHAUSTED: &str = "restart_budget_exhausted";
}

pub mod release_reason {
    pub const COORDINATOR_STOPPED: &str = "coordinator_stopped";
    pub const WORKER_ORPHANED: &str = "orphaned_by_coordinator_restart";
    pub const PIPELINE_RECYCLED: &str = "pipeline_recycled";
    pub const TASK_COMPLETED: &str = "task_completed";
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, strum::Display, strum::EnumString, Default)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum AcquisitionStrategy {
    PreferBuy,
    PreferFabricate,
    #[default]
    Smart,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManufacturingCoordinatorConfig {
    pub system_symbol: SystemSymbol,
    pub min_purchase_price: i64,
    pub max_concurrent_tasks: usize,
    pub max_active_fabrication_pipelines: usize,
    pub max_active_collection_pipelines: usize,
    #[serde(default)]
    pub acquisition_strategy: AcquisitionStrategy,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MiningCoordinatorConfig {
    pub system_symbol: SystemSymbol,
    pub mining_site: WaypointSymbol,
    pub sell_market: WaypointSymbol,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContractWorkflowConfig {
    pub system_symbol: SystemSymbol,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GasCoordinatorConfig {
    pub system_symbol: SystemSymbol,
    pub gas_giant: WaypointSymbol,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskWorkerConfig {
    pub task_id: crate::TaskId,
    pub ship_symbol: ShipSymbol,
    pub pipeline_id: Option<crate::PipelineId>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MiningTransportConfig {
    pub ship_symbol: ShipSymbol,
    pub mining_site: WaypointSymbol,
    pub sell_market: WaypointSymbol,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContractWorkerConfig {
    pub ship_symbol: ShipSymbol,
    pub contract_id: String,
    pub good: crate::TradeGoodSymbol,
    pub units: i32,
    pub source_market: Option<WaypointSymbol>,
    pub destination: WaypointSymbol,
}

/// Typed command payload persisted as the container's JSON config blob.
/// Schemas evolve by additive fields only; `#[serde(default)]` on new fields.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContainerConfig {
    ManufacturingCoordinator(ManufacturingCoordinatorConfig),
    MiningCoordinator(MiningCoordinatorConfig),
    ContractWorkflow(ContractWorkflowConfig),
    GasCoordinator(GasCoordinatorConfig),
    TaskWorker(TaskWorkerConfig),
    MiningTransport(MiningTransportConfig),
    ContractWorker(ContractWorkerConfig),
}

impl ContainerConfig {
    pub fn container_type(&self) -> ContainerType {
        match self {
            ContainerConfig::ManufacturingCoordinator(_) => ContainerType::ManufacturingCoordinator,
            ContainerConfig::MiningCoordinator(_) => ContainerType::MiningCoordinator,
            ContainerConfig::ContractWorkflow(_) => ContainerType::ContractWorkflow,
            ContainerConfig::GasCoordinator(_) => ContainerType::GasCoordinator,
            ContainerConfig::TaskWorker(_) => ContainerType::ManufacturingTaskWorker,
            ContainerConfig::MiningTransport(_) => ContainerType::MiningTransportWorker,
            ContainerConfig::ContractWorker(_) => ContainerType::ContractWorker,
        }
    }

    /// Scope fragment used by the per-scope singleton guards: two coordinators
    /// with the same fragment would drive the same slice of the world.
    pub fn scope_fragment(&self) -> Option<String> {
        match self {
            ContainerConfig::ManufacturingCoordinator(cfg) => Some(cfg.system_symbol.0.clone()),
            ContainerConfig::MiningCoordinator(cfg) => Some(cfg.mining_site.0.clone()),
            ContainerConfig::ContractWorkflow(cfg) => Some(cfg.system_symbol.0.clone()),
            ContainerConfig::GasCoordinator(cfg) => Some(cfg.gas_giant.0.clone()),
            _ => None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Container {
    pub id: ContainerId,
    pub player_id: PlayerId,
    pub container_type: ContainerType,
    pub command_label: String,
    pub status: ContainerStatus,
    pub parent_id: Option<ContainerId>,
    pub restart_policy: RestartPolicy,
    pub restart_count: i32,
    pub config: ContainerConfig,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub exit_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerExit {
    pub exit_code: i32,
    pub exit_reason: String,
}

impl ContainerExit {
    pub fn success(reason: &str) -> Self {
        Self {
            exit_code: 0,
            exit_reason: reason.to_string(),
        }
    }

    pub fn failure(reason: &str) -> Self {
        Self {
            exit_code: 1,
            exit_reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_monotone() {
        assert!(ContainerStatus::Pending.can_transition_to(ContainerStatus::Running));
        assert!(ContainerStatus::Running.can_transition_to(ContainerStatus::Stopped));
        assert!(!ContainerStatus::Stopped.can_transition_to(ContainerStatus::Running));
        assert!(!ContainerStatus::Stopped.can_transition_to(ContainerStatus::Pending));
        assert!(!ContainerStatus::Running.can_transition_to(ContainerStatus::Pending));
    }

    #[test]
    fn config_round_trips_as_tagged_json() {
        let cfg = ContainerConfig::GasCoordinator(GasCoordinatorConfig {
            system_symbol: SystemSymbol("X1-AU21".to_string()),
            gas_giant: WaypointSymbol("X1-AU21-G1".to_string()),
        });
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"kind\":\"gas_coordinator\""));
        let parsed: ContainerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, cfg);
        assert_eq!(parsed.container_type(), ContainerType::GasCoordinator);
        assert_eq!(parsed.scope_fragment().as_deref(), Some("X1-AU21-G1"));
    }
}
