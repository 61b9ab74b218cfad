use crate::{PlayerId, ShipSymbol, SupplyLevel, TradeGoodSymbol, WaypointSymbol};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Deserialize, Serialize, Debug, Copy, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct PipelineId(pub Uuid);

impl PipelineId {
    pub fn generate() -> Self {
        PipelineId(Uuid::new_v4())
    }
}

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Deserialize, Serialize, Debug, Copy, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn generate() -> Self {
        TaskId(Uuid::new_v4())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Deserialize, Serialize, Debug, Copy, Clone, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineType {
    Fabrication,
    Collection,
    Construction,
}

#[derive(Deserialize, Serialize, Debug, Copy, Clone, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    Planning,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Completed | PipelineStatus::Failed | PipelineStatus::Cancelled
        )
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub id: PipelineId,
    pub player_id: PlayerId,
    pub sequence_number: i64,
    pub pipeline_type: PipelineType,
    pub product_good: TradeGoodSymbol,
    pub sell_market: WaypointSymbol,
    pub expected_unit_price: i64,
    pub status: PipelineStatus,
    pub total_cost: i64,
    pub total_revenue: i64,
    pub net_profit: i64,
    pub supply_chain_depth: i32,
    pub max_concurrent_workers: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Pipeline {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Deserialize, Serialize, Debug, Copy, Clone, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Collect,
    CollectSell,
    AcquireDeliver,
    StorageAcquireDeliver,
    Liquidate,
    Jettison,
    FabricateSell,
    ConstructDeliver,
}

#[derive(Deserialize, Serialize, Debug, Copy, Clone, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Ready,
    Assigned,
    Executing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// A ship is held while its task is ASSIGNED or EXECUTING.
    pub fn holds_ship(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Executing)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub pipeline_id: Option<PipelineId>,
    pub player_id: PlayerId,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub good: TradeGoodSymbol,
    pub target_units: i32,
    pub actual_units: i32,
    pub source_market: Option<WaypointSymbol>,
    pub target_market: Option<WaypointSymbol>,
    pub factory: Option<WaypointSymbol>,
    pub storage_operation_id: Option<String>,
    pub assigned_ship: Option<ShipSymbol>,
    pub priority: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    pub budgeted_unit_price: i64,
    pub total_cost: i64,
    pub total_revenue: i64,
    pub error_message: Option<String>,
    pub collect_phase_completed: bool,
    pub acquire_phase_completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// The waypoint a worker has to reach first to make progress on the task.
    pub fn required_waypoint(&self) -> Option<&WaypointSymbol> {
        match self.task_type {
            TaskType::Collect | TaskType::CollectSell | TaskType::AcquireDeliver => self.source_market.as_ref(),
            TaskType::StorageAcquireDeliver => self.factory.as_ref().or(self.target_market.as_ref()),
            TaskType::FabricateSell => self.factory.as_ref(),
            TaskType::Liquidate | TaskType::Jettison => self.target_market.as_ref(),
            TaskType::ConstructDeliver => self.target_market.as_ref(),
        }
    }

    /// Ad-hoc tasks (no pipeline) jump the queue ahead of pipeline work.
    pub fn is_ad_hoc(&self) -> bool {
        self.pipeline_id.is_none()
    }
}

/// Edge of the task DAG: `task_id` waits for `depends_on_id`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskDependency {
    pub task_id: TaskId,
    pub depends_on_id: TaskId,
}

#[derive(Deserialize, Serialize, Debug, Copy, Clone, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageOperationStatus {
    Running,
    Stopped,
}

/// Read-model of an external storage operation; only what readiness needs.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct StorageOperationView {
    pub id: String,
    pub status: StorageOperationStatus,
    pub units_by_good: HashMap<TradeGoodSymbol, i32>,
}

/// Tracks one factory's input deliveries and the supply edge that signals the
/// produced good is ready for collection.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct FactoryState {
    pub factory: WaypointSymbol,
    pub output_good: TradeGoodSymbol,
    pub pipeline_id: PipelineId,
    pub player_id: PlayerId,
    pub required_inputs: HashMap<TradeGoodSymbol, i32>,
    pub delivered_inputs: HashMap<TradeGoodSymbol, i32>,
    pub all_inputs_delivered: bool,
    pub current_supply: Option<SupplyLevel>,
    pub previous_supply: Option<SupplyLevel>,
    pub ready_for_collection: bool,
    pub inputs_completed_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
}

impl FactoryState {
    pub fn new(
        factory: WaypointSymbol,
        output_good: TradeGoodSymbol,
        pipeline_id: PipelineId,
        player_id: PlayerId,
        required_inputs: HashMap<TradeGoodSymbol, i32>,
    ) -> Self {
        Self {
            factory,
            output_good,
            pipeline_id,
            player_id,
            required_inputs,
            delivered_inputs: HashMap::new(),
            all_inputs_delivered: false,
            current_supply: None,
            previous_supply: None,
            ready_for_collection: false,
            inputs_completed_at: None,
            ready_at: None,
        }
    }

    pub fn record_delivery(&mut self, good: &TradeGoodSymbol, units: i32, now: DateTime<Utc>) {
        *self.delivered_inputs.entry(good.clone()).or_insert(0) += units;
        let satisfied = self
            .required_inputs
            .iter()
            .all(|(g, required)| self.delivered_inputs.get(g).copied().unwrap_or(0) >= *required);
        if satisfied && !self.all_inputs_delivered {
            self.all_inputs_delivered = true;
            self.inputs_completed_at = Some(now);
        }
    }

    /// Edge-detecting readiness: the factory has consumed its inputs once the
    /// output supply rises to HIGH or better after all inputs were delivered.
    pub fn observe_supply(&mut self, supply: SupplyLevel, now: DateTime<Utc>) {
        self.previous_supply = self.current_supply;
        self.current_supply = Some(supply);
        if self.all_inputs_delivered && !self.ready_for_collection && supply >= SupplyLevel::High {
            let rising = self.previous_supply.map(|prev| supply > prev).unwrap_or(true);
            if rising || self.previous_supply.is_none() {
                self.ready_for_collection = true;
                self.ready_at = Some(now);
            }
        }
    }
}
