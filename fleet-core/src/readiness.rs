use fleet_domain::{
    FactoryState, MarketData, StorageOperationStatus, StorageOperationView, SupplyLevel, Task, TaskDependency, TaskId, TaskStatus, TaskType,
    TradeGoodSymbol, WaypointSymbol,
};
use std::collections::{HashMap, HashSet};

/// Everything readiness evaluation looks at, snapshotted so the decision is a
/// pure function. Built by the SupplyMonitor and by state recovery.
#[derive(Debug, Default)]
pub struct ReadinessSnapshot {
    pub task_statuses: HashMap<TaskId, TaskStatus>,
    pub dependencies: Vec<TaskDependency>,
    pub market: HashMap<(WaypointSymbol, TradeGoodSymbol), MarketData>,
    pub factory_states: Vec<FactoryState>,
    pub storage_operations: HashMap<String, StorageOperationView>,
    /// Ships currently held by ASSIGNED/EXECUTING tasks.
    pub held_ships: HashSet<fleet_domain::ShipSymbol>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Blocked(BlockedReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockedReason {
    DependenciesIncomplete,
    MarketDataMissing,
    SupplyTooLow,
    PriceAboveBudget,
    FactoryInputsMissing,
    StorageOperationUnavailable,
    ShipHeldElsewhere,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

pub fn evaluate(task: &Task, snapshot: &ReadinessSnapshot) -> Readiness {
    // 1. every dependency COMPLETED
    let deps_done = snapshot
        .dependencies
        .iter()
        .filter(|d| d.task_id == task.id)
        .all(|d| snapshot.task_statuses.get(&d.depends_on_id) == Some(&TaskStatus::Completed));
    if !deps_done {
        return Readiness::Blocked(BlockedReason::DependenciesIncomplete);
    }

    // 2. task-type-specific market precondition
    if let Readiness::Blocked(reason) = market_precondition(task, snapshot) {
        return Readiness::Blocked(reason);
    }

    // 3. the task's ship (if it already has one) must not be held elsewhere
    if let Some(ship) = &task.assigned_ship {
        if !task.status.holds_ship() && snapshot.held_ships.contains(ship) {
            return Readiness::Blocked(BlockedReason::ShipHeldElsewhere);
        }
    }

    Readiness::Ready
}

fn market_precondition(task: &Task, snapshot: &ReadinessSnapshot) -> Readiness {
    match task.task_type {
        TaskType::Collect | TaskType::CollectSell | TaskType::AcquireDeliver | TaskType::ConstructDeliver => {
            let Some(source) = &task.source_market else {
                // no purchase phase (e.g. a collect straight off a factory)
                return Readiness::Ready;
            };
            let Some(quote) = snapshot.market.get(&(source.clone(), task.good.clone())) else {
                return Readiness::Blocked(BlockedReason::MarketDataMissing);
            };
            if !quote.supply_at_least(SupplyLevel::Moderate) {
                return Readiness::Blocked(BlockedReason::SupplyTooLow);
            }
            if quote.purchase_price > task.budgeted_unit_price {
                return Readiness::Blocked(BlockedReason::PriceAboveBudget);
            }
            Readiness::Ready
        }
        TaskType::FabricateSell => {
            let Some(factory) = &task.factory else {
                return Readiness::Blocked(BlockedReason::FactoryInputsMissing);
            };
            let state = snapshot
                .factory_states
                .iter()
                .find(|s| s.factory == *factory && s.output_good == task.good && Some(s.pipeline_id) == task.pipeline_id);
            let all_delivered = state.map(|s| s.all_inputs_delivered).unwrap_or(false);
            if !all_delivered {
                return Readiness::Blocked(BlockedReason::FactoryInputsMissing);
            }
            let Some(quote) = snapshot.market.get(&(factory.clone(), task.good.clone())) else {
                return Readiness::Blocked(BlockedReason::MarketDataMissing);
            };
            if !quote.supply_at_least(SupplyLevel::High) {
                return Readiness::Blocked(BlockedReason::SupplyTooLow);
            }
            Readiness::Ready
        }
        TaskType::StorageAcquireDeliver => {
            let Some(op_id) = &task.storage_operation_id else {
                return Readiness::Blocked(BlockedReason::StorageOperationUnavailable);
            };
            let Some(op) = snapshot.storage_operations.get(op_id) else {
                return Readiness::Blocked(BlockedReason::StorageOperationUnavailable);
            };
            if op.status != StorageOperationStatus::Running {
                return Readiness::Blocked(BlockedReason::StorageOperationUnavailable);
            }
            if op.units_by_good.get(&task.good).copied().unwrap_or(0) == 0 {
                return Readiness::Blocked(BlockedReason::StorageOperationUnavailable);
            }
            Readiness::Ready
        }
        // liquidation and jettison have no market-observable precondition
        TaskType::Liquidate | TaskType::Jettison => Readiness::Ready,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_domain::test_fixtures::{market_quote, task, test_epoch};
    use fleet_domain::{PipelineId, PlayerId, ShipSymbol, TradeGoodType};

    fn snapshot_with_quote(quote: MarketData) -> ReadinessSnapshot {
        let mut snapshot = ReadinessSnapshot::default();
        snapshot
            .market
            .insert((quote.waypoint_symbol.clone(), quote.good_symbol.clone()), quote);
        snapshot
    }

    #[test]
    fn acquire_ready_when_supply_moderate_and_price_within_budget() {
        let mut t = task(TaskType::AcquireDeliver, "IRON", PlayerId(1));
        t.source_market = Some(WaypointSymbol("X1-AU21-A1".to_string()));
        t.budgeted_unit_price = 250;

        let snapshot = snapshot_with_quote(market_quote("X1-AU21-A1", "IRON", SupplyLevel::Moderate, TradeGoodType::Export, 200, 180));
        assert_eq!(evaluate(&t, &snapshot), Readiness::Ready);
    }

    #[test]
    fn acquire_blocked_on_scarce_supply_or_price() {
        let mut t = task(TaskType::AcquireDeliver, "IRON", PlayerId(1));
        t.source_market = Some(WaypointSymbol("X1-AU21-A1".to_string()));
        t.budgeted_unit_price = 250;

        let scarce = snapshot_with_quote(market_quote("X1-AU21-A1", "IRON", SupplyLevel::Scarce, TradeGoodType::Export, 200, 180));
        assert_eq!(evaluate(&t, &scarce), Readiness::Blocked(BlockedReason::SupplyTooLow));

        let pricey = snapshot_with_quote(market_quote("X1-AU21-A1", "IRON", SupplyLevel::High, TradeGoodType::Export, 400, 380));
        assert_eq!(evaluate(&t, &pricey), Readiness::Blocked(BlockedReason::PriceAboveBudget));
    }

    #[test]
    fn dependency_gates_before_market() {
        let mut upstream = task(TaskType::AcquireDeliver, "IRON", PlayerId(1));
        upstream.status = TaskStatus::Executing;
        let mut t = task(TaskType::FabricateSell, "FAB_MATS", PlayerId(1));
        t.factory = Some(WaypointSymbol("X1-AU21-F1".to_string()));

        let mut snapshot = ReadinessSnapshot::default();
        snapshot.task_statuses.insert(upstream.id, upstream.status);
        snapshot.dependencies.push(TaskDependency {
            task_id: t.id,
            depends_on_id: upstream.id,
        });
        assert_eq!(evaluate(&t, &snapshot), Readiness::Blocked(BlockedReason::DependenciesIncomplete));
    }

    #[test]
    fn fabricate_requires_inputs_delivered_and_high_supply() {
        let pipeline_id = PipelineId::generate();
        let mut t = task(TaskType::FabricateSell, "FAB_MATS", PlayerId(1));
        t.pipeline_id = Some(pipeline_id);
        t.factory = Some(WaypointSymbol("X1-AU21-F1".to_string()));

        let mut state = FactoryState::new(
            WaypointSymbol("X1-AU21-F1".to_string()),
            "FAB_MATS".into(),
            pipeline_id,
            PlayerId(1),
            HashMap::from([("IRON".into(), 40)]),
        );

        let mut snapshot = snapshot_with_quote(market_quote("X1-AU21-F1", "FAB_MATS", SupplyLevel::High, TradeGoodType::Export, 4000, 5000));
        snapshot.factory_states.push(state.clone());
        assert_eq!(evaluate(&t, &snapshot), Readiness::Blocked(BlockedReason::FactoryInputsMissing));

        state.record_delivery(&"IRON".into(), 40, test_epoch());
        let mut snapshot = snapshot_with_quote(market_quote("X1-AU21-F1", "FAB_MATS", SupplyLevel::Moderate, TradeGoodType::Export, 4000, 5000));
        snapshot.factory_states.push(state.clone());
        assert_eq!(evaluate(&t, &snapshot), Readiness::Blocked(BlockedReason::SupplyTooLow));

        let mut snapshot = snapshot_with_quote(market_quote("X1-AU21-F1", "FAB_MATS", SupplyLevel::High, TradeGoodType::Export, 4000, 5000));
        snapshot.factory_states.push(state);
        assert_eq!(evaluate(&t, &snapshot), Readiness::Ready);
    }

    #[test]
    fn storage_acquire_requires_running_operation_with_stock() {
        let mut t = task(TaskType::StorageAcquireDeliver, "FUEL", PlayerId(1));
        t.storage_operation_id = Some("op-1".to_string());

        let mut snapshot = ReadinessSnapshot::default();
        assert_eq!(evaluate(&t, &snapshot), Readiness::Blocked(BlockedReason::StorageOperationUnavailable));

        snapshot.storage_operations.insert(
            "op-1".to_string(),
            StorageOperationView {
                id: "op-1".to_string(),
                status: StorageOperationStatus::Running,
                units_by_good: HashMap::from([("FUEL".into(), 12)]),
            },
        );
        assert_eq!(evaluate(&t, &snapshot), Readiness::Ready);
    }

    #[test]
    fn ship_held_by_another_task_blocks() {
        let mut t = task(TaskType::Liquidate, "IRON", PlayerId(1));
        t.assigned_ship = Some(ShipSymbol("S-2".to_string()));

        let mut snapshot = ReadinessSnapshot::default();
        snapshot.held_ships.insert(ShipSymbol("S-2".to_string()));
        assert_eq!(evaluate(&t, &snapshot), Readiness::Blocked(BlockedReason::ShipHeldElsewhere));

        snapshot.held_ships.clear();
        assert_eq!(evaluate(&t, &snapshot), Readiness::Ready);
    }
}
