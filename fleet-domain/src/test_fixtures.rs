//! Builders for scenario tests. Only compiled with the `test-utils` feature.

use crate::{
    Cargo, CargoItem, MarketData, PlayerId, Pipeline, PipelineId, PipelineStatus, PipelineType, ShipNavStatus, ShipRole, ShipSnapshot, ShipSymbol,
    SupplyLevel, Task, TaskId, TaskStatus, TaskType, TradeGoodSymbol, TradeGoodType, WaypointSymbol,
};
use chrono::{DateTime, TimeZone, Utc};

pub fn test_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

pub fn hauler(symbol: &str, waypoint: &str, x: i64, y: i64) -> ShipSnapshot {
    ShipSnapshot {
        symbol: ShipSymbol(symbol.to_string()),
        role: ShipRole::Hauler,
        nav_status: ShipNavStatus::InOrbit,
        waypoint_symbol: WaypointSymbol(waypoint.to_string()),
        x,
        y,
        cargo: Cargo::empty(60),
        fuel_current: 400,
        fuel_capacity: 400,
        engine_speed: 30,
    }
}

pub fn hauler_with_cargo(symbol: &str, waypoint: &str, good: &str, units: i32) -> ShipSnapshot {
    let mut ship = hauler(symbol, waypoint, 0, 0);
    ship.cargo = Cargo {
        capacity: 60,
        units,
        inventory: vec![CargoItem {
            symbol: TradeGoodSymbol(good.to_string()),
            units,
        }],
    };
    ship
}

pub fn market_quote(waypoint: &str, good: &str, supply: SupplyLevel, trade_type: TradeGoodType, purchase: i64, sell: i64) -> MarketData {
    MarketData {
        waypoint_symbol: WaypointSymbol(waypoint.to_string()),
        good_symbol: TradeGoodSymbol(good.to_string()),
        supply: Some(supply),
        activity: None,
        trade_type: Some(trade_type),
        purchase_price: purchase,
        sell_price: sell,
        trade_volume: 60,
        last_updated: test_epoch(),
        player_id: PlayerId(1),
    }
}

pub fn task(task_type: TaskType, good: &str, player: PlayerId) -> Task {
    Task {
        id: TaskId::generate(),
        pipeline_id: None,
        player_id: player,
        task_type,
        status: TaskStatus::Pending,
        good: TradeGoodSymbol(good.to_string()),
        target_units: 40,
        actual_units: 0,
        source_market: None,
        target_market: None,
        factory: None,
        storage_operation_id: None,
        assigned_ship: None,
        priority: 0,
        retry_count: 0,
        max_retries: 3,
        budgeted_unit_price: 500,
        total_cost: 0,
        total_revenue: 0,
        error_message: None,
        collect_phase_completed: false,
        acquire_phase_completed: false,
        created_at: test_epoch(),
        updated_at: test_epoch(),
    }
}

pub fn pipeline(player: PlayerId, product: &str, sequence_number: i64) -> Pipeline {
    Pipeline {
        id: PipelineId::generate(),
        player_id: player,
        sequence_number,
        pipeline_type: PipelineType::Fabrication,
        product_good: TradeGoodSymbol(product.to_string()),
        sell_market: WaypointSymbol("X1-AU21-S1".to_string()),
        expected_unit_price: 5000,
        status: PipelineStatus::Planning,
        total_cost: 0,
        total_revenue: 0,
        net_profit: 0,
        supply_chain_depth: 1,
        max_concurrent_workers: 3,
        error_message: None,
        created_at: test_epoch(),
        updated_at: test_epoch(),
        completed_at: None,
    }
}
