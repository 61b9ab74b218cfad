use crate::manufacturing::{CoordinatorServices, CoordinatorState};
use anyhow::Result;
use fleet_domain::{Task, TaskId, TaskStatus, TaskType, TradeGoodSymbol};
use fleet_store::Ctx;
use metrics::counter;
use std::sync::Arc;
use tracing::{event, Level};

/// Priority band for ad-hoc cleanup tasks; they jump ahead of any planned
/// pipeline work.
const AD_HOC_PRIORITY: i32 = 100;

/// Finds cargo sitting on coordinator-owned ships that no live task accounts
/// for, and turns it into one-shot LIQUIDATE (a market buys it) or JETTISON
/// (nothing does) tasks.
pub struct OrphanedCargoHandler {
    services: Arc<CoordinatorServices>,
}

impl OrphanedCargoHandler {
    pub fn new(services: Arc<CoordinatorServices>) -> Self {
        Self { services }
    }

    pub async fn sweep(&self, ctx: &Ctx, state: &mut CoordinatorState) -> Result<Vec<TaskId>> {
        let assignments = self
            .services
            .bmc
            .ship_assignment_bmc()
            .find_by_container(ctx, &state.coordinator_id)
            .await?;
        let open_tasks = self.services.bmc.task_bmc().list_non_terminal(ctx).await?;

        let mut created = Vec::new();
        for assignment in assignments {
            let ship = match self.services.api.get_ship(&assignment.ship_symbol).await {
                Ok(ship) => ship,
                Err(err) => {
                    event!(Level::WARN, ship = %assignment.ship_symbol, error = %err, "ship lookup failed during cargo sweep");
                    continue;
                }
            };
            if ship.cargo.is_empty() {
                continue;
            }

            for item in &ship.cargo.inventory {
                let accounted = open_tasks.iter().any(|t| t.good == item.symbol);
                if accounted {
                    continue;
                }
                let task_id = self.create_cleanup_task(ctx, state, &item.symbol, item.units).await?;
                created.push(task_id);
            }
        }
        if !created.is_empty() {
            counter!("fleet_orphaned_cargo_tasks_total").increment(created.len() as u64);
        }
        Ok(created)
    }

    async fn create_cleanup_task(&self, ctx: &Ctx, state: &mut CoordinatorState, good: &TradeGoodSymbol, units: i32) -> Result<TaskId> {
        let markets = self.services.bmc.market_bmc().list_for_good(ctx, good).await?;
        let best_buyer = markets.iter().filter(|m| m.accepts()).max_by_key(|m| m.sell_price);

        let now = self.services.clock.now();
        let (task_type, target_market) = match best_buyer {
            Some(market) => (TaskType::Liquidate, Some(market.waypoint_symbol.clone())),
            None => (TaskType::Jettison, None),
        };
        event!(Level::INFO, good = %good, units, ?task_type, "creating cleanup task for orphaned cargo");

        let task = Task {
            id: TaskId::generate(),
            pipeline_id: None,
            player_id: ctx.player_id(),
            task_type,
            status: TaskStatus::Ready,
            good: good.clone(),
            target_units: units,
            actual_units: 0,
            source_market: None,
            target_market,
            factory: None,
            storage_operation_id: None,
            assigned_ship: None,
            priority: AD_HOC_PRIORITY,
            retry_count: 0,
            max_retries: 3,
            budgeted_unit_price: 0,
            total_cost: 0,
            total_revenue: 0,
            error_message: None,
            collect_phase_completed: false,
            acquire_phase_completed: false,
            created_at: now,
            updated_at: now,
        };
        self.services.bmc.task_bmc().insert_tasks_with_dependencies(ctx, &[task.clone()], &[]).await?;
        state.queue.push(&task);
        Ok(task.id)
    }
}
