use crate::factory_tracker::FactoryStateTracker;
use crate::manufacturing::{build_readiness_snapshot, CoordinatorServices, CoordinatorState};
use crate::readiness::{evaluate, Readiness};
use crate::task_queue::TaskQueue;
use anyhow::Result;
use fleet_domain::{ContainerId, SystemSymbol, TaskStatus};
use fleet_store::Ctx;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{event, Level};

/// Rebuilds the coordinator's in-memory indices from persistent state.
/// Running it twice in a row yields the same state; every step is a pure
/// load-and-index or an idempotent status write.
pub struct StateRecoveryManager {
    services: Arc<CoordinatorServices>,
}

impl StateRecoveryManager {
    pub fn new(services: Arc<CoordinatorServices>) -> Self {
        Self { services }
    }

    pub async fn recover(&self, ctx: &Ctx, coordinator_id: ContainerId, system_symbol: SystemSymbol) -> Result<CoordinatorState> {
        let waypoints = self
            .services
            .api
            .list_waypoints(&system_symbol)
            .await
            .map_err(anyhow::Error::from)?
            .into_iter()
            .map(|wp| (wp.symbol.clone(), wp))
            .collect();

        let storage_operations = self
            .services
            .storage
            .list_operations(ctx)
            .await?
            .into_iter()
            .map(|op| (op.id.clone(), op))
            .collect::<HashMap<_, _>>();

        // 1. active-pipeline index
        let active_pipelines = self
            .services
            .bmc
            .pipeline_bmc()
            .list_non_terminal(ctx)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect::<HashMap<_, _>>();

        // 3. factory tracker from its rows
        let mut factory_tracker = FactoryStateTracker::new(self.services.bmc.factory_state_bmc(), Arc::clone(&self.services.clock));
        factory_tracker.rebuild(ctx).await?;

        let mut state = CoordinatorState {
            coordinator_id,
            system_symbol,
            queue: TaskQueue::new(),
            active_pipelines,
            assigned: HashMap::new(),
            waypoints,
            storage_operations,
            factory_tracker,
        };

        // 2. non-terminal tasks: persisted READY is not trusted, the world
        // has moved while we were down. Former ASSIGNED/EXECUTING tasks lost
        // their workers to the supervisor sweep; they drop to READY keeping
        // their ship affinity and are re-dispatched by the first assignment
        // pass.
        let now = self.services.clock.now();
        let task_bmc = self.services.bmc.task_bmc();
        for task in task_bmc.list_non_terminal(ctx).await? {
            if task.status.holds_ship() {
                event!(Level::INFO, task = %task.id, "demoting in-flight task after restart");
                task_bmc.update_status(ctx, &task.id, TaskStatus::Ready, now).await?;
            }
        }

        let snapshot = build_readiness_snapshot(&self.services, ctx, &state).await?;
        for task in task_bmc.list_non_terminal(ctx).await? {
            let verdict = evaluate(&task, &snapshot);
            let target = match (task.status, &verdict) {
                (TaskStatus::Pending, Readiness::Ready) => Some(TaskStatus::Ready),
                (TaskStatus::Ready, Readiness::Blocked(_)) => Some(TaskStatus::Pending),
                _ => None,
            };
            if let Some(target) = target {
                task_bmc.update_status(ctx, &task.id, target, now).await?;
            }
        }

        // queue over the final READY set
        let ready = task_bmc.list_by_status(ctx, TaskStatus::Ready).await?;
        state.queue.rebuild(&ready);

        event!(
            Level::INFO,
            pipelines = state.active_pipelines.len(),
            ready_tasks = state.queue.len(),
            factories = state.factory_tracker.states().len(),
            "coordinator state recovered"
        );
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::MockApiClientTrait;
    use crate::dedup_log::DedupLogSink;
    use crate::routing::MockRoutingClientTrait;
    use crate::storage_ops::NoStorageOperations;
    use crate::supervisor::{ContainerControl, ContainerSupervisor};
    use fleet_domain::test_fixtures::{market_quote, task, test_epoch};
    use fleet_domain::{Clock, ManualClock, PlayerId, ShipSymbol, SupplyLevel, TaskType, TradeGoodType, WaypointSymbol};
    use fleet_store::{Bmc, InMemoryBmc};
    use test_log::test;

    fn services(bmc: Arc<InMemoryBmc>, api: MockApiClientTrait) -> Arc<CoordinatorServices> {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_at(test_epoch()));
        let supervisor = ContainerSupervisor::new(Arc::clone(&bmc) as Arc<dyn Bmc>, Arc::clone(&clock), 3);
        let log = Arc::new(DedupLogSink::new(
            bmc.container_log_bmc(),
            Arc::clone(&clock),
            chrono::Duration::seconds(60),
            10_000,
        ));
        Arc::new(CoordinatorServices {
            bmc: Arc::clone(&bmc) as Arc<dyn Bmc>,
            api: Arc::new(api),
            routing: Arc::new(MockRoutingClientTrait::new()),
            control: supervisor as Arc<dyn ContainerControl>,
            storage: Arc::new(NoStorageOperations),
            clock,
            log,
        })
    }

    fn ctx() -> Ctx {
        Ctx::for_player(PlayerId(1))
    }

    #[test(tokio::test)]
    async fn recovery_is_idempotent_and_does_not_trust_persisted_ready() -> Result<()> {
        let bmc = Arc::new(InMemoryBmc::new());
        let ctx = ctx();

        // a READY task whose market has gone scarce, and an EXECUTING task
        // whose worker died with the coordinator
        let mut stale_ready = task(TaskType::CollectSell, "IRON", PlayerId(1));
        stale_ready.status = TaskStatus::Ready;
        stale_ready.source_market = Some(WaypointSymbol("X1-AU21-A1".to_string()));
        stale_ready.budgeted_unit_price = 250;

        let mut orphaned_executing = task(TaskType::Liquidate, "COPPER", PlayerId(1));
        orphaned_executing.status = TaskStatus::Executing;
        orphaned_executing.assigned_ship = Some(ShipSymbol("SHIP-2".to_string()));

        bmc.task_bmc()
            .insert_tasks_with_dependencies(&ctx, &[stale_ready.clone(), orphaned_executing.clone()], &[])
            .await?;
        bmc.market_bmc()
            .upsert_quotes(&ctx, &[market_quote("X1-AU21-A1", "IRON", SupplyLevel::Scarce, TradeGoodType::Export, 200, 180)])
            .await?;

        let mut api = MockApiClientTrait::new();
        api.expect_list_waypoints().returning(|_| Ok(vec![]));

        let recovery = StateRecoveryManager::new(services(Arc::clone(&bmc), api));
        let state = recovery
            .recover(&ctx, ContainerId("coordinator".to_string()), SystemSymbol("X1-AU21".to_string()))
            .await?;

        let stale = bmc.task_bmc().get_task(&ctx, &stale_ready.id).await?.unwrap();
        assert_eq!(stale.status, TaskStatus::Pending, "scarce market demotes READY");

        let orphan = bmc.task_bmc().get_task(&ctx, &orphaned_executing.id).await?.unwrap();
        assert_eq!(orphan.status, TaskStatus::Ready, "orphaned EXECUTING drops to READY");
        assert_eq!(orphan.assigned_ship, Some(ShipSymbol("SHIP-2".to_string())), "ship affinity preserved");
        assert!(state.queue.contains(&orphan));
        assert_eq!(state.queue.len(), 1);

        // property: running recovery again produces identical state
        let mut api = MockApiClientTrait::new();
        api.expect_list_waypoints().returning(|_| Ok(vec![]));
        let recovery = StateRecoveryManager::new(services(Arc::clone(&bmc), api));
        let second = recovery
            .recover(&ctx, ContainerId("coordinator".to_string()), SystemSymbol("X1-AU21".to_string()))
            .await?;
        assert_eq!(second.queue.ordered_ids(), state.queue.ordered_ids());
        assert_eq!(second.active_pipelines.len(), state.active_pipelines.len());
        assert!(second.assigned.is_empty());
        Ok(())
    }
}
