#[cfg(test)]
mod tests {
    use crate::api_client::MockApiClientTrait;
    use crate::dedup_log::DedupLogSink;
    use crate::manufacturing::assignment::TaskAssignmentManager;
    use crate::manufacturing::pipelines::PipelineLifecycleManager;
    use crate::manufacturing::recovery::StateRecoveryManager;
    use crate::manufacturing::worker::{ManufacturingTaskWorker, MockTaskCommandRunner, TaskOutcome};
    use crate::manufacturing::workers::WorkerLifecycleManager;
    use crate::manufacturing::CoordinatorServices;
    use crate::routing::MockRoutingClientTrait;
    use crate::storage_ops::NoStorageOperations;
    use crate::supervisor::{ContainerControl, ContainerSupervisor, WorkerCompletion};
    use crate::supply_monitor::SupplyMonitor;
    use anyhow::Result;
    use fleet_domain::test_fixtures::{hauler, market_quote, test_epoch};
    use fleet_domain::{
        AcquisitionStrategy, Clock, ContainerId, ContainerType, ManualClock, ManufacturingCoordinatorConfig, PipelineStatus, PlayerId, ShipSymbol,
        SupplyChain, SupplyLevel, SystemSymbol, TaskStatus, TaskType, TradeGoodType, TradeRelation, Waypoint, WaypointSymbol,
    };
    use fleet_store::{Bmc, Ctx, InMemoryBmc};
    use std::sync::Arc;
    use std::time::Duration;
    use test_log::test;
    use tokio::sync::mpsc;

    fn ctx() -> Ctx {
        Ctx::for_player(PlayerId(1))
    }

    fn coordinator_cfg() -> ManufacturingCoordinatorConfig {
        ManufacturingCoordinatorConfig {
            system_symbol: SystemSymbol("X1-AU21".to_string()),
            min_purchase_price: 1000,
            max_concurrent_tasks: 3,
            max_active_fabrication_pipelines: 1,
            max_active_collection_pipelines: 1,
            acquisition_strategy: AcquisitionStrategy::Smart,
        }
    }

    /// The S1 world: a factory exporting FAB_MATS from IRON and COPPER, one
    /// idle hauler parked at the IRON market.
    fn scenario_api() -> MockApiClientTrait {
        let mut api = MockApiClientTrait::new();
        api.expect_get_supply_chain().returning(|| {
            Ok(SupplyChain {
                relations: vec![TradeRelation {
                    export: "FAB_MATS".into(),
                    imports: vec!["IRON".into(), "COPPER".into()],
                }],
            })
        });
        api.expect_list_waypoints().returning(|_| {
            Ok(vec![
                Waypoint {
                    symbol: WaypointSymbol("X1-AU21-A1".to_string()),
                    x: 0,
                    y: 0,
                },
                Waypoint {
                    symbol: WaypointSymbol("X1-AU21-B1".to_string()),
                    x: 10,
                    y: 0,
                },
                Waypoint {
                    symbol: WaypointSymbol("X1-AU21-F1".to_string()),
                    x: 20,
                    y: 0,
                },
                Waypoint {
                    symbol: WaypointSymbol("X1-AU21-S1".to_string()),
                    x: 30,
                    y: 0,
                },
            ])
        });
        api.expect_get_ship()
            .returning(|symbol| Ok(hauler(&symbol.0, "X1-AU21-A1", 0, 0)));
        api.expect_get_market().returning(|wp| {
            let quotes = match wp.0.as_str() {
                "X1-AU21-A1" => vec![market_quote("X1-AU21-A1", "IRON", SupplyLevel::High, TradeGoodType::Export, 200, 180)],
                "X1-AU21-B1" => vec![market_quote("X1-AU21-B1", "COPPER", SupplyLevel::High, TradeGoodType::Export, 300, 280)],
                "X1-AU21-F1" => vec![market_quote("X1-AU21-F1", "FAB_MATS", SupplyLevel::Limited, TradeGoodType::Export, 4200, 4000)],
                "X1-AU21-S1" => vec![market_quote("X1-AU21-S1", "FAB_MATS", SupplyLevel::Scarce, TradeGoodType::Import, 5400, 5000)],
                _ => vec![],
            };
            Ok(quotes)
        });
        api
    }

    async fn seed_markets(bmc: &InMemoryBmc) -> Result<()> {
        bmc.market_bmc()
            .upsert_quotes(
                &ctx(),
                &[
                    market_quote("X1-AU21-A1", "IRON", SupplyLevel::High, TradeGoodType::Export, 200, 180),
                    market_quote("X1-AU21-B1", "COPPER", SupplyLevel::High, TradeGoodType::Export, 300, 280),
                    market_quote("X1-AU21-F1", "FAB_MATS", SupplyLevel::Limited, TradeGoodType::Export, 4200, 4000),
                    market_quote("X1-AU21-S1", "FAB_MATS", SupplyLevel::Scarce, TradeGoodType::Import, 5400, 5000),
                ],
            )
            .await?;
        Ok(())
    }

    fn services(bmc: &Arc<InMemoryBmc>, api: MockApiClientTrait, supervisor: &Arc<ContainerSupervisor>) -> Arc<CoordinatorServices> {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_at(test_epoch()));
        let log = Arc::new(DedupLogSink::new(bmc.container_log_bmc(), Arc::clone(&clock), chrono::Duration::seconds(60), 10_000));
        Arc::new(CoordinatorServices {
            bmc: Arc::clone(bmc) as Arc<dyn Bmc>,
            api: Arc::new(api),
            routing: Arc::new(MockRoutingClientTrait::new()),
            control: Arc::clone(supervisor) as Arc<dyn ContainerControl>,
            storage: Arc::new(NoStorageOperations),
            clock,
            log,
        })
    }

    #[test(tokio::test)]
    async fn clean_manufacturing_cycle_from_scan_to_first_completion() -> Result<()> {
        let bmc = Arc::new(InMemoryBmc::new());
        seed_markets(&bmc).await?;

        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_at(test_epoch()));
        let supervisor = ContainerSupervisor::new(Arc::clone(&bmc) as Arc<dyn Bmc>, Arc::clone(&clock), 3);

        // worker containers execute against a command runner that always
        // moves the full batch
        let mut runner = MockTaskCommandRunner::new();
        runner.expect_run_task().returning(|_, task, _, _| {
            Ok(TaskOutcome {
                units_moved: task.target_units,
                cost: (task.budgeted_unit_price * task.target_units as i64) / 2,
                revenue: 0,
            })
        });
        supervisor.register_executor(
            ContainerType::ManufacturingTaskWorker,
            Arc::new(ManufacturingTaskWorker::new(
                Arc::clone(&bmc) as Arc<dyn Bmc>,
                Arc::new(runner),
                Arc::clone(&clock),
            )),
        );

        let services = services(&bmc, scenario_api(), &supervisor);
        let coordinator_id = ContainerId("mfg-coordinator".to_string());

        // coordinator owns one hauler
        bmc.ship_assignment_bmc()
            .assign(&ctx(), &ShipSymbol("FLEET-2".to_string()), &coordinator_id, test_epoch())
            .await?;

        // opportunity scan: one FABRICATION pipeline, four tasks
        let recovery = StateRecoveryManager::new(Arc::clone(&services));
        let mut state = recovery.recover(&ctx(), coordinator_id.clone(), SystemSymbol("X1-AU21".to_string())).await?;
        let pipelines = PipelineLifecycleManager::new(Arc::clone(&services));
        let created = pipelines.scan_and_create(&ctx(), &coordinator_cfg(), &mut state).await?;
        assert_eq!(created, 1, "one fabrication pipeline (collection has no raw-good spread)");
        assert_eq!(state.active_pipelines.len(), 1);

        let pipeline = state.active_pipelines.values().next().unwrap().clone();
        let tasks = bmc.task_bmc().list_by_pipeline(&ctx(), &pipeline.id).await?;
        assert_eq!(tasks.len(), 4);
        assert_eq!(tasks.iter().filter(|t| t.task_type == TaskType::AcquireDeliver).count(), 2);

        // the supply monitor promotes the two acquisitions (their markets are
        // HIGH and within budget); fabricate and sell stay gated
        let (task_ready_tx, mut task_ready_rx) = mpsc::channel(1);
        let monitor = SupplyMonitor::new(
            Arc::clone(&services.bmc),
            Arc::clone(&services.api),
            Arc::clone(&services.storage),
            Arc::clone(&services.clock),
            task_ready_tx,
            Duration::from_secs(60),
        );
        let outcome = monitor.poll_once(&ctx()).await?;
        assert_eq!(outcome.promoted, 2);
        assert!(task_ready_rx.try_recv().is_ok());

        let ready = bmc.task_bmc().list_by_status(&ctx(), TaskStatus::Ready).await?;
        assert!(ready.iter().all(|t| t.task_type == TaskType::AcquireDeliver));
        state.queue.rebuild(&ready);

        // assignment: the single hauler picks up exactly one acquisition and
        // a worker container runs it to completion
        let assigner = TaskAssignmentManager::new(Arc::clone(&services));
        let (worker_done_tx, mut worker_done_rx) = mpsc::channel::<WorkerCompletion>(16);
        let started = assigner.assign_tasks(&ctx(), &coordinator_cfg(), &mut state, &worker_done_tx).await?;
        assert_eq!(started, 1, "one ship, one worker");
        assert_eq!(bmc.pipeline_bmc().get_pipeline(&ctx(), &pipeline.id).await?.unwrap().status, PipelineStatus::Executing);

        let completion = tokio::time::timeout(Duration::from_secs(5), worker_done_rx.recv())
            .await?
            .expect("worker signals completion");
        assert_eq!(completion.ship_symbol, Some(ShipSymbol("FLEET-2".to_string())));

        let completed = bmc.task_bmc().get_task(&ctx(), &completion.task_id.unwrap()).await?.unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
        assert_eq!(completed.actual_units, 40);

        // completion handling returns the ship to the pool and credits the
        // factory delivery
        let workers = WorkerLifecycleManager::new(Arc::clone(&services));
        workers.handle_completion(&ctx(), &mut state, &completion).await?;

        let assignment = bmc.ship_assignment_bmc().find_by_ship(&ctx(), &ShipSymbol("FLEET-2".to_string())).await?.unwrap();
        assert_eq!(assignment.container_id, Some(coordinator_id), "ship idle at the coordinator again");

        let factory_state = state
            .factory_tracker
            .get(&WaypointSymbol("X1-AU21-F1".to_string()), &"FAB_MATS".into(), &pipeline.id)
            .expect("factory state registered at plan time");
        assert_eq!(factory_state.delivered_inputs.get(&completed.good).copied(), Some(40));

        let stored_pipeline = bmc.pipeline_bmc().get_pipeline(&ctx(), &pipeline.id).await?.unwrap();
        assert_eq!(stored_pipeline.total_cost, completed.total_cost, "task cost rolled up");
        Ok(())
    }

    #[test(tokio::test)]
    async fn stuck_pipeline_is_recycled_and_opportunity_rescanned() -> Result<()> {
        let bmc = Arc::new(InMemoryBmc::new());
        seed_markets(&bmc).await?;

        let manual_clock = ManualClock::starting_at(test_epoch());
        let clock: Arc<dyn Clock> = Arc::new(manual_clock.clone());
        let supervisor = ContainerSupervisor::new(Arc::clone(&bmc) as Arc<dyn Bmc>, Arc::clone(&clock), 3);
        let log = Arc::new(DedupLogSink::new(bmc.container_log_bmc(), Arc::clone(&clock), chrono::Duration::seconds(60), 10_000));
        let services = Arc::new(CoordinatorServices {
            bmc: Arc::clone(&bmc) as Arc<dyn Bmc>,
            api: Arc::new(scenario_api()),
            routing: Arc::new(MockRoutingClientTrait::new()),
            control: Arc::clone(&supervisor) as Arc<dyn ContainerControl>,
            storage: Arc::new(NoStorageOperations),
            clock,
            log,
        });

        let recovery = StateRecoveryManager::new(Arc::clone(&services));
        let mut state = recovery
            .recover(&ctx(), ContainerId("mfg-coordinator".to_string()), SystemSymbol("X1-AU21".to_string()))
            .await?;
        let pipelines = PipelineLifecycleManager::new(Arc::clone(&services));
        pipelines.scan_and_create(&ctx(), &coordinator_cfg(), &mut state).await?;
        let pipeline = state.active_pipelines.values().next().unwrap().clone();

        // all non-terminal tasks sit READY with no eligible ship, well past
        // the stuck threshold
        for task in bmc.task_bmc().list_by_pipeline(&ctx(), &pipeline.id).await? {
            bmc.task_bmc().update_status(&ctx(), &task.id, TaskStatus::Ready, test_epoch()).await?;
        }
        manual_clock.advance(chrono::Duration::minutes(31));

        let recycled = pipelines.recycle_stuck(&ctx(), &mut state, chrono::Duration::minutes(30)).await?;
        assert_eq!(recycled, 1);

        let stored = bmc.pipeline_bmc().get_pipeline(&ctx(), &pipeline.id).await?.unwrap();
        assert_eq!(stored.status, PipelineStatus::Cancelled);
        for task in bmc.task_bmc().list_by_pipeline(&ctx(), &pipeline.id).await? {
            assert_eq!(task.status, TaskStatus::Failed);
            assert_eq!(task.error_message.as_deref(), Some("recycled"));
        }
        assert!(bmc.factory_state_bmc().list_for_player(&ctx()).await?.is_empty(), "factory states deleted");

        // the next scan may recreate the opportunity now that the old
        // pipeline is terminal
        let created = pipelines.scan_and_create(&ctx(), &coordinator_cfg(), &mut state).await?;
        assert_eq!(created, 1, "opportunity still exists, pipeline recreated");
        Ok(())
    }
}
