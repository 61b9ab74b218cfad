use crate::configuration::CoordinatorTiming;
use crate::manufacturing::assignment::TaskAssignmentManager;
use crate::manufacturing::orphaned_cargo::OrphanedCargoHandler;
use crate::manufacturing::pipelines::PipelineLifecycleManager;
use crate::manufacturing::recovery::StateRecoveryManager;
use crate::manufacturing::workers::WorkerLifecycleManager;
use crate::manufacturing::{CoordinatorServices, CoordinatorState};
use crate::supervisor::{ContainerExecutor, ExecutionContext, WorkerCompletion};
use crate::supply_monitor::SupplyMonitor;
use anyhow::{bail, Result};
use async_trait::async_trait;
use fleet_domain::{exit_reason, release_reason, ContainerConfig, ContainerExit, ContainerType, LogLevel, ManufacturingCoordinatorConfig};
use fleet_store::Ctx;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{event, Level};

const WORKER_COMPLETION_BUFFER: usize = 64;

/// The parallel manufacturing coordinator. One cooperative loop multiplexes
/// the four tickers, the task-ready signal, worker completions and
/// cancellation; every repository mutation happens on this loop. The
/// SupplyMonitor runs beside it and talks only through the repositories and
/// the one-slot channel.
#[derive(Debug)]
pub struct ManufacturingCoordinator {
    services: Arc<CoordinatorServices>,
    timing: CoordinatorTiming,
}

impl ManufacturingCoordinator {
    pub fn new(services: Arc<CoordinatorServices>, timing: CoordinatorTiming) -> Self {
        Self { services, timing }
    }

    async fn run(&self, exec: &ExecutionContext, cfg: &ManufacturingCoordinatorConfig) -> Result<()> {
        let ctx = exec.ctx;
        let coordinator_id = exec.container.id.clone();
        let services = &self.services;

        // clean reboot: no stray task workers survive a coordinator start
        let swept = services.control.stop_workers_of_type(&ctx, ContainerType::ManufacturingTaskWorker).await?;
        if swept > 0 {
            event!(Level::INFO, swept, "stopped stale task workers before recovery");
        }

        let recovery = StateRecoveryManager::new(Arc::clone(services));
        let mut state = recovery.recover(&ctx, coordinator_id.clone(), cfg.system_symbol.clone()).await?;

        let pipelines = PipelineLifecycleManager::new(Arc::clone(services));
        let assigner = TaskAssignmentManager::new(Arc::clone(services));
        let workers = WorkerLifecycleManager::new(Arc::clone(services));
        let orphans = OrphanedCargoHandler::new(Arc::clone(services));

        // recovery tail: catch pipelines that finished while we were down,
        // then deal with cargo nothing accounts for
        pipelines.sweep_completions(&ctx, &mut state).await?;
        orphans.sweep(&ctx, &mut state).await?;

        let (task_ready_tx, mut task_ready_rx) = mpsc::channel::<()>(1);
        let (worker_done_tx, mut worker_done_rx) = mpsc::channel::<WorkerCompletion>(WORKER_COMPLETION_BUFFER);

        let monitor = SupplyMonitor::new(
            Arc::clone(&services.bmc),
            Arc::clone(&services.api),
            Arc::clone(&services.storage),
            Arc::clone(&services.clock),
            task_ready_tx,
            self.timing.supply_poll,
        );
        let monitor_cancellation = exec.cancellation.child_token();
        let monitor_handle = tokio::spawn(monitor.run(ctx, monitor_cancellation.clone()));

        let mut opportunity_tick = tokio::time::interval(self.timing.opportunity_scan);
        let mut stuck_tick = tokio::time::interval(self.timing.stuck_check);
        let mut idle_tick = tokio::time::interval(self.timing.idle_assign);
        let mut sweep_tick = tokio::time::interval(self.timing.completion_sweep);
        for ticker in [&mut opportunity_tick, &mut stuck_tick, &mut idle_tick, &mut sweep_tick] {
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        }

        services
            .log
            .log(&ctx, &coordinator_id, LogLevel::Info, "manufacturing coordinator loop started")
            .await?;

        loop {
            tokio::select! {
                _ = exec.cancellation.cancelled() => break,

                _ = opportunity_tick.tick() => {
                    if let Err(err) = pipelines.scan_and_create(&ctx, cfg, &mut state).await {
                        event!(Level::WARN, error = %err, "opportunity scan failed");
                    }
                }

                _ = stuck_tick.tick() => {
                    match pipelines.recycle_stuck(&ctx, &mut state, self.timing.stuck_threshold).await {
                        Ok(recycled) if recycled > 0 => {
                            // recycled capital goes straight back to work
                            if let Err(err) = pipelines.scan_and_create(&ctx, cfg, &mut state).await {
                                event!(Level::WARN, error = %err, "post-recycle scan failed");
                            }
                        }
                        Ok(_) => {}
                        Err(err) => event!(Level::WARN, error = %err, "stuck-pipeline check failed"),
                    }
                }

                _ = idle_tick.tick() => {
                    self.observe_factory_supply(&ctx, &mut state).await;
                    if let Err(err) = assigner.rescue_ready_collect_sells(&ctx, &mut state).await {
                        event!(Level::WARN, error = %err, "rescue pass failed");
                    }
                    if let Err(err) = assigner.assign_tasks(&ctx, cfg, &mut state, &worker_done_tx).await {
                        event!(Level::WARN, error = %err, "assignment pass failed");
                    }
                }

                _ = sweep_tick.tick() => {
                    if let Err(err) = pipelines.sweep_completions(&ctx, &mut state).await {
                        event!(Level::WARN, error = %err, "completion sweep failed");
                    }
                }

                Some(()) = task_ready_rx.recv() => {
                    // refresh the queue from the repository, then assign
                    match services.bmc.task_bmc().list_by_status(&ctx, fleet_domain::TaskStatus::Ready).await {
                        Ok(ready) => state.queue.rebuild(&ready),
                        Err(err) => event!(Level::WARN, error = %err, "queue refresh failed"),
                    }
                    if let Err(err) = assigner.assign_tasks(&ctx, cfg, &mut state, &worker_done_tx).await {
                        event!(Level::WARN, error = %err, "signal-driven assignment failed");
                    }
                }

                Some(completion) = worker_done_rx.recv() => {
                    if let Err(err) = workers.handle_completion(&ctx, &mut state, &completion).await {
                        event!(Level::WARN, worker = %completion.container_id, error = %err, "completion handling failed");
                    }
                    if let Some(task_id) = completion.task_id {
                        if let Ok(Some(task)) = services.bmc.task_bmc().get_task(&ctx, &task_id).await {
                            if task.status == fleet_domain::TaskStatus::Failed {
                                if let Err(err) = orphans.sweep(&ctx, &mut state).await {
                                    event!(Level::WARN, error = %err, "orphaned-cargo sweep failed");
                                }
                            }
                            if let Some(pipeline_id) = task.pipeline_id {
                                if let Err(err) = pipelines.check_pipeline_completion(&ctx, &mut state, pipeline_id).await {
                                    event!(Level::WARN, error = %err, "pipeline completion check failed");
                                }
                            }
                        }
                    }
                    if let Err(err) = assigner.assign_tasks(&ctx, cfg, &mut state, &worker_done_tx).await {
                        event!(Level::WARN, error = %err, "post-completion assignment failed");
                    }
                }
            }
        }

        // orderly shutdown
        monitor_cancellation.cancel();
        let _ = monitor_handle.await;
        self.shutdown(&ctx, &state).await?;
        Ok(())
    }

    /// Feeds observed factory-output quotes into the edge detector. Runs on
    /// the loop so the tracker (a loop-owned cache) has a single writer.
    async fn observe_factory_supply(&self, ctx: &Ctx, state: &mut CoordinatorState) {
        let observations: Vec<_> = state
            .factory_tracker
            .states()
            .into_iter()
            .map(|s| (s.factory, s.output_good))
            .collect();
        for (factory, good) in observations {
            let quote = match self.services.bmc.market_bmc().latest(ctx, &factory, &good).await {
                Ok(Some(quote)) => quote,
                Ok(None) => continue,
                Err(err) => {
                    event!(Level::WARN, factory = %factory, error = %err, "factory quote lookup failed");
                    continue;
                }
            };
            if let Some(supply) = quote.supply {
                if let Err(err) = state.factory_tracker.observe_supply(ctx, &factory, &good, supply).await {
                    event!(Level::WARN, factory = %factory, error = %err, "factory supply observation failed");
                }
            }
        }
    }

    async fn shutdown(&self, ctx: &Ctx, state: &CoordinatorState) -> Result<()> {
        // stop child workers best-effort, then give the pool back
        let children = self
            .services
            .bmc
            .container_bmc()
            .list_running_of_type(ctx, ContainerType::ManufacturingTaskWorker)
            .await?;
        for child in children.iter().filter(|c| c.parent_id.as_ref() == Some(&state.coordinator_id)) {
            if let Err(err) = self.services.control.stop_container(ctx, &child.id).await {
                event!(Level::WARN, worker = %child.id, error = %err, "worker stop failed during shutdown");
            }
        }
        let released = self
            .services
            .bmc
            .ship_assignment_bmc()
            .release_all_for_container(ctx, &state.coordinator_id, release_reason::COORDINATOR_STOPPED, self.services.clock.now())
            .await?;
        event!(Level::INFO, released, "manufacturing coordinator stopped");
        Ok(())
    }
}

#[async_trait]
impl ContainerExecutor for ManufacturingCoordinator {
    async fn execute(&self, exec: ExecutionContext) -> Result<ContainerExit> {
        let ContainerConfig::ManufacturingCoordinator(cfg) = exec.container.config.clone() else {
            bail!("container {} does not carry a manufacturing coordinator config", exec.container.id);
        };
        self.run(&exec, &cfg).await?;
        Ok(ContainerExit::success(exit_reason::STOPPED))
    }
}
