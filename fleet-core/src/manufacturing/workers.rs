use crate::manufacturing::{build_readiness_snapshot, CoordinatorServices, CoordinatorState};
use crate::readiness::{evaluate, Readiness};
use crate::supervisor::{CompletionSender, WorkerCompletion};
use anyhow::Result;
use fleet_domain::{ContainerConfig, ContainerId, LedgerError, RestartPolicy, ShipSymbol, Task, TaskStatus, TaskType, TaskWorkerConfig};
use fleet_store::Ctx;
use metrics::counter;
use std::sync::Arc;
use tracing::{event, Level};

/// Persists, starts and reaps per-task worker containers and folds their
/// completions back into coordinator state.
pub struct WorkerLifecycleManager {
    services: Arc<CoordinatorServices>,
}

impl WorkerLifecycleManager {
    pub fn new(services: Arc<CoordinatorServices>) -> Self {
        Self { services }
    }

    /// The coordinator -> worker ship-handoff protocol:
    /// persist (PENDING, owns nothing) -> transfer ship -> start. Either
    /// failure rolls the previous step back. Returns false when the handoff
    /// was rolled back and the task should stay READY.
    pub async fn spawn_for_task(&self, ctx: &Ctx, state: &CoordinatorState, task: &Task, ship: &ShipSymbol, completion_tx: CompletionSender) -> Result<bool> {
        let control = &self.services.control;
        let ledger = self.services.bmc.ship_assignment_bmc();

        let worker_id = control
            .persist_container(
                ctx,
                ContainerId::generate("mfg-worker"),
                ContainerConfig::TaskWorker(TaskWorkerConfig {
                    task_id: task.id,
                    ship_symbol: ship.clone(),
                    pipeline_id: task.pipeline_id,
                }),
                Some(state.coordinator_id.clone()),
                RestartPolicy::None,
            )
            .await?;

        if let Err(err) = ledger.transfer(ctx, ship, &state.coordinator_id, &worker_id).await {
            match err {
                LedgerError::Conflict { .. } | LedgerError::NotAssignedTo { .. } | LedgerError::NotFound { .. } => {
                    event!(Level::WARN, ship = %ship, worker = %worker_id, error = %err, "ship transfer lost, rolling worker back");
                    control.stop_container(ctx, &worker_id).await?;
                    return Ok(false);
                }
                LedgerError::Other(err) => return Err(err),
            }
        }

        // the reservation is visible before the worker wakes up
        self.services
            .bmc
            .task_bmc()
            .set_assigned(ctx, &task.id, ship, self.services.clock.now())
            .await?;

        if let Err(err) = control.start_container(ctx, &worker_id, Some(completion_tx)).await {
            event!(Level::WARN, worker = %worker_id, error = %err, "worker start failed, restoring pool");
            self.services
                .bmc
                .task_bmc()
                .clear_assignment(ctx, &task.id, fleet_domain::TaskStatus::Ready, self.services.clock.now())
                .await?;
            if let Err(back) = ledger.transfer(ctx, ship, &worker_id, &state.coordinator_id).await {
                event!(Level::ERROR, ship = %ship, error = %back, "rollback transfer failed");
            }
            control.stop_container(ctx, &worker_id).await?;
            return Ok(false);
        }
        event!(Level::INFO, task = %task.id, ship = %ship, worker = %worker_id, "worker started");
        Ok(true)
    }

    /// Reacts to a worker's exit signal: reclaims the ship, credits factory
    /// deliveries, promotes dependants that became READY.
    pub async fn handle_completion(&self, ctx: &Ctx, state: &mut CoordinatorState, completion: &WorkerCompletion) -> Result<()> {
        let ledger = self.services.bmc.ship_assignment_bmc();
        if let Some(ship) = &completion.ship_symbol {
            match ledger.transfer(ctx, ship, &completion.container_id, &state.coordinator_id).await {
                Ok(()) => {}
                Err(LedgerError::NotAssignedTo { .. }) | Err(LedgerError::NotFound { .. }) => {
                    // already reclaimed by a sweep or released; nothing to do
                }
                Err(err @ LedgerError::Conflict { .. }) => {
                    event!(Level::ERROR, error = %err, "unexpected ledger conflict reclaiming ship");
                }
                Err(LedgerError::Other(err)) => return Err(err),
            }
        }

        let Some(task_id) = completion.task_id else {
            return Ok(());
        };
        state.assigned.remove(&task_id);
        let Some(task) = self.services.bmc.task_bmc().get_task(ctx, &task_id).await? else {
            return Ok(());
        };

        match task.status {
            TaskStatus::Completed => {
                counter!("fleet_tasks_completed_total").increment(1);
                if let Some(pipeline_id) = task.pipeline_id {
                    self.services
                        .bmc
                        .pipeline_bmc()
                        .add_financials(ctx, &pipeline_id, task.total_cost, task.total_revenue, self.services.clock.now())
                        .await?;
                    if matches!(task.task_type, TaskType::AcquireDeliver | TaskType::StorageAcquireDeliver) {
                        if let Some(factory) = &task.factory {
                            state
                                .factory_tracker
                                .record_delivery(ctx, pipeline_id, factory, &task.good, task.actual_units)
                                .await?;
                        }
                    }
                    // an intermediate fabricate that delivered into another factory
                    if task.task_type == TaskType::FabricateSell && task.target_market.is_some() {
                        if let Some(target) = &task.target_market {
                            state
                                .factory_tracker
                                .record_delivery(ctx, pipeline_id, target, &task.good, task.actual_units)
                                .await?;
                        }
                    }
                }
                self.promote_unblocked_dependants(ctx, state, &task).await?;
            }
            TaskStatus::Failed => {
                counter!("fleet_tasks_failed_total").increment(1);
                event!(Level::WARN, task = %task.id, error = task.error_message.as_deref().unwrap_or("unknown"), "task failed");
            }
            _ => {
                // worker put the task back to READY (precondition moved or
                // cancellation); requeue it
                if task.status == TaskStatus::Ready {
                    state.queue.push(&task);
                }
            }
        }
        Ok(())
    }

    async fn promote_unblocked_dependants(&self, ctx: &Ctx, state: &mut CoordinatorState, completed: &Task) -> Result<()> {
        let dependencies = self.services.bmc.task_bmc().list_dependencies(ctx).await?;
        let dependant_ids: Vec<_> = dependencies
            .iter()
            .filter(|d| d.depends_on_id == completed.id)
            .map(|d| d.task_id)
            .collect();
        if dependant_ids.is_empty() {
            return Ok(());
        }

        let snapshot = build_readiness_snapshot(&self.services, ctx, state).await?;
        for dependant_id in dependant_ids {
            let Some(dependant) = self.services.bmc.task_bmc().get_task(ctx, &dependant_id).await? else {
                continue;
            };
            if dependant.status != TaskStatus::Pending {
                continue;
            }
            if let Readiness::Ready = evaluate(&dependant, &snapshot) {
                self.services
                    .bmc
                    .task_bmc()
                    .update_status(ctx, &dependant.id, TaskStatus::Ready, self.services.clock.now())
                    .await?;
                if let Some(ready) = self.services.bmc.task_bmc().get_task(ctx, &dependant.id).await? {
                    state.queue.push(&ready);
                }
                event!(Level::INFO, task = %dependant.id, "dependant promoted to READY");
            }
        }
        Ok(())
    }
}
