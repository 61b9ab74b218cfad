use crate::supervisor::{ContainerExecutor, ExecutionContext, WorkerCompletion};
use anyhow::{bail, Result};
use async_trait::async_trait;
use fleet_domain::{exit_reason, Clock, ContainerConfig, ContainerExit, ShipSymbol, Task, TaskStatus, WorkerError};
use fleet_store::{Bmc, Ctx};
use mockall::automock;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

/// Result of running one task's action sequence to the end.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskOutcome {
    pub units_moved: i32,
    pub cost: i64,
    pub revenue: i64,
}

/// The command-level action sequence of one task (navigate, dock, purchase,
/// deliver, ...). Lives outside the core; the worker only drives lifecycle,
/// retries and bookkeeping around it.
#[automock]
#[async_trait]
pub trait TaskCommandRunner: Send + Sync + Debug {
    async fn run_task(&self, ctx: &Ctx, task: &Task, ship: &ShipSymbol, cancellation: &CancellationToken) -> Result<TaskOutcome, WorkerError>;
}

/// Executor for MANUFACTURING_TASK_WORKER containers: one ship, one task.
#[derive(Debug)]
pub struct ManufacturingTaskWorker {
    bmc: Arc<dyn Bmc>,
    runner: Arc<dyn TaskCommandRunner>,
    clock: Arc<dyn Clock>,
    retry_backoff: Duration,
}

impl ManufacturingTaskWorker {
    pub fn new(bmc: Arc<dyn Bmc>, runner: Arc<dyn TaskCommandRunner>, clock: Arc<dyn Clock>) -> Self {
        Self {
            bmc,
            runner,
            clock,
            retry_backoff: Duration::from_millis(500),
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    async fn run_with_retries(&self, ctx: &Ctx, task: &Task, ship: &ShipSymbol, cancellation: &CancellationToken) -> Result<TaskOutcome, WorkerError> {
        let mut attempt = task.retry_count;
        loop {
            let run = tokio::select! {
                biased;
                _ = cancellation.cancelled() => Err(WorkerError::Cancelled),
                outcome = self.runner.run_task(ctx, task, ship, cancellation) => outcome,
            };
            match run {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_retryable() && attempt < task.max_retries && !cancellation.is_cancelled() => {
                    attempt = self
                        .bmc
                        .task_bmc()
                        .increment_retry(ctx, &task.id)
                        .await
                        .map_err(WorkerError::Fatal)?;
                    event!(Level::WARN, task = %task.id, attempt, error = %err, "transient failure, retrying");
                    tokio::time::sleep(self.retry_backoff * attempt.max(1) as u32).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl ContainerExecutor for ManufacturingTaskWorker {
    async fn execute(&self, exec: ExecutionContext) -> Result<ContainerExit> {
        let ContainerConfig::TaskWorker(config) = &exec.container.config else {
            bail!("container {} does not carry a task-worker config", exec.container.id);
        };
        let ctx = exec.ctx;
        let task_bmc = self.bmc.task_bmc();

        let Some(task) = task_bmc.get_task(&ctx, &config.task_id).await? else {
            bail!("task {} not found for worker {}", config.task_id, exec.container.id);
        };
        if task.status != TaskStatus::Assigned {
            bail!("task {} is {} not ASSIGNED, refusing to execute", task.id, task.status);
        }

        task_bmc.update_status(&ctx, &task.id, TaskStatus::Executing, self.clock.now()).await?;

        let exit = match self.run_with_retries(&ctx, &task, &config.ship_symbol, &exec.cancellation).await {
            Ok(outcome) => {
                task_bmc
                    .record_outcome(
                        &ctx,
                        &task.id,
                        TaskStatus::Completed,
                        outcome.units_moved,
                        outcome.cost,
                        outcome.revenue,
                        None,
                        self.clock.now(),
                    )
                    .await?;
                ContainerExit::success(exit_reason::COMPLETED)
            }
            Err(WorkerError::Cancelled) => {
                // resumable: the task goes back to READY with its ship
                // affinity intact, the next coordinator start picks it up
                task_bmc.update_status(&ctx, &task.id, TaskStatus::Ready, self.clock.now()).await?;
                ContainerExit::success(exit_reason::STOPPED)
            }
            Err(WorkerError::PreconditionViolated(detail)) => {
                event!(Level::WARN, task = %task.id, detail = %detail, "precondition moved, returning task to READY");
                task_bmc.clear_assignment(&ctx, &task.id, TaskStatus::Ready, self.clock.now()).await?;
                ContainerExit::success(exit_reason::COMPLETED)
            }
            Err(WorkerError::Fatal(err)) => return Err(err),
            Err(err) => {
                task_bmc
                    .record_outcome(&ctx, &task.id, TaskStatus::Failed, 0, 0, 0, Some(err.to_string()), self.clock.now())
                    .await?;
                ContainerExit::failure(exit_reason::FAILED)
            }
        };

        if let Some(tx) = &exec.completion_tx {
            // non-blocking send; a dropped signal is caught by the
            // coordinator's completion-sweep tick
            let _ = tx.try_send(WorkerCompletion {
                container_id: exec.container.id.clone(),
                task_id: Some(task.id),
                ship_symbol: Some(config.ship_symbol.clone()),
            });
        }
        Ok(exit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_domain::test_fixtures::{task, test_epoch};
    use fleet_domain::{
        Container, ContainerId, ContainerStatus, ManualClock, PipelineId, PlayerId, RestartPolicy, TaskType, TaskWorkerConfig,
    };
    use fleet_store::InMemoryBmc;
    use test_log::test;
    use tokio::sync::mpsc;

    fn ctx() -> Ctx {
        Ctx::for_player(PlayerId(1))
    }

    fn worker_container(task_id: fleet_domain::TaskId) -> Container {
        let config = ContainerConfig::TaskWorker(TaskWorkerConfig {
            task_id,
            ship_symbol: ShipSymbol("SHIP-2".to_string()),
            pipeline_id: None::<PipelineId>,
        });
        Container {
            id: ContainerId("worker-1".to_string()),
            player_id: PlayerId(1),
            container_type: config.container_type(),
            command_label: "manufacturing_task_worker".to_string(),
            status: ContainerStatus::Running,
            parent_id: Some(ContainerId("coordinator".to_string())),
            restart_policy: RestartPolicy::None,
            restart_count: 0,
            config,
            created_at: test_epoch(),
            started_at: Some(test_epoch()),
            stopped_at: None,
            exit_code: None,
            exit_reason: None,
        }
    }

    async fn seed_assigned_task(bmc: &InMemoryBmc) -> fleet_domain::Task {
        let mut t = task(TaskType::AcquireDeliver, "IRON", PlayerId(1));
        t.status = TaskStatus::Assigned;
        t.assigned_ship = Some(ShipSymbol("SHIP-2".to_string()));
        bmc.task_bmc().insert_tasks_with_dependencies(&ctx(), &[t.clone()], &[]).await.unwrap();
        t
    }

    fn worker(bmc: Arc<InMemoryBmc>, runner: MockTaskCommandRunner) -> ManufacturingTaskWorker {
        ManufacturingTaskWorker::new(
            bmc,
            Arc::new(runner),
            Arc::new(ManualClock::starting_at(test_epoch())),
        )
        .with_retry_backoff(Duration::from_millis(1))
    }

    #[test(tokio::test)]
    async fn successful_run_completes_task_and_signals() -> Result<()> {
        let bmc = Arc::new(InMemoryBmc::new());
        let seeded = seed_assigned_task(&bmc).await;

        let mut runner = MockTaskCommandRunner::new();
        runner.expect_run_task().times(1).returning(|_, _, _, _| {
            Ok(TaskOutcome {
                units_moved: 40,
                cost: 8000,
                revenue: 0,
            })
        });

        let (tx, mut rx) = mpsc::channel(4);
        let exit = worker(Arc::clone(&bmc), runner)
            .execute(ExecutionContext {
                container: worker_container(seeded.id),
                ctx: ctx(),
                cancellation: CancellationToken::new(),
                completion_tx: Some(tx),
            })
            .await?;

        assert_eq!(exit, ContainerExit::success(exit_reason::COMPLETED));
        let stored = bmc.task_bmc().get_task(&ctx(), &seeded.id).await?.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.actual_units, 40);
        assert_eq!(stored.total_cost, 8000);

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.task_id, Some(seeded.id));
        assert_eq!(completion.ship_symbol, Some(ShipSymbol("SHIP-2".to_string())));
        Ok(())
    }

    #[test(tokio::test)]
    async fn transient_failures_retry_then_fail_on_exhaustion() -> Result<()> {
        let bmc = Arc::new(InMemoryBmc::new());
        let seeded = seed_assigned_task(&bmc).await;

        let mut runner = MockTaskCommandRunner::new();
        runner
            .expect_run_task()
            .times(4) // initial + 3 retries (max_retries = 3)
            .returning(|_, _, _, _| Err(WorkerError::TransientUpstream("429".to_string())));

        let exit = worker(Arc::clone(&bmc), runner)
            .execute(ExecutionContext {
                container: worker_container(seeded.id),
                ctx: ctx(),
                cancellation: CancellationToken::new(),
                completion_tx: None,
            })
            .await?;

        assert_eq!(exit, ContainerExit::failure(exit_reason::FAILED));
        let stored = bmc.task_bmc().get_task(&ctx(), &seeded.id).await?.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.retry_count, 3);
        assert!(stored.error_message.unwrap().contains("429"));
        Ok(())
    }

    #[test(tokio::test)]
    async fn precondition_violation_returns_task_to_ready_without_ship() -> Result<()> {
        let bmc = Arc::new(InMemoryBmc::new());
        let seeded = seed_assigned_task(&bmc).await;

        let mut runner = MockTaskCommandRunner::new();
        runner
            .expect_run_task()
            .times(1)
            .returning(|_, _, _, _| Err(WorkerError::PreconditionViolated("supply dropped".to_string())));

        let (tx, mut rx) = mpsc::channel(4);
        worker(Arc::clone(&bmc), runner)
            .execute(ExecutionContext {
                container: worker_container(seeded.id),
                ctx: ctx(),
                cancellation: CancellationToken::new(),
                completion_tx: Some(tx),
            })
            .await?;

        let stored = bmc.task_bmc().get_task(&ctx(), &seeded.id).await?.unwrap();
        assert_eq!(stored.status, TaskStatus::Ready);
        assert_eq!(stored.assigned_ship, None, "ship released back through the completion path");
        assert!(rx.recv().await.is_some(), "coordinator still reclaims the ship");
        Ok(())
    }

    #[test(tokio::test)]
    async fn cancellation_leaves_task_ready_with_ship_affinity() -> Result<()> {
        let bmc = Arc::new(InMemoryBmc::new());
        let seeded = seed_assigned_task(&bmc).await;

        // cancellation is checked before the runner ever gets a turn
        let runner = MockTaskCommandRunner::new();

        let token = CancellationToken::new();
        token.cancel();
        let exit = worker(Arc::clone(&bmc), runner)
            .execute(ExecutionContext {
                container: worker_container(seeded.id),
                ctx: ctx(),
                cancellation: token,
                completion_tx: None,
            })
            .await?;

        assert_eq!(exit, ContainerExit::success(exit_reason::STOPPED));
        let stored = bmc.task_bmc().get_task(&ctx(), &seeded.id).await?.unwrap();
        assert_eq!(stored.status, TaskStatus::Ready);
        assert_eq!(stored.assigned_ship, Some(ShipSymbol("SHIP-2".to_string())), "resumable with the same ship");
        Ok(())
    }
}
