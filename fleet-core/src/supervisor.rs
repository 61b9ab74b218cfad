use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use fleet_domain::{
    exit_reason, release_reason, Clock, Container, ContainerConfig, ContainerExit, ContainerId, ContainerStatus, ContainerType, PlayerId, RestartPolicy,
    ShipSymbol, TaskId,
};
use fleet_store::{Bmc, Ctx};
use metrics::counter;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

/// Sent by a worker when it exits; the coordinator reclaims the ship through
/// the ledger after reading this. Delivery is best-effort, the coordinator's
/// completion-sweep tick covers dropped signals.
#[derive(Debug, Clone)]
pub struct WorkerCompletion {
    pub container_id: ContainerId,
    pub task_id: Option<TaskId>,
    pub ship_symbol: Option<ShipSymbol>,
}

pub type CompletionSender = mpsc::Sender<WorkerCompletion>;

/// Handed to an executor for one run of one container.
pub struct ExecutionContext {
    pub container: Container,
    pub ctx: Ctx,
    pub cancellation: CancellationToken,
    pub completion_tx: Option<CompletionSender>,
}

#[async_trait]
pub trait ContainerExecutor: Send + Sync + Debug {
    async fn execute(&self, exec: ExecutionContext) -> Result<ContainerExit>;
}

/// The narrow slice of the supervisor that coordinators need to manage their
/// worker containers. Keeps the coordinator <-> supervisor wiring non-cyclic
/// at the type level.
#[async_trait]
pub trait ContainerControl: Send + Sync + Debug {
    /// Writes a PENDING record. Does not start anything; the window between
    /// persist and start is where ship transfers happen.
    async fn persist_container(
        &self,
        ctx: &Ctx,
        id: ContainerId,
        config: ContainerConfig,
        parent_id: Option<ContainerId>,
        restart_policy: RestartPolicy,
    ) -> Result<ContainerId>;
    async fn start_container(&self, ctx: &Ctx, id: &ContainerId, completion_tx: Option<CompletionSender>) -> Result<()>;
    async fn stop_container(&self, ctx: &Ctx, id: &ContainerId) -> Result<()>;
    /// Class-scoped sweep: stop every RUNNING worker of one type so a
    /// coordinator reboots onto a clean slate.
    async fn stop_workers_of_type(&self, ctx: &Ctx, container_type: ContainerType) -> Result<usize>;
}

struct RunningFiber {
    cancellation: CancellationToken,
}

pub struct ContainerSupervisor {
    bmc: Arc<dyn Bmc>,
    clock: Arc<dyn Clock>,
    restart_cap: i32,
    executors: RwLock<HashMap<ContainerType, Arc<dyn ContainerExecutor>>>,
    running: Arc<Mutex<HashMap<ContainerId, RunningFiber>>>,
}

impl Debug for ContainerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSupervisor").finish()
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub coordinators_redispatched: usize,
    pub workers_reaped: usize,
}

impl ContainerSupervisor {
    pub fn new(bmc: Arc<dyn Bmc>, clock: Arc<dyn Clock>, restart_cap: i32) -> Arc<Self> {
        Arc::new(Self {
            bmc,
            clock,
            restart_cap,
            executors: RwLock::new(HashMap::new()),
            running: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn register_executor(&self, container_type: ContainerType, executor: Arc<dyn ContainerExecutor>) {
        self.executors
            .write()
            .expect("executor registry poisoned")
            .insert(container_type, executor);
    }

    fn executor_for(&self, container_type: ContainerType) -> Result<Arc<dyn ContainerExecutor>> {
        self.executors
            .read()
            .expect("executor registry poisoned")
            .get(&container_type)
            .cloned()
            .ok_or_else(|| anyhow!("no executor registered for container type {}", container_type))
    }

    fn spawn_fiber(&self, container: Container, completion_tx: Option<CompletionSender>) -> Result<()> {
        let executor = self.executor_for(container.container_type)?;
        let token = CancellationToken::new();
        {
            let mut running = self.running.lock().expect("running map poisoned");
            if running.contains_key(&container.id) {
                bail!("container {} already has a running fiber", container.id);
            }
            running.insert(
                container.id.clone(),
                RunningFiber {
                    cancellation: token.clone(),
                },
            );
        }

        let bmc = Arc::clone(&self.bmc);
        let clock = Arc::clone(&self.clock);
        let running = Arc::clone(&self.running);
        let restart_cap = self.restart_cap;
        let ctx = Ctx::for_player(container.player_id);
        let container_id = container.id.clone();
        let restart_policy = container.restart_policy;

        tokio::spawn(async move {
            let exit = loop {
                let exec_ctx = ExecutionContext {
                    container: container.clone(),
                    ctx,
                    cancellation: token.clone(),
                    completion_tx: completion_tx.clone(),
                };
                match executor.execute(exec_ctx).await {
                    Ok(exit) => break exit,
                    Err(err) => {
                        event!(
                            Level::ERROR,
                            container = %container.id,
                            error = %err,
                            "container executor failed"
                        );
                        counter!("fleet_container_executor_failures_total").increment(1);
                        if restart_policy == RestartPolicy::OnFailure && !token.is_cancelled() {
                            match bmc.container_bmc().increment_restart_count(&ctx, &container.id).await {
                                Ok(count) if count <= restart_cap => {
                                    event!(Level::WARN, container = %container.id, restart = count, "restarting container");
                                    continue;
                                }
                                Ok(_) => break ContainerExit::failure(exit_reason::RESTART_BUDGET_EXHAUSTED),
                                Err(db_err) => {
                                    event!(Level::ERROR, container = %container.id, error = %db_err, "restart bookkeeping failed");
                                    break ContainerExit::failure(exit_reason::FAILED);
                                }
                            }
                        }
                        break ContainerExit::failure(exit_reason::FAILED);
                    }
                }
            };

            if let Err(err) = bmc.container_bmc().mark_stopped(&ctx, &container_id, clock.now(), &exit).await {
                event!(Level::ERROR, container = %container_id, error = %err, "failed to persist container exit");
            }
            running.lock().expect("running map poisoned").remove(&container_id);
        });
        Ok(())
    }

    /// Crash recovery per the startup failure model: every worker that was
    /// RUNNING when the process died is reaped (its fiber is gone either
    /// way), ships go back to their coordinator or the pool, and coordinator
    /// roots are re-dispatched with their persisted config.
    pub async fn recover(&self, ctx: &Ctx) -> Result<RecoverySummary> {
        let running = self.bmc.container_bmc().list_by_status(ctx, ContainerStatus::Running).await?;
        let (coordinators, workers): (Vec<Container>, Vec<Container>) =
            running.into_iter().partition(|c| c.container_type.is_coordinator());

        let mut summary = RecoverySummary::default();
        for worker in workers {
            self.reap_worker(ctx, &worker, exit_reason::ORPHANED_BY_COORDINATOR_RESTART).await?;
            summary.workers_reaped += 1;
        }
        for coordinator in coordinators {
            event!(Level::INFO, container = %coordinator.id, "re-dispatching coordinator after restart");
            self.spawn_fiber(coordinator, None)?;
            summary.coordinators_redispatched += 1;
        }
        counter!("fleet_recoveries_total").increment(1);
        Ok(summary)
    }

    async fn reap_worker(&self, ctx: &Ctx, worker: &Container, reason: &str) -> Result<()> {
        let ledger = self.bmc.ship_assignment_bmc();
        let parent_is_live = match &worker.parent_id {
            Some(parent_id) => self
                .bmc
                .container_bmc()
                .get_container(ctx, parent_id)
                .await?
                .map(|p| p.status != ContainerStatus::Stopped)
                .unwrap_or(false),
            None => false,
        };

        for assignment in ledger.find_by_container(ctx, &worker.id).await? {
            let outcome = match (&worker.parent_id, parent_is_live) {
                (Some(parent_id), true) => ledger.transfer(ctx, &assignment.ship_symbol, &worker.id, parent_id).await,
                _ => ledger.release(ctx, &assignment.ship_symbol, release_reason::WORKER_ORPHANED, self.clock.now()).await,
            };
            if let Err(err) = outcome {
                event!(Level::WARN, worker = %worker.id, ship = %assignment.ship_symbol, error = %err, "ship handback failed during reap");
            }
        }

        self.bmc
            .container_bmc()
            .mark_stopped(ctx, &worker.id, self.clock.now(), &ContainerExit::failure(reason))
            .await?;
        counter!("fleet_workers_reaped_total").increment(1);
        Ok(())
    }

    /// One CONTRACT_WORKFLOW per player: persists under the type-scoped
    /// singleton guard. Returns None when a live one already exists.
    pub async fn create_singleton(&self, ctx: &Ctx, config: ContainerConfig, restart_policy: RestartPolicy) -> Result<Option<ContainerId>> {
        let container = self.build_container(ctx.player_id(), ContainerId::generate(&config.container_type().to_string().to_lowercase()), config, None, restart_policy);
        let created = self.bmc.container_bmc().create_if_no_running_of_type(ctx, &container).await?;
        Ok(created.then_some(container.id))
    }

    /// One coordinator per scope (system, gas giant, mining site): the guard
    /// scans live config blobs for the scope fragment.
    pub async fn create_scoped_singleton(&self, ctx: &Ctx, config: ContainerConfig, restart_policy: RestartPolicy) -> Result<Option<ContainerId>> {
        let fragment = config
            .scope_fragment()
            .ok_or_else(|| anyhow!("config for {} has no scope fragment", config.container_type()))?;
        let container = self.build_container(ctx.player_id(), ContainerId::generate(&config.container_type().to_string().to_lowercase()), config, None, restart_policy);
        let created = self.bmc.container_bmc().create_if_no_running_in_scope(ctx, &container, &fragment).await?;
        Ok(created.then_some(container.id))
    }

    fn build_container(
        &self,
        player_id: PlayerId,
        id: ContainerId,
        config: ContainerConfig,
        parent_id: Option<ContainerId>,
        restart_policy: RestartPolicy,
    ) -> Container {
        Container {
            id,
            player_id,
            container_type: config.container_type(),
            command_label: config.container_type().to_string().to_lowercase(),
            status: ContainerStatus::Pending,
            parent_id,
            restart_policy,
            restart_count: 0,
            config,
            created_at: self.clock.now(),
            started_at: None,
            stopped_at: None,
            exit_code: None,
            exit_reason: None,
        }
    }
}

#[async_trait]
impl ContainerControl for ContainerSupervisor {
    async fn persist_container(
        &self,
        ctx: &Ctx,
        id: ContainerId,
        config: ContainerConfig,
        parent_id: Option<ContainerId>,
        restart_policy: RestartPolicy,
    ) -> Result<ContainerId> {
        let container = self.build_container(ctx.player_id(), id, config, parent_id, restart_policy);
        self.bmc.container_bmc().persist_container(ctx, &container).await?;
        Ok(container.id)
    }

    async fn start_container(&self, ctx: &Ctx, id: &ContainerId, completion_tx: Option<CompletionSender>) -> Result<()> {
        let container = self
            .bmc
            .container_bmc()
            .get_container(ctx, id)
            .await?
            .ok_or_else(|| anyhow!("container {} not found", id))?;

        let started = self.bmc.container_bmc().mark_running(ctx, id, self.clock.now()).await?;
        if !started {
            bail!("container {} is not PENDING, refusing to start", id);
        }

        self.spawn_fiber(container, completion_tx)?;
        counter!("fleet_containers_started_total").increment(1);
        Ok(())
    }

    async fn stop_container(&self, ctx: &Ctx, id: &ContainerId) -> Result<()> {
        if let Some(fiber) = self.running.lock().expect("running map poisoned").get(id) {
            fiber.cancellation.cancel();
        }
        // stop wins the race with the fiber's own exit write; both paths only
        // touch rows that are not yet STOPPED
        self.bmc
            .container_bmc()
            .mark_stopped(ctx, id, self.clock.now(), &ContainerExit::success(exit_reason::STOPPED))
            .await?;
        counter!("fleet_containers_stopped_total").increment(1);
        Ok(())
    }

    async fn stop_workers_of_type(&self, ctx: &Ctx, container_type: ContainerType) -> Result<usize> {
        let workers = self.bmc.container_bmc().list_running_of_type(ctx, container_type).await?;
        let count = workers.len();
        for worker in workers {
            if let Some(fiber) = self.running.lock().expect("running map poisoned").get(&worker.id) {
                fiber.cancellation.cancel();
            }
            self.reap_worker(ctx, &worker, exit_reason::ORPHANED_BY_COORDINATOR_RESTART).await?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_domain::test_fixtures::test_epoch;
    use fleet_domain::{ContractWorkflowConfig, ManualClock, SystemSymbol, TaskWorkerConfig, WaypointSymbol};
    use fleet_store::InMemoryBmc;
    use std::time::Duration;
    use test_log::test;

    /// Runs until cancelled, then exits cleanly.
    #[derive(Debug)]
    struct WaitForCancelExecutor;

    #[async_trait]
    impl ContainerExecutor for WaitForCancelExecutor {
        async fn execute(&self, exec: ExecutionContext) -> Result<ContainerExit> {
            exec.cancellation.cancelled().await;
            Ok(ContainerExit::success(exit_reason::STOPPED))
        }
    }

    /// Fails `failures` times, then succeeds.
    #[derive(Debug)]
    struct FlakyExecutor {
        failures: std::sync::atomic::AtomicI32,
    }

    #[async_trait]
    impl ContainerExecutor for FlakyExecutor {
        async fn execute(&self, _exec: ExecutionContext) -> Result<ContainerExit> {
            if self.failures.fetch_sub(1, std::sync::atomic::Ordering::SeqCst) > 0 {
                bail!("synthetic failure");
            }
            Ok(ContainerExit::success(exit_reason::COMPLETED))
        }
    }

    fn setup() -> (Arc<ContainerSupervisor>, Arc<InMemoryBmc>, Ctx) {
        let bmc = Arc::new(InMemoryBmc::new());
        let clock = Arc::new(ManualClock::starting_at(test_epoch()));
        let supervisor = ContainerSupervisor::new(Arc::clone(&bmc) as Arc<dyn Bmc>, clock, 3);
        (supervisor, bmc, Ctx::for_player(PlayerId(1)))
    }

    fn worker_config(task_suffix: &str) -> ContainerConfig {
        ContainerConfig::TaskWorker(TaskWorkerConfig {
            task_id: fleet_domain::TaskId::generate(),
            ship_symbol: ShipSymbol(format!("SHIP-{}", task_suffix)),
            pipeline_id: None,
        })
    }

    fn coordinator_config() -> ContainerConfig {
        ContainerConfig::ContractWorkflow(ContractWorkflowConfig {
            system_symbol: SystemSymbol("X1-AU21".to_string()),
        })
    }

    async fn wait_for_status(bmc: &InMemoryBmc, ctx: &Ctx, id: &ContainerId, status: ContainerStatus) -> Container {
        for _ in 0..200 {
            if let Some(container) = bmc.container_bmc().get_container(ctx, id).await.unwrap() {
                if container.status == status {
                    return container;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("container {} never reached {:?}", id, status);
    }

    #[test(tokio::test)]
    async fn persist_start_stop_lifecycle() -> Result<()> {
        let (supervisor, bmc, ctx) = setup();
        supervisor.register_executor(ContainerType::ContractWorkflow, Arc::new(WaitForCancelExecutor));

        let id = supervisor
            .persist_container(&ctx, ContainerId("cw-1".to_string()), coordinator_config(), None, RestartPolicy::None)
            .await?;
        let pending = bmc.container_bmc().get_container(&ctx, &id).await?.unwrap();
        assert_eq!(pending.status, ContainerStatus::Pending);

        supervisor.start_container(&ctx, &id, None).await?;
        let running = bmc.container_bmc().get_container(&ctx, &id).await?.unwrap();
        assert_eq!(running.status, ContainerStatus::Running);

        // starting a non-PENDING container is refused
        assert!(supervisor.start_container(&ctx, &id, None).await.is_err());

        supervisor.stop_container(&ctx, &id).await?;
        let stopped = wait_for_status(&bmc, &ctx, &id, ContainerStatus::Stopped).await;
        assert_eq!(stopped.exit_reason.as_deref(), Some(exit_reason::STOPPED));
        // idempotent
        supervisor.stop_container(&ctx, &id).await?;
        Ok(())
    }

    #[test(tokio::test)]
    async fn recovery_reaps_workers_and_returns_ships_to_live_parent() -> Result<()> {
        let (supervisor, bmc, ctx) = setup();
        supervisor.register_executor(ContainerType::ContractWorkflow, Arc::new(WaitForCancelExecutor));

        // simulate pre-crash state: RUNNING coordinator with three RUNNING workers
        let coordinator_id = supervisor
            .persist_container(&ctx, ContainerId("coordinator".to_string()), coordinator_config(), None, RestartPolicy::None)
            .await?;
        bmc.container_bmc().mark_running(&ctx, &coordinator_id, test_epoch()).await?;

        let ledger = bmc.ship_assignment_bmc();
        for i in 1..=3 {
            let worker_id = supervisor
                .persist_container(
                    &ctx,
                    ContainerId(format!("worker-{}", i)),
                    worker_config(&i.to_string()),
                    Some(coordinator_id.clone()),
                    RestartPolicy::None,
                )
                .await?;
            bmc.container_bmc().mark_running(&ctx, &worker_id, test_epoch()).await?;
            ledger
                .assign(&ctx, &ShipSymbol(format!("SHIP-{}", i)), &worker_id, test_epoch())
                .await?;
        }

        let summary = supervisor.recover(&ctx).await?;
        assert_eq!(summary.workers_reaped, 3);
        assert_eq!(summary.coordinators_redispatched, 1);

        for i in 1..=3 {
            let worker = bmc
                .container_bmc()
                .get_container(&ctx, &ContainerId(format!("worker-{}", i)))
                .await?
                .unwrap();
            assert_eq!(worker.status, ContainerStatus::Stopped);
            assert_eq!(worker.exit_reason.as_deref(), Some(exit_reason::ORPHANED_BY_COORDINATOR_RESTART));
            assert_eq!(worker.exit_code, Some(1));

            let assignment = ledger.find_by_ship(&ctx, &ShipSymbol(format!("SHIP-{}", i))).await?.unwrap();
            assert_eq!(assignment.container_id, Some(coordinator_id.clone()), "ship back at the coordinator");
        }
        Ok(())
    }

    #[test(tokio::test)]
    async fn recovery_releases_ships_of_workers_without_live_parent() -> Result<()> {
        let (supervisor, bmc, ctx) = setup();

        let worker_id = supervisor
            .persist_container(&ctx, ContainerId("stray".to_string()), worker_config("9"), None, RestartPolicy::None)
            .await?;
        bmc.container_bmc().mark_running(&ctx, &worker_id, test_epoch()).await?;
        bmc.ship_assignment_bmc()
            .assign(&ctx, &ShipSymbol("SHIP-9".to_string()), &worker_id, test_epoch())
            .await?;

        supervisor.recover(&ctx).await?;

        assert!(bmc.ship_assignment_bmc().find_by_ship(&ctx, &ShipSymbol("SHIP-9".to_string())).await?.is_none());
        Ok(())
    }

    #[test(tokio::test)]
    async fn singleton_guard_refuses_second_contract_workflow() -> Result<()> {
        let (supervisor, _bmc, ctx) = setup();

        let first = supervisor.create_singleton(&ctx, coordinator_config(), RestartPolicy::OnFailure).await?;
        assert!(first.is_some());
        let second = supervisor.create_singleton(&ctx, coordinator_config(), RestartPolicy::OnFailure).await?;
        assert!(second.is_none());
        Ok(())
    }

    #[test(tokio::test)]
    async fn scoped_singleton_allows_one_gas_coordinator_per_gas_giant() -> Result<()> {
        let (supervisor, _bmc, ctx) = setup();
        let config = |giant: &str| {
            ContainerConfig::GasCoordinator(fleet_domain::GasCoordinatorConfig {
                system_symbol: SystemSymbol("X1-AU21".to_string()),
                gas_giant: WaypointSymbol(giant.to_string()),
            })
        };

        assert!(supervisor.create_scoped_singleton(&ctx, config("X1-AU21-G1"), RestartPolicy::None).await?.is_some());
        assert!(supervisor.create_scoped_singleton(&ctx, config("X1-AU21-G1"), RestartPolicy::None).await?.is_none());
        assert!(supervisor.create_scoped_singleton(&ctx, config("X1-AU21-G9"), RestartPolicy::None).await?.is_some());
        Ok(())
    }

    #[test(tokio::test)]
    async fn on_failure_policy_restarts_until_executor_succeeds() -> Result<()> {
        let (supervisor, bmc, ctx) = setup();
        supervisor.register_executor(
            ContainerType::ContractWorkflow,
            Arc::new(FlakyExecutor {
                failures: std::sync::atomic::AtomicI32::new(2),
            }),
        );

        let id = supervisor
            .persist_container(&ctx, ContainerId("flaky".to_string()), coordinator_config(), None, RestartPolicy::OnFailure)
            .await?;
        supervisor.start_container(&ctx, &id, None).await?;

        let stopped = wait_for_status(&bmc, &ctx, &id, ContainerStatus::Stopped).await;
        assert_eq!(stopped.exit_reason.as_deref(), Some(exit_reason::COMPLETED));
        assert_eq!(stopped.restart_count, 2);
        Ok(())
    }
}
