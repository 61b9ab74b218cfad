use crate::manufacturing::workers::WorkerLifecycleManager;
use crate::manufacturing::{build_readiness_snapshot, CoordinatorServices, CoordinatorState};
use crate::readiness::{evaluate, Readiness};
use crate::supervisor::CompletionSender;
use anyhow::Result;
use fleet_domain::{ManufacturingCoordinatorConfig, PipelineStatus, ShipRole, ShipSnapshot, Task, TaskStatus, TaskType, Waypoint};
use fleet_store::Ctx;
use itertools::Itertools;
use metrics::{counter, gauge};
use std::sync::Arc;
use tracing::{event, Level};

/// Matches READY tasks to idle ships under the concurrency cap, reserving
/// ships through the ledger and spawning one worker container per match.
pub struct TaskAssignmentManager {
    services: Arc<CoordinatorServices>,
    workers: WorkerLifecycleManager,
}

impl TaskAssignmentManager {
    pub fn new(services: Arc<CoordinatorServices>) -> Self {
        Self {
            workers: WorkerLifecycleManager::new(Arc::clone(&services)),
            services,
        }
    }

    /// One assignment pass. Returns the number of workers started.
    pub async fn assign_tasks(
        &self,
        ctx: &Ctx,
        cfg: &ManufacturingCoordinatorConfig,
        state: &mut CoordinatorState,
        completion_tx: &CompletionSender,
    ) -> Result<usize> {
        self.reconcile(ctx, state).await?;

        let active = state.assigned.len();
        gauge!("fleet_tasks_in_flight").set(active as f64);
        if active >= cfg.max_concurrent_tasks {
            return Ok(0);
        }
        let mut capacity = cfg.max_concurrent_tasks - active;

        let mut idle_ships = self.eligible_idle_ships(ctx, state).await?;
        if idle_ships.is_empty() {
            return Ok(0);
        }

        let mut started = 0;
        for task_id in state.queue.ordered_ids() {
            if capacity == 0 || idle_ships.is_empty() {
                break;
            }
            let Some(task) = self.services.bmc.task_bmc().get_task(ctx, &task_id).await? else {
                continue;
            };
            if task.status != TaskStatus::Ready {
                state.queue.remove(&task);
                continue;
            }

            let target = task.required_waypoint().and_then(|wp| state.waypoints.get(wp));
            let Some(selected) = ShipSelector::select(&task, target, &idle_ships) else {
                // no eligible ship right now; the task stays READY in the queue
                continue;
            };
            let ship = selected.symbol.clone();

            match self.workers.spawn_for_task(ctx, state, &task, &ship, completion_tx.clone()).await? {
                true => {
                    idle_ships.retain(|s| s.symbol != ship);
                    state.queue.remove(&task);
                    state.assigned.insert(task.id, ship);
                    if let Some(pipeline_id) = task.pipeline_id {
                        self.mark_pipeline_executing(ctx, state, pipeline_id).await?;
                    }
                    capacity -= 1;
                    started += 1;
                    counter!("fleet_tasks_assigned_total").increment(1);
                }
                false => {
                    // handoff failed and was rolled back; drop the ship from
                    // this pass and leave the task READY
                    idle_ships.retain(|s| s.symbol != ship);
                }
            }
        }
        Ok(started)
    }

    /// Drift reconciliation: the repository's view of ASSIGNED/EXECUTING
    /// tasks wins over the in-memory tracker. A task whose ship is back at
    /// the coordinator lost its worker and goes back to READY.
    pub async fn reconcile(&self, ctx: &Ctx, state: &mut CoordinatorState) -> Result<()> {
        let holding = self.services.bmc.task_bmc().list_holding_ships(ctx).await?;
        state.assigned.clear();

        for task in holding {
            let Some(ship) = task.assigned_ship.clone() else {
                self.services
                    .bmc
                    .task_bmc()
                    .clear_assignment(ctx, &task.id, TaskStatus::Ready, self.services.clock.now())
                    .await?;
                continue;
            };
            let owner = self.services.bmc.ship_assignment_bmc().find_by_ship(ctx, &ship).await?;
            let owned_by_coordinator = owner
                .as_ref()
                .map(|a| a.is_owned_by(&state.coordinator_id))
                .unwrap_or(false);
            if owned_by_coordinator {
                event!(Level::WARN, task = %task.id, ship = %ship, "worker lost mid-flight, returning task to READY");
                self.services
                    .bmc
                    .task_bmc()
                    .update_status(ctx, &task.id, TaskStatus::Ready, self.services.clock.now())
                    .await?;
                if let Some(task) = self.services.bmc.task_bmc().get_task(ctx, &task.id).await? {
                    state.queue.push(&task);
                }
            } else {
                state.assigned.insert(task.id, ship);
            }
        }
        Ok(())
    }

    /// The rescue routine of the idle tick: READY collect-and-sell tasks are
    /// re-checked against current market state and demoted when the world
    /// moved under them.
    pub async fn rescue_ready_collect_sells(&self, ctx: &Ctx, state: &mut CoordinatorState) -> Result<usize> {
        let snapshot = build_readiness_snapshot(&self.services, ctx, state).await?;
        let ready = self.services.bmc.task_bmc().list_by_status(ctx, TaskStatus::Ready).await?;
        let mut demoted = 0;
        for task in ready.into_iter().filter(|t| t.task_type == TaskType::CollectSell) {
            if let Readiness::Blocked(reason) = evaluate(&task, &snapshot) {
                event!(Level::INFO, task = %task.id, ?reason, "demoting READY task, market moved");
                self.services
                    .bmc
                    .task_bmc()
                    .update_status(ctx, &task.id, TaskStatus::Pending, self.services.clock.now())
                    .await?;
                state.queue.remove(&task);
                demoted += 1;
            }
        }
        Ok(demoted)
    }

    /// Ships owned by the coordinator, not in transit, not the command ship
    /// and not already reserved by this pass.
    async fn eligible_idle_ships(&self, ctx: &Ctx, state: &CoordinatorState) -> Result<Vec<ShipSnapshot>> {
        let assignments = self
            .services
            .bmc
            .ship_assignment_bmc()
            .find_by_container(ctx, &state.coordinator_id)
            .await?;
        let reserved: Vec<_> = state.assigned.values().cloned().collect();

        let mut ships = Vec::new();
        for assignment in assignments {
            if assignment.ship_symbol.is_command_ship() || reserved.contains(&assignment.ship_symbol) {
                continue;
            }
            match self.services.api.get_ship(&assignment.ship_symbol).await {
                Ok(snapshot) if !snapshot.is_in_transit() => ships.push(snapshot),
                Ok(_) => {}
                Err(err) => {
                    event!(Level::WARN, ship = %assignment.ship_symbol, error = %err, "ship lookup failed, skipping");
                }
            }
        }
        Ok(ships)
    }

    async fn mark_pipeline_executing(&self, ctx: &Ctx, state: &mut CoordinatorState, pipeline_id: fleet_domain::PipelineId) -> Result<()> {
        let Some(pipeline) = state.active_pipelines.get_mut(&pipeline_id) else {
            return Ok(());
        };
        if pipeline.status == PipelineStatus::Planning {
            self.services
                .bmc
                .pipeline_bmc()
                .update_status(ctx, &pipeline_id, PipelineStatus::Executing, None, self.services.clock.now())
                .await?;
            pipeline.status = PipelineStatus::Executing;
        }
        Ok(())
    }
}

/// Picks the best ship for a task: a ship already holding the task's good
/// wins absolutely, otherwise minimum Euclidean distance to the target
/// waypoint; ties break on the ship symbol. Haulers beat other roles within
/// each band.
pub struct ShipSelector;

impl ShipSelector {
    pub fn select<'a>(task: &Task, target: Option<&Waypoint>, candidates: &'a [ShipSnapshot]) -> Option<&'a ShipSnapshot> {
        // capacity must fit the batch, unless the ship already holds the good
        let fitting = candidates
            .iter()
            .filter(|s| s.cargo.capacity >= task.target_units || s.cargo.units_of(&task.good) > 0)
            .collect_vec();

        // holding the required cargo wins absolutely
        if let Some(holder) = fitting
            .iter()
            .filter(|s| s.cargo.units_of(&task.good) > 0)
            .sorted_by_key(|s| (-(s.cargo.units_of(&task.good) as i64), s.symbol.clone()))
            .next()
        {
            return Some(*holder);
        }

        fitting
            .into_iter()
            .min_by_key(|s| {
                let role_rank = if s.role == ShipRole::Hauler { 0 } else { 1 };
                let distance = target
                    .map(|wp| fleet_domain::distance_to(s.x, s.y, wp.x, wp.y))
                    .unwrap_or(u32::MAX);
                (role_rank, distance, s.symbol.clone())
            })
    }
}
