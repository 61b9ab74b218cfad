use crate::api_client::ApiClientTrait;
use crate::dedup_log::DedupLogSink;
use crate::factory_tracker::FactoryStateTracker;
use crate::readiness::ReadinessSnapshot;
use crate::routing::RoutingClientTrait;
use crate::storage_ops::StorageOperationsProvider;
use crate::supervisor::ContainerControl;
use crate::task_queue::TaskQueue;
use anyhow::Result;
use fleet_domain::{Clock, ContainerId, Pipeline, PipelineId, ShipSymbol, StorageOperationView, SystemSymbol, TaskId, Waypoint, WaypointSymbol};
use fleet_store::{Bmc, Ctx};
use std::collections::HashMap;
use std::sync::Arc;

pub mod assignment;
pub mod coordinator;
pub mod orphaned_cargo;
pub mod pipeline_planner;
pub mod pipelines;
pub mod recovery;
#[cfg(test)]
mod scenario_test;
pub mod worker;
pub mod workers;

pub use coordinator::ManufacturingCoordinator;
pub use worker::{ManufacturingTaskWorker, TaskCommandRunner, TaskOutcome};

/// Everything the coordinator's managers share. All long-lived services,
/// injected once at construction; no late setters.
pub struct CoordinatorServices {
    pub bmc: Arc<dyn Bmc>,
    pub api: Arc<dyn ApiClientTrait>,
    pub routing: Arc<dyn RoutingClientTrait>,
    pub control: Arc<dyn ContainerControl>,
    pub storage: Arc<dyn StorageOperationsProvider>,
    pub clock: Arc<dyn Clock>,
    pub log: Arc<DedupLogSink>,
}

impl std::fmt::Debug for CoordinatorServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorServices").finish()
    }
}

/// The coordinator's in-memory working set. Every field is a rebuildable
/// index over repository state; StateRecoveryManager reconstructs the whole
/// struct on start.
pub struct CoordinatorState {
    pub coordinator_id: ContainerId,
    pub system_symbol: SystemSymbol,
    pub queue: TaskQueue,
    pub active_pipelines: HashMap<PipelineId, Pipeline>,
    /// Tasks currently ASSIGNED/EXECUTING and the ship they hold.
    pub assigned: HashMap<TaskId, ShipSymbol>,
    pub waypoints: HashMap<WaypointSymbol, Waypoint>,
    pub storage_operations: HashMap<String, StorageOperationView>,
    pub factory_tracker: FactoryStateTracker,
}

/// Builds the snapshot readiness evaluation runs against. Used by state
/// recovery, the completion handler, and the rescue pass; the SupplyMonitor
/// builds its own from the same repositories.
pub async fn build_readiness_snapshot(services: &CoordinatorServices, ctx: &Ctx, state: &CoordinatorState) -> Result<ReadinessSnapshot> {
    let task_bmc = services.bmc.task_bmc();

    let mut snapshot = ReadinessSnapshot {
        dependencies: task_bmc.list_dependencies(ctx).await?,
        factory_states: state.factory_tracker.states(),
        storage_operations: state.storage_operations.clone(),
        ..Default::default()
    };

    for task in task_bmc.list_non_terminal(ctx).await? {
        snapshot.task_statuses.insert(task.id, task.status);
        if task.status.holds_ship() {
            if let Some(ship) = task.assigned_ship {
                snapshot.held_ships.insert(ship);
            }
        }
    }
    // dependency targets can already be terminal; fetch the stragglers
    let missing: Vec<TaskId> = snapshot
        .dependencies
        .iter()
        .map(|d| d.depends_on_id)
        .filter(|id| !snapshot.task_statuses.contains_key(id))
        .collect();
    for id in missing {
        if let Some(task) = task_bmc.get_task(ctx, &id).await? {
            snapshot.task_statuses.insert(task.id, task.status);
        }
    }

    for quote in services.bmc.market_bmc().list_all(ctx).await? {
        snapshot
            .market
            .insert((quote.waypoint_symbol.clone(), quote.good_symbol.clone()), quote);
    }
    Ok(snapshot)
}
