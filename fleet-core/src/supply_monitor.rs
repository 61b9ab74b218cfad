use crate::api_client::ApiClientTrait;
use crate::readiness::{evaluate, Readiness, ReadinessSnapshot};
use crate::storage_ops::StorageOperationsProvider;
use anyhow::Result;
use fleet_domain::{Clock, TaskStatus, WaypointSymbol};
use fleet_store::{Bmc, Ctx};
use itertools::Itertools;
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

/// Polls the markets referenced by live tasks, refreshes `market_data` and
/// moves tasks between PENDING and READY as their market-observable
/// preconditions change. Runs beside the coordinator loop and communicates
/// only through repository writes plus a one-slot signal channel.
pub struct SupplyMonitor {
    bmc: Arc<dyn Bmc>,
    api: Arc<dyn ApiClientTrait>,
    storage: Arc<dyn StorageOperationsProvider>,
    clock: Arc<dyn Clock>,
    task_ready_tx: mpsc::Sender<()>,
    poll_interval: Duration,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub promoted: usize,
    pub demoted: usize,
}

impl SupplyMonitor {
    pub fn new(
        bmc: Arc<dyn Bmc>,
        api: Arc<dyn ApiClientTrait>,
        storage: Arc<dyn StorageOperationsProvider>,
        clock: Arc<dyn Clock>,
        task_ready_tx: mpsc::Sender<()>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            bmc,
            api,
            storage,
            clock,
            task_ready_tx,
            poll_interval,
        }
    }

    pub async fn run(self, ctx: Ctx, cancellation: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once(&ctx).await {
                        event!(Level::WARN, error = %err, "supply poll failed");
                    }
                }
            }
        }
    }

    pub async fn poll_once(&self, ctx: &Ctx) -> Result<PollOutcome> {
        let task_bmc = self.bmc.task_bmc();
        let tasks = task_bmc.list_non_terminal(ctx).await?;
        if tasks.is_empty() {
            return Ok(PollOutcome::default());
        }

        // refresh every market a live task looks at
        let waypoints: Vec<WaypointSymbol> = tasks
            .iter()
            .flat_map(|t| [t.source_market.clone(), t.factory.clone()])
            .flatten()
            .unique()
            .collect();
        let now = self.clock.now();
        let responses = futures::future::join_all(waypoints.iter().map(|wp| self.api.get_market(wp))).await;
        for (waypoint, response) in waypoints.iter().zip(responses) {
            match response {
                Ok(mut quotes) => {
                    for quote in &mut quotes {
                        quote.last_updated = now;
                        quote.player_id = ctx.player_id();
                    }
                    self.bmc.market_bmc().upsert_quotes(ctx, &quotes).await?;
                }
                Err(err) => {
                    event!(Level::WARN, waypoint = %waypoint, error = %err, "market refresh failed");
                }
            }
        }

        let snapshot = self.build_snapshot(ctx).await?;
        let mut outcome = PollOutcome::default();
        for task in &tasks {
            match (task.status, evaluate(task, &snapshot)) {
                (TaskStatus::Pending, Readiness::Ready) => {
                    task_bmc.update_status(ctx, &task.id, TaskStatus::Ready, now).await?;
                    outcome.promoted += 1;
                }
                (TaskStatus::Ready, Readiness::Blocked(reason)) => {
                    event!(Level::INFO, task = %task.id, ?reason, "market moved, demoting READY task");
                    task_bmc.update_status(ctx, &task.id, TaskStatus::Pending, now).await?;
                    outcome.demoted += 1;
                }
                _ => {}
            }
        }

        if outcome.promoted > 0 {
            counter!("fleet_tasks_promoted_total").increment(outcome.promoted as u64);
            // one-slot channel; losing the race is fine, the idle-ship tick
            // picks the change up within ten seconds
            let _ = self.task_ready_tx.try_send(());
        }
        Ok(outcome)
    }

    async fn build_snapshot(&self, ctx: &Ctx) -> Result<ReadinessSnapshot> {
        let task_bmc = self.bmc.task_bmc();
        let mut snapshot = ReadinessSnapshot {
            dependencies: task_bmc.list_dependencies(ctx).await?,
            factory_states: self.bmc.factory_state_bmc().list_for_player(ctx).await?,
            storage_operations: self
                .storage
                .list_operations(ctx)
                .await?
                .into_iter()
                .map(|op| (op.id.clone(), op))
                .collect::<HashMap<_, _>>(),
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
        let missing: Vec<_> = snapshot
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
        for quote in self.bmc.market_bmc().list_all(ctx).await? {
            snapshot
                .market
                .insert((quote.waypoint_symbol.clone(), quote.good_symbol.clone()), quote);
        }
        Ok(snapshot)
    }
}
