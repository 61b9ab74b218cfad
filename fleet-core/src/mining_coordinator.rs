use crate::manufacturing::CoordinatorServices;
use crate::supervisor::{ContainerExecutor, ExecutionContext, WorkerCompletion};
use anyhow::{bail, Result};
use async_trait::async_trait;
use fleet_domain::{
    exit_reason, release_reason, Cargo, ContainerConfig, ContainerExit, ContainerId, LedgerError, MiningCoordinatorConfig, MiningTransportConfig,
    RestartPolicy, ShipSymbol, TradeGoodSymbol, WaypointSymbol,
};
use fleet_store::Ctx;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::{event, Level};

/// One completed miner-to-transport transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CargoTransfer {
    pub from: ShipSymbol,
    pub to: ShipSymbol,
    pub good: TradeGoodSymbol,
    pub units: i32,
}

#[derive(Debug, Clone)]
struct TransportSlot {
    capacity: i32,
    loaded: i32,
    cargo_received_tx: mpsc::Sender<CargoTransfer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSummary {
    pub ship: ShipSymbol,
    pub loaded_units: i32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum OfferOutcome {
    NoTransportWaiting,
    Transferred(Vec<CargoTransfer>),
}

/// Transport-as-sink handshake between miner workers and transport workers.
/// Directional by construction: transports park and wait for their
/// cargo-received channel, miners push whenever a transport is at their
/// waypoint. The coordinator loop itself never blocks on either side.
#[derive(Debug, Default)]
pub struct CargoHandoff {
    waiting_transports: Arc<Mutex<HashMap<WaypointSymbol, HashMap<ShipSymbol, TransportSlot>>>>,
}

impl CargoHandoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks a transport at `waypoint` until it is at least `fill_ratio`
    /// full, then hands back the load summary. Each received transfer is
    /// also echoed on `cargo_received_tx` so the transport worker can update
    /// its own ship state.
    pub async fn register_transport_and_wait(
        &self,
        waypoint: WaypointSymbol,
        ship: ShipSymbol,
        cargo: &Cargo,
        fill_ratio: f64,
        cargo_received_tx: mpsc::Sender<CargoTransfer>,
    ) -> Result<TransportSummary> {
        {
            let mut guard = self.waiting_transports.lock().await;
            guard.entry(waypoint.clone()).or_default().insert(
                ship.clone(),
                TransportSlot {
                    capacity: cargo.capacity,
                    loaded: cargo.units,
                    cargo_received_tx,
                },
            );
        }

        let summary = loop {
            {
                let mut guard = self.waiting_transports.lock().await;
                if let Some(slot) = guard.get(&waypoint).and_then(|ships| ships.get(&ship)) {
                    if slot.loaded as f64 >= slot.capacity as f64 * fill_ratio {
                        let loaded = slot.loaded;
                        guard.get_mut(&waypoint).and_then(|ships| ships.remove(&ship));
                        break TransportSummary {
                            ship: ship.clone(),
                            loaded_units: loaded,
                        };
                    }
                }
            }
            // guard dropped before sleeping so miners can keep loading
            tokio::time::sleep(Duration::from_millis(100)).await;
        };
        Ok(summary)
    }

    /// Offers a miner's cargo to whichever transports wait at the waypoint.
    /// `execute_transfer` performs the actual upstream transfer call; the
    /// handoff only does the matchmaking and bookkeeping.
    pub async fn offer_cargo<F, Fut>(&self, waypoint: &WaypointSymbol, miner: &ShipSymbol, cargo: &Cargo, execute_transfer: F) -> Result<OfferOutcome>
    where
        F: Fn(CargoTransfer) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut guard = self.waiting_transports.lock().await;
        let Some(slots) = guard.get_mut(waypoint) else {
            return Ok(OfferOutcome::NoTransportWaiting);
        };
        if slots.is_empty() {
            return Ok(OfferOutcome::NoTransportWaiting);
        }

        let mut transfers = Vec::new();
        for item in &cargo.inventory {
            let mut remaining = item.units;
            for (transport_ship, slot) in slots.iter_mut() {
                if remaining == 0 {
                    break;
                }
                let space = slot.capacity - slot.loaded;
                if space <= 0 {
                    continue;
                }
                let units = remaining.min(space);
                let transfer = CargoTransfer {
                    from: miner.clone(),
                    to: transport_ship.clone(),
                    good: item.symbol.clone(),
                    units,
                };
                execute_transfer(transfer.clone()).await?;
                slot.loaded += units;
                remaining -= units;
                if slot.cargo_received_tx.send(transfer.clone()).await.is_err() {
                    event!(Level::WARN, transport = %transport_ship, "transport dropped its cargo channel");
                }
                transfers.push(transfer);
            }
        }

        if transfers.is_empty() {
            Ok(OfferOutcome::NoTransportWaiting)
        } else {
            Ok(OfferOutcome::Transferred(transfers))
        }
    }
}

/// Thin coordinator for the mining loop: keeps one transport worker per
/// owned transport ship running against the configured site, reclaiming
/// ships through the ledger as workers finish. Extraction behavior itself is
/// command-level and lives in the workers.
#[derive(Debug)]
pub struct MiningCoordinator {
    services: Arc<CoordinatorServices>,
    pub handoff: Arc<CargoHandoff>,
}

impl MiningCoordinator {
    pub fn new(services: Arc<CoordinatorServices>) -> Self {
        Self {
            services,
            handoff: Arc::new(CargoHandoff::new()),
        }
    }

    async fn spawn_transport_worker(
        &self,
        ctx: &Ctx,
        coordinator_id: &ContainerId,
        cfg: &MiningCoordinatorConfig,
        ship: &ShipSymbol,
        completion_tx: mpsc::Sender<WorkerCompletion>,
    ) -> Result<bool> {
        let control = &self.services.control;
        let ledger = self.services.bmc.ship_assignment_bmc();

        let worker_id = control
            .persist_container(
                ctx,
                ContainerId::generate("mining-transport"),
                ContainerConfig::MiningTransport(MiningTransportConfig {
                    ship_symbol: ship.clone(),
                    mining_site: cfg.mining_site.clone(),
                    sell_market: cfg.sell_market.clone(),
                }),
                Some(coordinator_id.clone()),
                RestartPolicy::None,
            )
            .await?;

        match ledger.transfer(ctx, ship, coordinator_id, &worker_id).await {
            Ok(()) => {}
            Err(LedgerError::Other(err)) => return Err(err),
            Err(err) => {
                event!(Level::WARN, ship = %ship, error = %err, "transport handoff lost");
                control.stop_container(ctx, &worker_id).await?;
                return Ok(false);
            }
        }

        if let Err(err) = control.start_container(ctx, &worker_id, Some(completion_tx)).await {
            event!(Level::WARN, worker = %worker_id, error = %err, "transport start failed, restoring pool");
            if let Err(back) = ledger.transfer(ctx, ship, &worker_id, coordinator_id).await {
                event!(Level::ERROR, ship = %ship, error = %back, "rollback transfer failed");
            }
            control.stop_container(ctx, &worker_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn run(&self, exec: &ExecutionContext, cfg: &MiningCoordinatorConfig) -> Result<()> {
        let ctx = exec.ctx;
        let coordinator_id = exec.container.id.clone();
        let ledger = self.services.bmc.ship_assignment_bmc();
        let (completion_tx, mut completion_rx) = mpsc::channel::<WorkerCompletion>(16);

        let mut respawn_tick = tokio::time::interval(Duration::from_secs(15));
        respawn_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = exec.cancellation.cancelled() => break,

                _ = respawn_tick.tick() => {
                    // every owned transport ship that sits in the pool gets a worker
                    for assignment in ledger.find_by_container(&ctx, &coordinator_id).await? {
                        let ship = assignment.ship_symbol.clone();
                        if ship.is_command_ship() {
                            continue;
                        }
                        match self.services.api.get_ship(&ship).await {
                            Ok(snapshot) if snapshot.role == fleet_domain::ShipRole::Transport || snapshot.role == fleet_domain::ShipRole::Hauler => {
                                if !snapshot.is_in_transit() {
                                    self.spawn_transport_worker(&ctx, &coordinator_id, cfg, &ship, completion_tx.clone()).await?;
                                }
                            }
                            Ok(_) => {}
                            Err(err) => event!(Level::WARN, ship = %ship, error = %err, "ship lookup failed"),
                        }
                    }
                }

                Some(completion) = completion_rx.recv() => {
                    if let Some(ship) = &completion.ship_symbol {
                        match ledger.transfer(&ctx, ship, &completion.container_id, &coordinator_id).await {
                            Ok(()) | Err(LedgerError::NotAssignedTo { .. }) | Err(LedgerError::NotFound { .. }) => {}
                            Err(LedgerError::Conflict { .. }) => {}
                            Err(LedgerError::Other(err)) => return Err(err),
                        }
                    }
                }
            }
        }

        ledger
            .release_all_for_container(&ctx, &coordinator_id, release_reason::COORDINATOR_STOPPED, self.services.clock.now())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ContainerExecutor for MiningCoordinator {
    async fn execute(&self, exec: ExecutionContext) -> Result<ContainerExit> {
        let ContainerConfig::MiningCoordinator(cfg) = exec.container.config.clone() else {
            bail!("container {} does not carry a mining coordinator config", exec.container.id);
        };
        self.run(&exec, &cfg).await?;
        Ok(ContainerExit::success(exit_reason::STOPPED))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_domain::CargoItem;
    use test_log::test;

    fn cargo(units: i32, capacity: i32, good: &str) -> Cargo {
        Cargo {
            capacity,
            units,
            inventory: vec![CargoItem {
                symbol: good.into(),
                units,
            }],
        }
    }

    #[test(tokio::test)]
    async fn miner_offer_with_no_transport_is_declined() -> Result<()> {
        let handoff = CargoHandoff::new();
        let outcome = handoff
            .offer_cargo(
                &WaypointSymbol("X1-AU21-M1".to_string()),
                &ShipSymbol("MINER-1".to_string()),
                &cargo(20, 30, "IRON_ORE"),
                |_| async { Ok(()) },
            )
            .await?;
        assert_eq!(outcome, OfferOutcome::NoTransportWaiting);
        Ok(())
    }

    #[test(tokio::test)]
    async fn transport_fills_from_miner_offers_and_returns() -> Result<()> {
        let handoff = Arc::new(CargoHandoff::new());
        let waypoint = WaypointSymbol("X1-AU21-M1".to_string());
        let transport_ship = ShipSymbol("HAULER-1".to_string());
        let (cargo_received_tx, mut cargo_received_rx) = mpsc::channel(16);

        let waiting = {
            let handoff = Arc::clone(&handoff);
            let waypoint = waypoint.clone();
            let transport_ship = transport_ship.clone();
            tokio::spawn(async move {
                handoff
                    .register_transport_and_wait(waypoint, transport_ship, &Cargo::empty(60), 0.8, cargo_received_tx)
                    .await
            })
        };

        // let the transport park first
        tokio::time::sleep(Duration::from_millis(50)).await;

        // two miner loads: 30 + 20 = 50 units >= 80% of 60
        for load in [30, 20] {
            let outcome = handoff
                .offer_cargo(&waypoint, &ShipSymbol("MINER-1".to_string()), &cargo(load, 30, "IRON_ORE"), |_| async { Ok(()) })
                .await?;
            match outcome {
                OfferOutcome::Transferred(transfers) => {
                    assert_eq!(transfers.len(), 1);
                    assert_eq!(transfers[0].units, load);
                    assert_eq!(transfers[0].to, transport_ship);
                }
                OfferOutcome::NoTransportWaiting => panic!("transport should be parked"),
            }
        }

        let summary = waiting.await??;
        assert_eq!(summary.loaded_units, 50);

        // the transport's cargo channel saw both transfers
        assert_eq!(cargo_received_rx.recv().await.unwrap().units, 30);
        assert_eq!(cargo_received_rx.recv().await.unwrap().units, 20);

        // once collected, the slot is gone
        let after = handoff
            .offer_cargo(&waypoint, &ShipSymbol("MINER-1".to_string()), &cargo(10, 30, "IRON_ORE"), |_| async { Ok(()) })
            .await?;
        assert_eq!(after, OfferOutcome::NoTransportWaiting);
        Ok(())
    }
}
