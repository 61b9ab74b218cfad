use crate::api_client::ContractInfo;
use crate::manufacturing::CoordinatorServices;
use crate::supervisor::{ContainerExecutor, ExecutionContext, WorkerCompletion};
use anyhow::{bail, Result};
use async_trait::async_trait;
use fleet_domain::{
    exit_reason, release_reason, ApiError, ContainerConfig, ContainerExit, ContainerId, ContractWorkerConfig, ContractWorkflowConfig, LedgerError,
    RestartPolicy, ShipSymbol,
};
use fleet_store::Ctx;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{event, Level};

/// The contract workflow: a singleton per player that negotiates (or adopts)
/// the active contract, fans deliveries out over a pool of haulers through
/// the standard ship-handoff protocol, and fulfills once everything is
/// delivered.
#[derive(Debug)]
pub struct ContractCoordinator {
    services: Arc<CoordinatorServices>,
}

impl ContractCoordinator {
    pub fn new(services: Arc<CoordinatorServices>) -> Self {
        Self { services }
    }

    /// Gets the contract to work: a fresh negotiation when possible, the
    /// already-active one when the upstream answers with code 4511.
    async fn ensure_contract(&self, negotiator: &ShipSymbol) -> Result<ContractInfo> {
        let contract = match self.services.api.negotiate_contract(negotiator).await {
            Ok(contract) => contract,
            Err(ApiError::AlreadyHasContract { contract_id }) => {
                event!(Level::INFO, contract = %contract_id, "adopting already-active contract");
                self.services.api.get_contract(&contract_id).await.map_err(anyhow::Error::from)?
            }
            Err(err) => return Err(err.into()),
        };

        if contract.accepted {
            return Ok(contract);
        }
        match self.services.api.accept_contract(&contract.id).await {
            Ok(accepted) => Ok(accepted),
            Err(ApiError::AlreadyHasContract { contract_id }) if contract_id == contract.id => Ok(contract),
            Err(err) => Err(err.into()),
        }
    }

    async fn spawn_delivery_worker(
        &self,
        ctx: &Ctx,
        coordinator_id: &ContainerId,
        contract: &ContractInfo,
        delivery: &crate::api_client::ContractDelivery,
        ship: &ShipSymbol,
        completion_tx: mpsc::Sender<WorkerCompletion>,
    ) -> Result<bool> {
        let control = &self.services.control;
        let ledger = self.services.bmc.ship_assignment_bmc();

        let source_market = self
            .services
            .bmc
            .market_bmc()
            .list_for_good(ctx, &delivery.trade_symbol)
            .await?
            .into_iter()
            .filter(|m| m.exports())
            .min_by_key(|m| m.purchase_price)
            .map(|m| m.waypoint_symbol);

        let worker_id = control
            .persist_container(
                ctx,
                ContainerId::generate("contract-worker"),
                ContainerConfig::ContractWorker(ContractWorkerConfig {
                    ship_symbol: ship.clone(),
                    contract_id: contract.id.clone(),
                    good: delivery.trade_symbol.clone(),
                    units: delivery.units_required - delivery.units_fulfilled,
                    source_market,
                    destination: delivery.destination_symbol.clone(),
                }),
                Some(coordinator_id.clone()),
                RestartPolicy::None,
            )
            .await?;

        match ledger.transfer(ctx, ship, coordinator_id, &worker_id).await {
            Ok(()) => {}
            Err(LedgerError::Other(err)) => return Err(err),
            Err(err) => {
                event!(Level::WARN, ship = %ship, error = %err, "contract handoff lost");
                control.stop_container(ctx, &worker_id).await?;
                return Ok(false);
            }
        }

        if let Err(err) = control.start_container(ctx, &worker_id, Some(completion_tx)).await {
            event!(Level::WARN, worker = %worker_id, error = %err, "contract worker start failed, restoring pool");
            if let Err(back) = ledger.transfer(ctx, ship, &worker_id, coordinator_id).await {
                event!(Level::ERROR, ship = %ship, error = %back, "rollback transfer failed");
            }
            control.stop_container(ctx, &worker_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn run(&self, exec: &ExecutionContext, _cfg: &ContractWorkflowConfig) -> Result<ContainerExit> {
        let ctx = exec.ctx;
        let coordinator_id = exec.container.id.clone();
        let ledger = self.services.bmc.ship_assignment_bmc();

        let pool = ledger.find_by_container(&ctx, &coordinator_id).await?;
        let Some(negotiator) = pool.iter().map(|a| a.ship_symbol.clone()).next() else {
            bail!("contract workflow {} has no ships in its pool", coordinator_id);
        };

        let mut contract = self.ensure_contract(&negotiator).await?;
        event!(Level::INFO, contract = %contract.id, deliveries = contract.deliveries.len(), "working contract");

        let (completion_tx, mut completion_rx) = mpsc::channel::<WorkerCompletion>(16);
        let mut dispatch_tick = tokio::time::interval(Duration::from_secs(10));
        dispatch_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                _ = exec.cancellation.cancelled() => break ContainerExit::success(exit_reason::STOPPED),

                _ = dispatch_tick.tick() => {
                    contract = self.services.api.get_contract(&contract.id).await.map_err(anyhow::Error::from)?;
                    if contract.fulfilled {
                        break ContainerExit::success(exit_reason::COMPLETED);
                    }
                    if contract.open_deliveries().next().is_none() {
                        self.services.api.fulfill_contract(&contract.id).await.map_err(anyhow::Error::from)?;
                        event!(Level::INFO, contract = %contract.id, "contract fulfilled");
                        break ContainerExit::success(exit_reason::COMPLETED);
                    }

                    let mut idle: Vec<ShipSymbol> = ledger
                        .find_by_container(&ctx, &coordinator_id)
                        .await?
                        .into_iter()
                        .map(|a| a.ship_symbol)
                        .filter(|s| !s.is_command_ship())
                        .collect();
                    for delivery in contract.deliveries.clone().iter().filter(|d| d.units_fulfilled < d.units_required) {
                        let Some(ship) = idle.pop() else { break };
                        if !self.spawn_delivery_worker(&ctx, &coordinator_id, &contract, delivery, &ship, completion_tx.clone()).await? {
                            idle.push(ship);
                        }
                    }
                }

                Some(completion) = completion_rx.recv() => {
                    if let Some(ship) = &completion.ship_symbol {
                        match ledger.transfer(&ctx, ship, &completion.container_id, &coordinator_id).await {
                            Ok(()) | Err(LedgerError::NotAssignedTo { .. }) | Err(LedgerError::NotFound { .. }) | Err(LedgerError::Conflict { .. }) => {}
                            Err(LedgerError::Other(err)) => return Err(err),
                        }
                    }
                }
            }
        };

        ledger
            .release_all_for_container(&ctx, &coordinator_id, release_reason::COORDINATOR_STOPPED, self.services.clock.now())
            .await?;
        Ok(exit)
    }
}

#[async_trait]
impl ContainerExecutor for ContractCoordinator {
    async fn execute(&self, exec: ExecutionContext) -> Result<ContainerExit> {
        let ContainerConfig::ContractWorkflow(cfg) = exec.container.config.clone() else {
            bail!("container {} does not carry a contract workflow config", exec.container.id);
        };
        self.run(&exec, &cfg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::{ContractDelivery, MockApiClientTrait};
    use crate::dedup_log::DedupLogSink;
    use crate::routing::MockRoutingClientTrait;
    use crate::storage_ops::NoStorageOperations;
    use crate::supervisor::{ContainerControl, ContainerSupervisor};
    use fleet_domain::test_fixtures::test_epoch;
    use fleet_domain::{Clock, ManualClock, PlayerId};
    use fleet_store::{Bmc, InMemoryBmc};
    use test_log::test;

    fn services(bmc: Arc<InMemoryBmc>, api: MockApiClientTrait) -> Arc<CoordinatorServices> {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_at(test_epoch()));
        let supervisor = ContainerSupervisor::new(Arc::clone(&bmc) as Arc<dyn Bmc>, Arc::clone(&clock), 3);
        let log = Arc::new(DedupLogSink::new(bmc.container_log_bmc(), Arc::clone(&clock), chrono::Duration::seconds(60), 10_000));
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

    fn accepted_contract(id: &str) -> ContractInfo {
        ContractInfo {
            id: id.to_string(),
            accepted: true,
            fulfilled: false,
            deliveries: vec![ContractDelivery {
                trade_symbol: "IRON".into(),
                destination_symbol: fleet_domain::WaypointSymbol("X1-AU21-D1".to_string()),
                units_required: 40,
                units_fulfilled: 0,
            }],
        }
    }

    #[test(tokio::test)]
    async fn code_4511_is_adopted_as_the_existing_contract() -> Result<()> {
        let bmc = Arc::new(InMemoryBmc::new());
        let mut api = MockApiClientTrait::new();
        api.expect_negotiate_contract().times(1).returning(|_| {
            Err(ApiError::AlreadyHasContract {
                contract_id: "contract-7".to_string(),
            })
        });
        api.expect_get_contract()
            .times(1)
            .returning(|id| Ok(accepted_contract(id)));

        let coordinator = ContractCoordinator::new(services(bmc, api));
        let contract = coordinator.ensure_contract(&ShipSymbol("AGENT-2".to_string())).await?;
        assert_eq!(contract.id, "contract-7");
        assert!(contract.accepted);
        Ok(())
    }

    #[test(tokio::test)]
    async fn fresh_contract_is_accepted_when_needed() -> Result<()> {
        let bmc = Arc::new(InMemoryBmc::new());
        let mut api = MockApiClientTrait::new();
        api.expect_negotiate_contract().times(1).returning(|_| {
            Ok(ContractInfo {
                accepted: false,
                ..accepted_contract("contract-8")
            })
        });
        api.expect_accept_contract()
            .times(1)
            .returning(|id| Ok(accepted_contract(id)));

        let coordinator = ContractCoordinator::new(services(bmc, api));
        let contract = coordinator.ensure_contract(&ShipSymbol("AGENT-2".to_string())).await?;
        assert_eq!(contract.id, "contract-8");
        assert!(contract.accepted);
        Ok(())
    }
}
