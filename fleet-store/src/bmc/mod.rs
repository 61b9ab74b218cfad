use crate::DbModelManager;
use mockall::automock;
use std::fmt::Debug;
use std::sync::Arc;

pub mod container_bmc;
pub mod container_log_bmc;
pub mod factory_state_bmc;
pub mod market_bmc;
pub mod pipeline_bmc;
pub mod ship_assignment_bmc;
pub mod task_bmc;

pub use container_bmc::*;
pub use container_log_bmc::*;
pub use factory_state_bmc::*;
pub use market_bmc::*;
pub use pipeline_bmc::*;
pub use ship_assignment_bmc::*;
pub use task_bmc::*;

#[automock]
pub trait Bmc: Send + Sync + Debug {
    fn container_bmc(&self) -> Arc<dyn ContainerBmcTrait>;
    fn ship_assignment_bmc(&self) -> Arc<dyn ShipAssignmentBmcTrait>;
    fn container_log_bmc(&self) -> Arc<dyn ContainerLogBmcTrait>;
    fn pipeline_bmc(&self) -> Arc<dyn PipelineBmcTrait>;
    fn task_bmc(&self) -> Arc<dyn TaskBmcTrait>;
    fn factory_state_bmc(&self) -> Arc<dyn FactoryStateBmcTrait>;
    fn market_bmc(&self) -> Arc<dyn MarketBmcTrait>;
}

#[derive(Debug, Clone)]
pub struct DbBmc {
    pub db_model_manager: DbModelManager,
    container_bmc: Arc<DbContainerBmc>,
    ship_assignment_bmc: Arc<DbShipAssignmentBmc>,
    container_log_bmc: Arc<DbContainerLogBmc>,
    pipeline_bmc: Arc<DbPipelineBmc>,
    task_bmc: Arc<DbTaskBmc>,
    factory_state_bmc: Arc<DbFactoryStateBmc>,
    market_bmc: Arc<DbMarketBmc>,
}

impl DbBmc {
    pub fn new(mm: DbModelManager) -> Self {
        Self {
            db_model_manager: mm.clone(),
            container_bmc: Arc::new(DbContainerBmc { mm: mm.clone() }),
            ship_assignment_bmc: Arc::new(DbShipAssignmentBmc { mm: mm.clone() }),
            container_log_bmc: Arc::new(DbContainerLogBmc { mm: mm.clone() }),
            pipeline_bmc: Arc::new(DbPipelineBmc { mm: mm.clone() }),
            task_bmc: Arc::new(DbTaskBmc { mm: mm.clone() }),
            factory_state_bmc: Arc::new(DbFactoryStateBmc { mm: mm.clone() }),
            market_bmc: Arc::new(DbMarketBmc { mm: mm.clone() }),
        }
    }
}

impl Bmc for DbBmc {
    fn container_bmc(&self) -> Arc<dyn ContainerBmcTrait> {
        self.container_bmc.clone() as Arc<dyn ContainerBmcTrait>
    }

    fn ship_assignment_bmc(&self) -> Arc<dyn ShipAssignmentBmcTrait> {
        self.ship_assignment_bmc.clone() as Arc<dyn ShipAssignmentBmcTrait>
    }

    fn container_log_bmc(&self) -> Arc<dyn ContainerLogBmcTrait> {
        self.container_log_bmc.clone() as Arc<dyn ContainerLogBmcTrait>
    }

    fn pipeline_bmc(&self) -> Arc<dyn PipelineBmcTrait> {
        self.pipeline_bmc.clone() as Arc<dyn PipelineBmcTrait>
    }

    fn task_bmc(&self) -> Arc<dyn TaskBmcTrait> {
        self.task_bmc.clone() as Arc<dyn TaskBmcTrait>
    }

    fn factory_state_bmc(&self) -> Arc<dyn FactoryStateBmcTrait> {
        self.factory_state_bmc.clone() as Arc<dyn FactoryStateBmcTrait>
    }

    fn market_bmc(&self) -> Arc<dyn MarketBmcTrait> {
        self.market_bmc.clone() as Arc<dyn MarketBmcTrait>
    }
}

#[derive(Debug)]
pub struct InMemoryBmc {
    pub in_mem_container_bmc: Arc<InMemoryContainerBmc>,
    pub in_mem_ship_assignment_bmc: Arc<InMemoryShipAssignmentBmc>,
    pub in_mem_container_log_bmc: Arc<InMemoryContainerLogBmc>,
    pub in_mem_pipeline_bmc: Arc<InMemoryPipelineBmc>,
    pub in_mem_task_bmc: Arc<InMemoryTaskBmc>,
    pub in_mem_factory_state_bmc: Arc<InMemoryFactoryStateBmc>,
    pub in_mem_market_bmc: Arc<InMemoryMarketBmc>,
}

impl Default for InMemoryBmc {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBmc {
    pub fn new() -> Self {
        Self {
            in_mem_container_bmc: Arc::new(InMemoryContainerBmc::new()),
            in_mem_ship_assignment_bmc: Arc::new(InMemoryShipAssignmentBmc::new()),
            in_mem_container_log_bmc: Arc::new(InMemoryContainerLogBmc::new()),
            in_mem_pipeline_bmc: Arc::new(InMemoryPipelineBmc::new()),
            in_mem_task_bmc: Arc::new(InMemoryTaskBmc::new()),
            in_mem_factory_state_bmc: Arc::new(InMemoryFactoryStateBmc::new()),
            in_mem_market_bmc: Arc::new(InMemoryMarketBmc::new()),
        }
    }
}

impl Bmc for InMemoryBmc {
    fn container_bmc(&self) -> Arc<dyn ContainerBmcTrait> {
        Arc::clone(&self.in_mem_container_bmc) as Arc<dyn ContainerBmcTrait>
    }

    fn ship_assignment_bmc(&self) -> Arc<dyn ShipAssignmentBmcTrait> {
        Arc::clone(&self.in_mem_ship_assignment_bmc) as Arc<dyn ShipAssignmentBmcTrait>
    }

    fn container_log_bmc(&self) -> Arc<dyn ContainerLogBmcTrait> {
        Arc::clone(&self.in_mem_container_log_bmc) as Arc<dyn ContainerLogBmcTrait>
    }

    fn pipeline_bmc(&self) -> Arc<dyn PipelineBmcTrait> {
        Arc::clone(&self.in_mem_pipeline_bmc) as Arc<dyn PipelineBmcTrait>
    }

    fn task_bmc(&self) -> Arc<dyn TaskBmcTrait> {
        Arc::clone(&self.in_mem_task_bmc) as Arc<dyn TaskBmcTrait>
    }

    fn factory_state_bmc(&self) -> Arc<dyn FactoryStateBmcTrait> {
        Arc::clone(&self.in_mem_factory_state_bmc) as Arc<dyn FactoryStateBmcTrait>
    }

    fn market_bmc(&self) -> Arc<dyn MarketBmcTrait> {
        Arc::clone(&self.in_mem_market_bmc) as Arc<dyn MarketBmcTrait>
    }
}
