use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use fleet_domain::{
    chain_depth, resolve_input_chain, AcquisitionStrategy, FactoryState, MarketData, Pipeline, PipelineId, PipelineStatus, PipelineType, PlayerId,
    StorageOperationView, SupplyLevel, Task, TaskDependency, TaskId, TaskStatus, TaskType, TradeGoodSymbol, WaypointSymbol,
};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use std::collections::HashMap;

pub struct PlannerInputs<'a> {
    pub player: PlayerId,
    pub product: TradeGoodSymbol,
    /// Export market of the product; the factory the pipeline feeds.
    pub factory_market: WaypointSymbol,
    pub sell_market: WaypointSymbol,
    pub expected_unit_price: i64,
    pub relations: &'a HashMap<TradeGoodSymbol, Vec<TradeGoodSymbol>>,
    pub market: &'a HashMap<(WaypointSymbol, TradeGoodSymbol), MarketData>,
    pub storage_operations: &'a HashMap<String, StorageOperationView>,
    pub strategy: AcquisitionStrategy,
    /// Units moved per task; sized to hauler capacity by the caller.
    pub unit_batch: i32,
    pub max_concurrent_workers: i32,
    pub now: DateTime<Utc>,
}

#[derive(Debug)]
pub struct PipelinePlan {
    pub pipeline: Pipeline,
    pub tasks: Vec<Task>,
    pub dependencies: Vec<TaskDependency>,
    pub factory_states: Vec<FactoryState>,
}

struct PlanBuilder<'a> {
    inputs: &'a PlannerInputs<'a>,
    pipeline_id: PipelineId,
    tasks: Vec<Task>,
    dependencies: Vec<TaskDependency>,
    factory_states: Vec<FactoryState>,
}

/// Expands a product's supply chain into the task DAG of one FABRICATION
/// pipeline: input deliveries feed factories, each fabricated good waits on
/// its deliveries, and the root good gets a final collect-and-sell task.
pub fn plan_fabrication_pipeline(inputs: &PlannerInputs) -> Result<PipelinePlan> {
    let chain = resolve_input_chain(&inputs.product, inputs.relations);
    let pipeline_id = PipelineId::generate();

    let mut builder = PlanBuilder {
        inputs,
        pipeline_id,
        tasks: Vec::new(),
        dependencies: Vec::new(),
        factory_states: Vec::new(),
    };

    let fabricate_id = builder.plan_fabricated_good(&inputs.product, inputs.factory_market.clone(), None, 0, &mut Vec::new())?;

    // root: final sell-at-market task, collecting the produced good
    let mut sell_task = builder.blank_task(TaskType::CollectSell, inputs.product.clone(), 0);
    sell_task.source_market = Some(inputs.factory_market.clone());
    sell_task.target_market = Some(inputs.sell_market.clone());
    sell_task.budgeted_unit_price = inputs.expected_unit_price;
    let sell_id = sell_task.id;
    builder.tasks.push(sell_task);
    builder.dependencies.push(TaskDependency {
        task_id: sell_id,
        depends_on_id: fabricate_id,
    });

    validate_acyclic(&builder.tasks, &builder.dependencies)?;

    let pipeline = Pipeline {
        id: pipeline_id,
        player_id: inputs.player,
        sequence_number: 0, // allocated by the repository on insert
        pipeline_type: PipelineType::Fabrication,
        product_good: inputs.product.clone(),
        sell_market: inputs.sell_market.clone(),
        expected_unit_price: inputs.expected_unit_price,
        status: PipelineStatus::Planning,
        total_cost: 0,
        total_revenue: 0,
        net_profit: 0,
        supply_chain_depth: chain_depth(&chain),
        max_concurrent_workers: inputs.max_concurrent_workers,
        error_message: None,
        created_at: inputs.now,
        updated_at: inputs.now,
        completed_at: None,
    };

    Ok(PipelinePlan {
        pipeline,
        tasks: builder.tasks,
        dependencies: builder.dependencies,
        factory_states: builder.factory_states,
    })
}

/// A COLLECTION pipeline is a single collect-and-sell hop on a raw good.
pub fn plan_collection_pipeline(
    player: PlayerId,
    good: TradeGoodSymbol,
    source_market: WaypointSymbol,
    sell_market: WaypointSymbol,
    purchase_price: i64,
    sell_price: i64,
    unit_batch: i32,
    now: DateTime<Utc>,
) -> PipelinePlan {
    let pipeline_id = PipelineId::generate();
    let task = Task {
        id: TaskId::generate(),
        pipeline_id: Some(pipeline_id),
        player_id: player,
        task_type: TaskType::CollectSell,
        status: TaskStatus::Pending,
        good: good.clone(),
        target_units: unit_batch,
        actual_units: 0,
        source_market: Some(source_market),
        target_market: Some(sell_market.clone()),
        factory: None,
        storage_operation_id: None,
        assigned_ship: None,
        priority: 0,
        retry_count: 0,
        max_retries: 3,
        budgeted_unit_price: purchase_price + (purchase_price / 10),
        total_cost: 0,
        total_revenue: 0,
        error_message: None,
        collect_phase_completed: false,
        acquire_phase_completed: false,
        created_at: now,
        updated_at: now,
    };

    let pipeline = Pipeline {
        id: pipeline_id,
        player_id: player,
        sequence_number: 0,
        pipeline_type: PipelineType::Collection,
        product_good: good,
        sell_market,
        expected_unit_price: sell_price,
        status: PipelineStatus::Planning,
        total_cost: 0,
        total_revenue: 0,
        net_profit: 0,
        supply_chain_depth: 0,
        max_concurrent_workers: 1,
        error_message: None,
        created_at: now,
        updated_at: now,
        completed_at: None,
    };

    PipelinePlan {
        pipeline,
        tasks: vec![task],
        dependencies: vec![],
        factory_states: vec![],
    }
}

impl<'a> PlanBuilder<'a> {
    /// Plans production of `good` at `factory`, delivering the output to
    /// `deliver_to` (None for the pipeline root). Returns the id of the task
    /// that produces-and-moves the good, which the consumer depends on.
    fn plan_fabricated_good(
        &mut self,
        good: &TradeGoodSymbol,
        factory: WaypointSymbol,
        deliver_to: Option<WaypointSymbol>,
        depth: i32,
        stack: &mut Vec<TradeGoodSymbol>,
    ) -> Result<TaskId> {
        if stack.contains(good) {
            bail!("supply chain for {} is cyclic via {}", self.inputs.product, good);
        }
        stack.push(good.clone());

        let input_goods = self.inputs.relations.get(good).cloned().unwrap_or_default();
        let mut delivery_task_ids = Vec::new();
        let mut required_inputs = HashMap::new();

        for input in &input_goods {
            required_inputs.insert(input.clone(), self.inputs.unit_batch);
            let delivery_id = self.plan_input_delivery(input, &factory, depth + 1, stack)?;
            delivery_task_ids.push(delivery_id);
        }

        self.factory_states.push(FactoryState::new(
            factory.clone(),
            good.clone(),
            self.pipeline_id,
            self.inputs.player,
            required_inputs,
        ));

        let mut fabricate = self.blank_task(TaskType::FabricateSell, good.clone(), depth);
        fabricate.factory = Some(factory.clone());
        fabricate.target_market = deliver_to;
        fabricate.budgeted_unit_price = self
            .inputs
            .market
            .get(&(factory, good.clone()))
            .map(|q| q.purchase_price)
            .unwrap_or(self.inputs.expected_unit_price);
        let fabricate_id = fabricate.id;
        self.tasks.push(fabricate);
        for delivery_id in delivery_task_ids {
            self.dependencies.push(TaskDependency {
                task_id: fabricate_id,
                depends_on_id: delivery_id,
            });
        }

        stack.pop();
        Ok(fabricate_id)
    }

    fn plan_input_delivery(&mut self, input: &TradeGoodSymbol, factory: &WaypointSymbol, depth: i32, stack: &mut Vec<TradeGoodSymbol>) -> Result<TaskId> {
        // an active storage operation holding the good beats buying it
        if let Some(op) = self
            .inputs
            .storage_operations
            .values()
            .find(|op| op.units_by_good.get(input).copied().unwrap_or(0) > 0)
        {
            let mut task = self.blank_task(TaskType::StorageAcquireDeliver, input.clone(), depth);
            task.factory = Some(factory.clone());
            task.target_market = Some(factory.clone());
            task.storage_operation_id = Some(op.id.clone());
            let id = task.id;
            self.tasks.push(task);
            return Ok(id);
        }

        let buy_quote = self.cheapest_source(input);
        let fabricable = self
            .inputs
            .relations
            .get(input)
            .map(|inputs| !inputs.is_empty())
            .unwrap_or(false)
            && self.export_market_of(input).is_some();

        let fabricate = match self.inputs.strategy {
            AcquisitionStrategy::PreferBuy => buy_quote.is_none() && fabricable,
            AcquisitionStrategy::PreferFabricate => fabricable,
            AcquisitionStrategy::Smart => match &buy_quote {
                Some(quote) if quote.supply_at_least(SupplyLevel::High) => false,
                _ => fabricable,
            },
        };

        if fabricate {
            let own_factory = self
                .export_market_of(input)
                .expect("fabricable implies an export market");
            return self.plan_fabricated_good(input, own_factory, Some(factory.clone()), depth, stack);
        }

        let Some(quote) = buy_quote else {
            bail!("no acquisition path for input {} of {}", input, self.inputs.product);
        };
        let mut task = self.blank_task(TaskType::AcquireDeliver, input.clone(), depth);
        task.source_market = Some(quote.waypoint_symbol.clone());
        task.target_market = Some(factory.clone());
        task.factory = Some(factory.clone());
        // headroom over the quoted price so normal drift does not block readiness
        task.budgeted_unit_price = quote.purchase_price + (quote.purchase_price / 5).max(10);
        let id = task.id;
        self.tasks.push(task);
        Ok(id)
    }

    fn cheapest_source(&self, good: &TradeGoodSymbol) -> Option<MarketData> {
        self.inputs
            .market
            .values()
            .filter(|q| q.good_symbol == *good && (q.exports() || q.trade_type == Some(fleet_domain::TradeGoodType::Exchange)))
            .min_by_key(|q| q.purchase_price)
            .cloned()
    }

    fn export_market_of(&self, good: &TradeGoodSymbol) -> Option<WaypointSymbol> {
        self.inputs
            .market
            .values()
            .filter(|q| q.good_symbol == *good && q.exports())
            .min_by_key(|q| q.purchase_price)
            .map(|q| q.waypoint_symbol.clone())
    }

    fn blank_task(&self, task_type: TaskType, good: TradeGoodSymbol, depth: i32) -> Task {
        Task {
            id: TaskId::generate(),
            pipeline_id: Some(self.pipeline_id),
            player_id: self.inputs.player,
            task_type,
            status: TaskStatus::Pending,
            good,
            target_units: self.inputs.unit_batch,
            actual_units: 0,
            source_market: None,
            target_market: None,
            factory: None,
            storage_operation_id: None,
            assigned_ship: None,
            // deeper tasks run first; leaves get the highest priority
            priority: depth * 10,
            retry_count: 0,
            max_retries: 3,
            budgeted_unit_price: 0,
            total_cost: 0,
            total_revenue: 0,
            error_message: None,
            collect_phase_completed: false,
            acquire_phase_completed: false,
            created_at: self.inputs.now,
            updated_at: self.inputs.now,
        }
    }
}

fn validate_acyclic(tasks: &[Task], dependencies: &[TaskDependency]) -> Result<()> {
    let mut graph = DiGraph::<TaskId, ()>::new();
    let mut nodes = HashMap::new();
    for task in tasks {
        nodes.insert(task.id, graph.add_node(task.id));
    }
    for dep in dependencies {
        match (nodes.get(&dep.depends_on_id), nodes.get(&dep.task_id)) {
            (Some(from), Some(to)) => {
                graph.add_edge(*from, *to, ());
            }
            _ => bail!("dependency edge references a task outside the plan"),
        }
    }
    if is_cyclic_directed(&graph) {
        bail!("planned task graph is cyclic");
    }
    Ok(())
}
