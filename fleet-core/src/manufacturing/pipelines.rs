use crate::manufacturing::pipeline_planner::{plan_collection_pipeline, plan_fabrication_pipeline, PipelinePlan, PlannerInputs};
use crate::manufacturing::{CoordinatorServices, CoordinatorState};
use anyhow::Result;
use chrono::Duration;
use fleet_domain::{
    ManufacturingCoordinatorConfig, MarketData, Pipeline, PipelineStatus, PipelineType, TaskStatus, TaskType, TradeGoodSymbol, WaypointSymbol,
};
use fleet_store::Ctx;
use itertools::Itertools;
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{event, Level};

const RECYCLE_ERROR: &str = "recycled";

/// Finds opportunities, instantiates pipelines, detects completion and
/// recycles pipelines that stopped making progress.
pub struct PipelineLifecycleManager {
    services: Arc<CoordinatorServices>,
}

impl PipelineLifecycleManager {
    pub fn new(services: Arc<CoordinatorServices>) -> Self {
        Self { services }
    }

    /// The opportunity scan. Returns how many pipelines were created.
    pub async fn scan_and_create(&self, ctx: &Ctx, cfg: &ManufacturingCoordinatorConfig, state: &mut CoordinatorState) -> Result<usize> {
        let market_rows = self.services.bmc.market_bmc().list_all(ctx).await?;
        let market: HashMap<(WaypointSymbol, TradeGoodSymbol), MarketData> = market_rows
            .iter()
            .map(|q| ((q.waypoint_symbol.clone(), q.good_symbol.clone()), q.clone()))
            .collect();
        let relations = self.services.api.get_supply_chain().await?.relation_map();

        let mut created = 0;
        created += self.scan_fabrication(ctx, cfg, state, &market, &relations).await?;
        created += self.scan_collection(ctx, cfg, state, &market, &relations).await?;
        if created > 0 {
            counter!("fleet_pipelines_created_total").increment(created as u64);
        }
        Ok(created)
    }

    /// Manufacturing demand: exportable fabricated goods whose purchase price
    /// clears the configured floor. cap == 0 disables fabrication entirely.
    async fn scan_fabrication(
        &self,
        ctx: &Ctx,
        cfg: &ManufacturingCoordinatorConfig,
        state: &mut CoordinatorState,
        market: &HashMap<(WaypointSymbol, TradeGoodSymbol), MarketData>,
        relations: &HashMap<TradeGoodSymbol, Vec<TradeGoodSymbol>>,
    ) -> Result<usize> {
        if cfg.max_active_fabrication_pipelines == 0 {
            return Ok(0);
        }
        let pipeline_bmc = self.services.bmc.pipeline_bmc();
        let mut active = pipeline_bmc.count_active_of_type(ctx, PipelineType::Fabrication).await?;

        let candidates = market
            .values()
            .filter(|q| q.exports() && q.purchase_price >= cfg.min_purchase_price)
            .filter(|q| relations.get(&q.good_symbol).map(|i| !i.is_empty()).unwrap_or(false))
            .sorted_by_key(|q| -q.purchase_price)
            .cloned()
            .collect_vec();

        let mut created = 0;
        for factory_quote in candidates {
            if active >= cfg.max_active_fabrication_pipelines {
                break;
            }
            let good = factory_quote.good_symbol.clone();
            if pipeline_bmc.exists_non_terminal_for_product(ctx, &good).await? {
                continue;
            }
            let Some(sell_quote) = best_sell_market(market, &good, &factory_quote.waypoint_symbol) else {
                continue;
            };

            let inputs = PlannerInputs {
                player: ctx.player_id(),
                product: good.clone(),
                factory_market: factory_quote.waypoint_symbol.clone(),
                sell_market: sell_quote.waypoint_symbol.clone(),
                expected_unit_price: sell_quote.sell_price,
                relations,
                market,
                storage_operations: &state.storage_operations,
                strategy: cfg.acquisition_strategy.clone(),
                unit_batch: 40,
                max_concurrent_workers: cfg.max_concurrent_tasks.min(4) as i32,
                now: self.services.clock.now(),
            };
            let plan = match plan_fabrication_pipeline(&inputs) {
                Ok(plan) => plan,
                Err(err) => {
                    event!(Level::WARN, good = %good, error = %err, "fabrication planning failed");
                    continue;
                }
            };
            self.persist_plan(ctx, state, plan).await?;
            active += 1;
            created += 1;
        }
        Ok(created)
    }

    /// Collection: raw goods with a positive spread between an export and an
    /// import market, ranked by recent price volatility. cap == 0 keeps the
    /// historical convention: unlimited.
    async fn scan_collection(
        &self,
        ctx: &Ctx,
        cfg: &ManufacturingCoordinatorConfig,
        state: &mut CoordinatorState,
        market: &HashMap<(WaypointSymbol, TradeGoodSymbol), MarketData>,
        relations: &HashMap<TradeGoodSymbol, Vec<TradeGoodSymbol>>,
    ) -> Result<usize> {
        let pipeline_bmc = self.services.bmc.pipeline_bmc();
        let mut active = pipeline_bmc.count_active_of_type(ctx, PipelineType::Collection).await?;
        let cap = if cfg.max_active_collection_pipelines == 0 {
            usize::MAX
        } else {
            cfg.max_active_collection_pipelines
        };

        let since = self.services.clock.now() - Duration::hours(6);
        let volatility: HashMap<(WaypointSymbol, TradeGoodSymbol), i64> = self
            .services
            .bmc
            .market_bmc()
            .price_swings(ctx, since)
            .await?
            .into_iter()
            .map(|s| ((s.waypoint_symbol, s.good_symbol), s.max_abs_swing))
            .collect();

        let candidates = market
            .values()
            .filter(|q| q.exports())
            .filter(|q| relations.get(&q.good_symbol).map(|i| i.is_empty()).unwrap_or(true))
            .filter_map(|q| {
                let sell = best_sell_market(market, &q.good_symbol, &q.waypoint_symbol)?;
                let spread = sell.sell_price - q.purchase_price;
                (spread > 0).then_some((q.clone(), sell, spread))
            })
            .sorted_by_key(|(q, _, spread)| {
                let swing = volatility.get(&(q.waypoint_symbol.clone(), q.good_symbol.clone())).copied().unwrap_or(0);
                (-swing, -spread)
            })
            .collect_vec();

        let mut created = 0;
        for (source, sell, _spread) in candidates {
            if active >= cap {
                break;
            }
            if pipeline_bmc.exists_non_terminal_for_product(ctx, &source.good_symbol).await? {
                continue;
            }
            let plan = plan_collection_pipeline(
                ctx.player_id(),
                source.good_symbol.clone(),
                source.waypoint_symbol.clone(),
                sell.waypoint_symbol.clone(),
                source.purchase_price,
                sell.sell_price,
                40,
                self.services.clock.now(),
            );
            self.persist_plan(ctx, state, plan).await?;
            active += 1;
            created += 1;
        }
        Ok(created)
    }

    async fn persist_plan(&self, ctx: &Ctx, state: &mut CoordinatorState, plan: PipelinePlan) -> Result<()> {
        let stored = self.services.bmc.pipeline_bmc().create_pipeline(ctx, &plan.pipeline).await?;
        self.services
            .bmc
            .task_bmc()
            .insert_tasks_with_dependencies(ctx, &plan.tasks, &plan.dependencies)
            .await?;
        for factory_state in plan.factory_states {
            state.factory_tracker.register(ctx, factory_state).await?;
        }
        event!(
            Level::INFO,
            pipeline = %stored.id,
            seq = stored.sequence_number,
            good = %stored.product_good,
            tasks = plan.tasks.len(),
            "pipeline created"
        );
        state.active_pipelines.insert(stored.id, stored);
        Ok(())
    }

    /// A pipeline is complete when all of its tasks are terminal; it FAILED
    /// when none of them completed. Called on worker completions and from the
    /// safety-net sweep tick.
    pub async fn check_pipeline_completion(&self, ctx: &Ctx, state: &mut CoordinatorState, pipeline_id: fleet_domain::PipelineId) -> Result<bool> {
        let tasks = self.services.bmc.task_bmc().list_by_pipeline(ctx, &pipeline_id).await?;
        if tasks.is_empty() || !tasks.iter().all(|t| t.is_terminal()) {
            return Ok(false);
        }
        let any_completed = tasks.iter().any(|t| t.status == TaskStatus::Completed);
        let status = if any_completed { PipelineStatus::Completed } else { PipelineStatus::Failed };
        let error = (!any_completed).then(|| "all tasks failed".to_string());

        self.services
            .bmc
            .pipeline_bmc()
            .update_status(ctx, &pipeline_id, status, error, self.services.clock.now())
            .await?;
        state.active_pipelines.remove(&pipeline_id);
        state.factory_tracker.delete_for_pipeline(ctx, &pipeline_id).await?;
        event!(Level::INFO, pipeline = %pipeline_id, status = %status, "pipeline finished");
        counter!("fleet_pipelines_finished_total").increment(1);
        Ok(true)
    }

    pub async fn sweep_completions(&self, ctx: &Ctx, state: &mut CoordinatorState) -> Result<usize> {
        let ids = state.active_pipelines.keys().copied().collect_vec();
        let mut finished = 0;
        for pipeline_id in ids {
            if self.check_pipeline_completion(ctx, state, pipeline_id).await? {
                finished += 1;
            }
        }
        Ok(finished)
    }

    /// The stuck-pipeline recycler. A pipeline is stuck when every
    /// non-terminal task has sat READY past the threshold with nothing
    /// assignable, or when a factory consumed its inputs but never turned
    /// ready for collection.
    pub async fn recycle_stuck(&self, ctx: &Ctx, state: &mut CoordinatorState, threshold: Duration) -> Result<usize> {
        let now = self.services.clock.now();
        let pipelines: Vec<Pipeline> = state.active_pipelines.values().cloned().collect();
        let mut recycled = 0;

        for pipeline in pipelines {
            let tasks = self.services.bmc.task_bmc().list_by_pipeline(ctx, &pipeline.id).await?;
            let non_terminal = tasks.iter().filter(|t| !t.is_terminal()).collect_vec();
            if non_terminal.is_empty() {
                continue;
            }

            let all_ready_and_stale = non_terminal
                .iter()
                .all(|t| t.status == TaskStatus::Ready && now - t.updated_at > threshold);

            let factory_stalled = tasks.iter().any(|t| {
                t.task_type == TaskType::FabricateSell
                    && !t.is_terminal()
                    && t.factory
                        .as_ref()
                        .and_then(|f| state.factory_tracker.get(f, &t.good, &pipeline.id))
                        .map(|s| {
                            s.all_inputs_delivered
                                && !s.ready_for_collection
                                && s.inputs_completed_at.map(|at| now - at > threshold).unwrap_or(false)
                        })
                        .unwrap_or(false)
            });

            if !all_ready_and_stale && !factory_stalled {
                continue;
            }

            event!(Level::WARN, pipeline = %pipeline.id, good = %pipeline.product_good, "recycling stuck pipeline");
            for task in non_terminal {
                self.services
                    .bmc
                    .task_bmc()
                    .record_outcome(ctx, &task.id, TaskStatus::Failed, 0, 0, 0, Some(RECYCLE_ERROR.to_string()), now)
                    .await?;
                state.queue.remove(task);
                state.assigned.remove(&task.id);
            }
            self.services
                .bmc
                .pipeline_bmc()
                .update_status(ctx, &pipeline.id, PipelineStatus::Cancelled, Some(RECYCLE_ERROR.to_string()), now)
                .await?;
            state.active_pipelines.remove(&pipeline.id);
            state.factory_tracker.delete_for_pipeline(ctx, &pipeline.id).await?;
            counter!("fleet_pipelines_recycled_total").increment(1);
            recycled += 1;
        }
        Ok(recycled)
    }
}

/// Best market to sell `good` at, excluding the factory itself.
fn best_sell_market<'a>(
    market: &'a HashMap<(WaypointSymbol, TradeGoodSymbol), MarketData>,
    good: &TradeGoodSymbol,
    exclude: &WaypointSymbol,
) -> Option<&'a MarketData> {
    market
        .values()
        .filter(|q| q.good_symbol == *good && q.accepts() && q.waypoint_symbol != *exclude)
        .max_by_key(|q| q.sell_price)
}
