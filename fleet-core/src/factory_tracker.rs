use anyhow::Result;
use fleet_domain::{Clock, FactoryState, PipelineId, SupplyLevel, TradeGoodSymbol, WaypointSymbol};
use fleet_store::{Ctx, FactoryStateBmcTrait};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{event, Level};

/// Write-through cache of factory states, owned by the coordinator loop.
/// Mutations hit the repository first; the in-memory map is rebuildable at
/// any time from `rebuild`.
#[derive(Debug)]
pub struct FactoryStateTracker {
    bmc: Arc<dyn FactoryStateBmcTrait>,
    clock: Arc<dyn Clock>,
    states: HashMap<(WaypointSymbol, TradeGoodSymbol, PipelineId), FactoryState>,
}

impl FactoryStateTracker {
    pub fn new(bmc: Arc<dyn FactoryStateBmcTrait>, clock: Arc<dyn Clock>) -> Self {
        Self {
            bmc,
            clock,
            states: HashMap::new(),
        }
    }

    pub async fn rebuild(&mut self, ctx: &Ctx) -> Result<()> {
        let rows = self.bmc.list_for_player(ctx).await?;
        self.states = rows
            .into_iter()
            .map(|s| ((s.factory.clone(), s.output_good.clone(), s.pipeline_id), s))
            .collect();
        Ok(())
    }

    pub async fn register(&mut self, ctx: &Ctx, state: FactoryState) -> Result<()> {
        self.bmc.upsert(ctx, &state).await?;
        self.states
            .insert((state.factory.clone(), state.output_good.clone(), state.pipeline_id), state);
        Ok(())
    }

    /// Credits an input delivery against the factory of `pipeline_id` that
    /// consumes `good`.
    pub async fn record_delivery(&mut self, ctx: &Ctx, pipeline_id: PipelineId, factory: &WaypointSymbol, good: &TradeGoodSymbol, units: i32) -> Result<()> {
        let now = self.clock.now();
        let state = self
            .states
            .values_mut()
            .find(|s| s.pipeline_id == pipeline_id && s.factory == *factory && s.required_inputs.contains_key(good));
        let Some(state) = state else {
            event!(
                Level::WARN,
                pipeline = %pipeline_id,
                factory = %factory,
                good = %good,
                "delivery recorded against unknown factory state"
            );
            return Ok(());
        };
        state.record_delivery(good, units, now);
        let snapshot = state.clone();
        self.bmc.upsert(ctx, &snapshot).await?;
        Ok(())
    }

    /// Feeds an observed output-good supply level into the edge detector.
    pub async fn observe_supply(&mut self, ctx: &Ctx, factory: &WaypointSymbol, output_good: &TradeGoodSymbol, supply: SupplyLevel) -> Result<()> {
        let now = self.clock.now();
        let mut updated = Vec::new();
        for state in self
            .states
            .values_mut()
            .filter(|s| s.factory == *factory && s.output_good == *output_good)
        {
            let was_ready = state.ready_for_collection;
            state.observe_supply(supply, now);
            if state.ready_for_collection && !was_ready {
                event!(Level::INFO, factory = %factory, good = %output_good, "factory output ready for collection");
            }
            updated.push(state.clone());
        }
        for state in updated {
            self.bmc.upsert(ctx, &state).await?;
        }
        Ok(())
    }

    pub fn get(&self, factory: &WaypointSymbol, output_good: &TradeGoodSymbol, pipeline_id: &PipelineId) -> Option<&FactoryState> {
        self.states.get(&(factory.clone(), output_good.clone(), *pipeline_id))
    }

    pub fn states(&self) -> Vec<FactoryState> {
        self.states.values().cloned().collect()
    }

    pub fn states_for_pipeline(&self, pipeline_id: &PipelineId) -> Vec<&FactoryState> {
        self.states.values().filter(|s| s.pipeline_id == *pipeline_id).collect()
    }

    pub async fn delete_for_pipeline(&mut self, ctx: &Ctx, pipeline_id: &PipelineId) -> Result<()> {
        self.bmc.delete_for_pipeline(ctx, pipeline_id).await?;
        self.states.retain(|_, s| s.pipeline_id != *pipeline_id);
        Ok(())
    }
}
