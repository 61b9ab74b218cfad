use crate::{Ctx, DbModelManager};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_domain::{FactoryState, PipelineId, PlayerId, SupplyLevel, TradeGoodSymbol, WaypointSymbol};
use mockall::automock;
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::HashMap;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

#[automock]
#[async_trait]
pub trait FactoryStateBmcTrait: Send + Sync + Debug {
    async fn upsert(&self, ctx: &Ctx, state: &FactoryState) -> Result<()>;
    async fn get(&self, ctx: &Ctx, factory: &WaypointSymbol, output_good: &TradeGoodSymbol, pipeline_id: &PipelineId) -> Result<Option<FactoryState>>;
    async fn list_for_player(&self, ctx: &Ctx) -> Result<Vec<FactoryState>>;
    async fn delete_for_pipeline(&self, ctx: &Ctx, pipeline_id: &PipelineId) -> Result<u64>;
}

#[derive(Debug, FromRow)]
struct DbFactoryStateRow {
    factory: String,
    output_good: String,
    pipeline_id: uuid::Uuid,
    player_id: i64,
    required_inputs: Json<HashMap<String, i32>>,
    delivered_inputs: Json<HashMap<String, i32>>,
    all_inputs_delivered: bool,
    current_supply: Option<String>,
    previous_supply: Option<String>,
    ready_for_collection: bool,
    inputs_completed_at: Option<DateTime<Utc>>,
    ready_at: Option<DateTime<Utc>>,
}

fn parse_supply(value: Option<String>) -> Result<Option<SupplyLevel>> {
    value
        .map(|s| SupplyLevel::from_str(&s).map_err(anyhow::Error::from))
        .transpose()
}

impl TryFrom<DbFactoryStateRow> for FactoryState {
    type Error = anyhow::Error;

    fn try_from(row: DbFactoryStateRow) -> Result<Self> {
        Ok(FactoryState {
            factory: WaypointSymbol(row.factory),
            output_good: TradeGoodSymbol(row.output_good),
            pipeline_id: PipelineId(row.pipeline_id),
            player_id: PlayerId(row.player_id),
            required_inputs: row.required_inputs.0.into_iter().map(|(k, v)| (TradeGoodSymbol(k), v)).collect(),
            delivered_inputs: row.delivered_inputs.0.into_iter().map(|(k, v)| (TradeGoodSymbol(k), v)).collect(),
            all_inputs_delivered: row.all_inputs_delivered,
            current_supply: parse_supply(row.current_supply)?,
            previous_supply: parse_supply(row.previous_supply)?,
            ready_for_collection: row.ready_for_collection,
            inputs_completed_at: row.inputs_completed_at,
            ready_at: row.ready_at,
        })
    }
}

#[derive(Debug)]
pub struct DbFactoryStateBmc {
    pub mm: DbModelManager,
}

#[async_trait]
impl FactoryStateBmcTrait for DbFactoryStateBmc {
    async fn upsert(&self, ctx: &Ctx, state: &FactoryState) -> Result<()> {
        let required: HashMap<String, i32> = state.required_inputs.iter().map(|(k, v)| (k.0.clone(), *v)).collect();
        let delivered: HashMap<String, i32> = state.delivered_inputs.iter().map(|(k, v)| (k.0.clone(), *v)).collect();
        sqlx::query(
            r#"
insert into manufacturing_factory_states
    (factory, output_good, pipeline_id, player_id, required_inputs, delivered_inputs,
     all_inputs_delivered, current_supply, previous_supply, ready_for_collection,
     inputs_completed_at, ready_at)
values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
on conflict (factory, output_good, pipeline_id) do update
   set delivered_inputs = excluded.delivered_inputs,
       all_inputs_delivered = excluded.all_inputs_delivered,
       current_supply = excluded.current_supply,
       previous_supply = excluded.previous_supply,
       ready_for_collection = excluded.ready_for_collection,
       inputs_completed_at = excluded.inputs_completed_at,
       ready_at = excluded.ready_at
        "#,
        )
        .bind(&state.factory.0)
        .bind(&state.output_good.0)
        .bind(state.pipeline_id.0)
        .bind(ctx.player_id().0)
        .bind(Json(required))
        .bind(Json(delivered))
        .bind(state.all_inputs_delivered)
        .bind(state.current_supply.map(|s| s.to_string()))
        .bind(state.previous_supply.map(|s| s.to_string()))
        .bind(state.ready_for_collection)
        .bind(state.inputs_completed_at)
        .bind(state.ready_at)
        .execute(self.mm.pool())
        .await?;
        Ok(())
    }

    async fn get(&self, ctx: &Ctx, factory: &WaypointSymbol, output_good: &TradeGoodSymbol, pipeline_id: &PipelineId) -> Result<Option<FactoryState>> {
        let row: Option<DbFactoryStateRow> = sqlx::query_as(
            r#"
select factory, output_good, pipeline_id, player_id, required_inputs, delivered_inputs,
       all_inputs_delivered, current_supply, previous_supply, ready_for_collection,
       inputs_completed_at, ready_at
  from manufacturing_factory_states
 where factory = $1 and output_good = $2 and pipeline_id = $3 and player_id = $4
        "#,
        )
        .bind(&factory.0)
        .bind(&output_good.0)
        .bind(pipeline_id.0)
        .bind(ctx.player_id().0)
        .fetch_optional(self.mm.pool())
        .await?;
        row.map(FactoryState::try_from).transpose()
    }

    async fn list_for_player(&self, ctx: &Ctx) -> Result<Vec<FactoryState>> {
        let rows: Vec<DbFactoryStateRow> = sqlx::query_as(
            r#"
select factory, output_good, pipeline_id, player_id, required_inputs, delivered_inputs,
       all_inputs_delivered, current_supply, previous_supply, ready_for_collection,
       inputs_completed_at, ready_at
  from manufacturing_factory_states
 where player_id = $1
        "#,
        )
        .bind(ctx.player_id().0)
        .fetch_all(self.mm.pool())
        .await?;
        rows.into_iter().map(FactoryState::try_from).collect()
    }

    async fn delete_for_pipeline(&self, ctx: &Ctx, pipeline_id: &PipelineId) -> Result<u64> {
        let result = sqlx::query("delete from manufacturing_factory_states where pipeline_id = $1 and player_id = $2")
            .bind(pipeline_id.0)
            .bind(ctx.player_id().0)
            .execute(self.mm.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryFactoryStateBmc {
    states: Arc<RwLock<Vec<FactoryState>>>,
}

impl InMemoryFactoryStateBmc {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FactoryStateBmcTrait for InMemoryFactoryStateBmc {
    async fn upsert(&self, ctx: &Ctx, state: &FactoryState) -> Result<()> {
        let mut states = self.states.write().await;
        let mut stored = state.clone();
        stored.player_id = ctx.player_id();
        let existing = states
            .iter()
            .position(|s| s.factory == state.factory && s.output_good == state.output_good && s.pipeline_id == state.pipeline_id && s.player_id == ctx.player_id());
        match existing {
            Some(idx) => states[idx] = stored,
            None => states.push(stored),
        }
        Ok(())
    }

    async fn get(&self, ctx: &Ctx, factory: &WaypointSymbol, output_good: &TradeGoodSymbol, pipeline_id: &PipelineId) -> Result<Option<FactoryState>> {
        let states = self.states.read().await;
        Ok(states
            .iter()
            .find(|s| s.factory == *factory && s.output_good == *output_good && s.pipeline_id == *pipeline_id && s.player_id == ctx.player_id())
            .cloned())
    }

    async fn list_for_player(&self, ctx: &Ctx) -> Result<Vec<FactoryState>> {
        let states = self.states.read().await;
        Ok(states.iter().filter(|s| s.player_id == ctx.player_id()).cloned().collect())
    }

    async fn delete_for_pipeline(&self, ctx: &Ctx, pipeline_id: &PipelineId) -> Result<u64> {
        let mut states = self.states.write().await;
        let before = states.len();
        states.retain(|s| !(s.pipeline_id == *pipeline_id && s.player_id == ctx.player_id()));
        Ok((before - states.len()) as u64)
    }
}
