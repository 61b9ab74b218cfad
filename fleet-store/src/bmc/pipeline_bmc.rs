use crate::{Ctx, DbModelManager};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_domain::{Pipeline, PipelineId, PipelineStatus, PipelineType, PlayerId, TradeGoodSymbol, WaypointSymbol};
use mockall::automock;
use sqlx::FromRow;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

#[automock]
#[async_trait]
pub trait PipelineBmcTrait: Send + Sync + Debug {
    /// Persists the pipeline, allocating `sequence_number` as MAX+1 for the
    /// player inside the insert transaction. Returns the stored pipeline.
    async fn create_pipeline(&self, ctx: &Ctx, pipeline: &Pipeline) -> Result<Pipeline>;
    async fn get_pipeline(&self, ctx: &Ctx, id: &PipelineId) -> Result<Option<Pipeline>>;
    async fn update_status(&self, ctx: &Ctx, id: &PipelineId, status: PipelineStatus, error_message: Option<String>, at: DateTime<Utc>) -> Result<()>;
    async fn add_financials(&self, ctx: &Ctx, id: &PipelineId, cost_delta: i64, revenue_delta: i64, at: DateTime<Utc>) -> Result<()>;
    async fn list_non_terminal(&self, ctx: &Ctx) -> Result<Vec<Pipeline>>;
    async fn exists_non_terminal_for_product(&self, ctx: &Ctx, product_good: &TradeGoodSymbol) -> Result<bool>;
    async fn exists_non_terminal_construction_for_site(&self, ctx: &Ctx, site: &WaypointSymbol) -> Result<bool>;
    async fn count_active_of_type(&self, ctx: &Ctx, pipeline_type: PipelineType) -> Result<usize>;
}

#[derive(Debug, FromRow)]
struct DbPipelineRow {
    id: uuid::Uuid,
    player_id: i64,
    sequence_number: i64,
    r#type: String,
    product_good: String,
    sell_market: String,
    expected_unit_price: i64,
    status: String,
    total_cost: i64,
    total_revenue: i64,
    net_profit: i64,
    supply_chain_depth: i32,
    max_concurrent_workers: i32,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DbPipelineRow> for Pipeline {
    type Error = anyhow::Error;

    fn try_from(row: DbPipelineRow) -> Result<Self> {
        Ok(Pipeline {
            id: PipelineId(row.id),
            player_id: PlayerId(row.player_id),
            sequence_number: row.sequence_number,
            pipeline_type: PipelineType::from_str(&row.r#type).map_err(anyhow::Error::from)?,
            product_good: TradeGoodSymbol(row.product_good),
            sell_market: WaypointSymbol(row.sell_market),
            expected_unit_price: row.expected_unit_price,
            status: PipelineStatus::from_str(&row.status).map_err(anyhow::Error::from)?,
            total_cost: row.total_cost,
            total_revenue: row.total_revenue,
            net_profit: row.net_profit,
            supply_chain_depth: row.supply_chain_depth,
            max_concurrent_workers: row.max_concurrent_workers,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
select id, player_id, sequence_number, type, product_good, sell_market, expected_unit_price,
       status, total_cost, total_revenue, net_profit, supply_chain_depth, max_concurrent_workers,
       error_message, created_at, updated_at, completed_at
  from manufacturing_pipelines
"#;

const NON_TERMINAL: &str = "('PLANNING', 'EXECUTING')";

#[derive(Debug)]
pub struct DbPipelineBmc {
    pub mm: DbModelManager,
}

#[async_trait]
impl PipelineBmcTrait for DbPipelineBmc {
    async fn create_pipeline(&self, ctx: &Ctx, pipeline: &Pipeline) -> Result<Pipeline> {
        let mut tx = self.mm.pool().begin().await?;
        // MAX+1 under the transaction; the unique (player, seq) index backstops
        // concurrent creators, the loser's transaction fails and is retried by
        // the opportunity scan.
        let (next_seq,): (i64,) = sqlx::query_as(
            r#"
select coalesce(max(sequence_number), 0) + 1
  from manufacturing_pipelines
 where player_id = $1
        "#,
        )
        .bind(ctx.player_id().0)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
insert into manufacturing_pipelines
    (id, player_id, sequence_number, type, product_good, sell_market, expected_unit_price,
     status, total_cost, total_revenue, net_profit, supply_chain_depth, max_concurrent_workers,
     error_message, created_at, updated_at, completed_at)
values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        "#,
        )
        .bind(pipeline.id.0)
        .bind(ctx.player_id().0)
        .bind(next_seq)
        .bind(pipeline.pipeline_type.to_string())
        .bind(&pipeline.product_good.0)
        .bind(&pipeline.sell_market.0)
        .bind(pipeline.expected_unit_price)
        .bind(pipeline.status.to_string())
        .bind(pipeline.total_cost)
        .bind(pipeline.total_revenue)
        .bind(pipeline.net_profit)
        .bind(pipeline.supply_chain_depth)
        .bind(pipeline.max_concurrent_workers)
        .bind(&pipeline.error_message)
        .bind(pipeline.created_at)
        .bind(pipeline.updated_at)
        .bind(pipeline.completed_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut stored = pipeline.clone();
        stored.player_id = ctx.player_id();
        stored.sequence_number = next_seq;
        Ok(stored)
    }

    async fn get_pipeline(&self, ctx: &Ctx, id: &PipelineId) -> Result<Option<Pipeline>> {
        let row: Option<DbPipelineRow> = sqlx::query_as(&format!("{} where id = $1 and player_id = $2", SELECT_COLUMNS))
            .bind(id.0)
            .bind(ctx.player_id().0)
            .fetch_optional(self.mm.pool())
            .await?;
        row.map(Pipeline::try_from).transpose()
    }

    async fn update_status(&self, ctx: &Ctx, id: &PipelineId, status: PipelineStatus, error_message: Option<String>, at: DateTime<Utc>) -> Result<()> {
        let completed_at = status.is_terminal().then_some(at);
        sqlx::query(
            r#"
update manufacturing_pipelines
   set status = $1, error_message = coalesce($2, error_message), updated_at = $3,
       completed_at = coalesce($4, completed_at)
 where id = $5 and player_id = $6
        "#,
        )
        .bind(status.to_string())
        .bind(error_message)
        .bind(at)
        .bind(completed_at)
        .bind(id.0)
        .bind(ctx.player_id().0)
        .execute(self.mm.pool())
        .await?;
        Ok(())
    }

    async fn add_financials(&self, ctx: &Ctx, id: &PipelineId, cost_delta: i64, revenue_delta: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
update manufacturing_pipelines
   set total_cost = total_cost + $1,
       total_revenue = total_revenue + $2,
       net_profit = net_profit + $2 - $1,
       updated_at = $3
 where id = $4 and player_id = $5
        "#,
        )
        .bind(cost_delta)
        .bind(revenue_delta)
        .bind(at)
        .bind(id.0)
        .bind(ctx.player_id().0)
        .execute(self.mm.pool())
        .await?;
        Ok(())
    }

    async fn list_non_terminal(&self, ctx: &Ctx) -> Result<Vec<Pipeline>> {
        let rows: Vec<DbPipelineRow> = sqlx::query_as(&format!(
            "{} where player_id = $1 and status in {} order by sequence_number",
            SELECT_COLUMNS, NON_TERMINAL
        ))
        .bind(ctx.player_id().0)
        .fetch_all(self.mm.pool())
        .await?;
        rows.into_iter().map(Pipeline::try_from).collect()
    }

    async fn exists_non_terminal_for_product(&self, ctx: &Ctx, product_good: &TradeGoodSymbol) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(&format!(
            "select count(*) from manufacturing_pipelines where player_id = $1 and product_good = $2 and status in {}",
            NON_TERMINAL
        ))
        .bind(ctx.player_id().0)
        .bind(&product_good.0)
        .fetch_one(self.mm.pool())
        .await?;
        Ok(count > 0)
    }

    async fn exists_non_terminal_construction_for_site(&self, ctx: &Ctx, site: &WaypointSymbol) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(&format!(
            "select count(*) from manufacturing_pipelines where player_id = $1 and type = 'CONSTRUCTION' and sell_market = $2 and status in {}",
            NON_TERMINAL
        ))
        .bind(ctx.player_id().0)
        .bind(&site.0)
        .fetch_one(self.mm.pool())
        .await?;
        Ok(count > 0)
    }

    async fn count_active_of_type(&self, ctx: &Ctx, pipeline_type: PipelineType) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as(&format!(
            "select count(*) from manufacturing_pipelines where player_id = $1 and type = $2 and status in {}",
            NON_TERMINAL
        ))
        .bind(ctx.player_id().0)
        .bind(pipeline_type.to_string())
        .fetch_one(self.mm.pool())
        .await?;
        Ok(count as usize)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPipelineBmc {
    pipelines: Arc<RwLock<Vec<Pipeline>>>,
}

impl InMemoryPipelineBmc {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineBmcTrait for InMemoryPipelineBmc {
    async fn create_pipeline(&self, ctx: &Ctx, pipeline: &Pipeline) -> Result<Pipeline> {
        let mut pipelines = self.pipelines.write().await;
        let next_seq = pipelines
            .iter()
            .filter(|p| p.player_id == ctx.player_id())
            .map(|p| p.sequence_number)
            .max()
            .unwrap_or(0)
            + 1;
        let mut stored = pipeline.clone();
        stored.player_id = ctx.player_id();
        stored.sequence_number = next_seq;
        pipelines.push(stored.clone());
        Ok(stored)
    }

    async fn get_pipeline(&self, ctx: &Ctx, id: &PipelineId) -> Result<Option<Pipeline>> {
        let pipelines = self.pipelines.read().await;
        Ok(pipelines
            .iter()
            .find(|p| p.id == *id && p.player_id == ctx.player_id())
            .cloned())
    }

    async fn update_status(&self, ctx: &Ctx, id: &PipelineId, status: PipelineStatus, error_message: Option<String>, at: DateTime<Utc>) -> Result<()> {
        let mut pipelines = self.pipelines.write().await;
        if let Some(pipeline) = pipelines
            .iter_mut()
            .find(|p| p.id == *id && p.player_id == ctx.player_id())
        {
            pipeline.status = status;
            if error_message.is_some() {
                pipeline.error_message = error_message;
            }
            pipeline.updated_at = at;
            if status.is_terminal() && pipeline.completed_at.is_none() {
                pipeline.completed_at = Some(at);
            }
        }
        Ok(())
    }

    async fn add_financials(&self, ctx: &Ctx, id: &PipelineId, cost_delta: i64, revenue_delta: i64, at: DateTime<Utc>) -> Result<()> {
        let mut pipelines = self.pipelines.write().await;
        if let Some(pipeline) = pipelines
            .iter_mut()
            .find(|p| p.id == *id && p.player_id == ctx.player_id())
        {
            pipeline.total_cost += cost_delta;
            pipeline.total_revenue += revenue_delta;
            pipeline.net_profit = pipeline.total_revenue - pipeline.total_cost;
            pipeline.updated_at = at;
        }
        Ok(())
    }

    async fn list_non_terminal(&self, ctx: &Ctx) -> Result<Vec<Pipeline>> {
        let pipelines = self.pipelines.read().await;
        let mut found: Vec<Pipeline> = pipelines
            .iter()
            .filter(|p| p.player_id == ctx.player_id() && !p.is_terminal())
            .cloned()
            .collect();
        found.sort_by_key(|p| p.sequence_number);
        Ok(found)
    }

    async fn exists_non_terminal_for_product(&self, ctx: &Ctx, product_good: &TradeGoodSymbol) -> Result<bool> {
        let pipelines = self.pipelines.read().await;
        Ok(pipelines
            .iter()
            .any(|p| p.player_id == ctx.player_id() && !p.is_terminal() && p.product_good == *product_good))
    }

    async fn exists_non_terminal_construction_for_site(&self, ctx: &Ctx, site: &WaypointSymbol) -> Result<bool> {
        let pipelines = self.pipelines.read().await;
        Ok(pipelines.iter().any(|p| {
            p.player_id == ctx.player_id() && !p.is_terminal() && p.pipeline_type == PipelineType::Construction && p.sell_market == *site
        }))
    }

    async fn count_active_of_type(&self, ctx: &Ctx, pipeline_type: PipelineType) -> Result<usize> {
        let pipelines = self.pipelines.read().await;
        Ok(pipelines
            .iter()
            .filter(|p| p.player_id == ctx.player_id() && !p.is_terminal() && p.pipeline_type == pipeline_type)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_domain::test_fixtures::pipeline;
    use itertools::Itertools;
    use test_log::test;

    #[test(tokio::test)]
    async fn sequence_numbers_increase_strictly_under_concurrent_creation() -> Result<()> {
        let bmc = Arc::new(InMemoryPipelineBmc::new());
        let mut handles = Vec::new();
        for i in 0..20 {
            let bmc = Arc::clone(&bmc);
            handles.push(tokio::spawn(async move {
                let p = pipeline(PlayerId(1), &format!("GOOD_{}", i), 0);
                bmc.create_pipeline(&Ctx::for_player(PlayerId(1)), &p).await
            }));
        }
        let mut sequences = Vec::new();
        for handle in handles {
            sequences.push(handle.await??.sequence_number);
        }
        sequences.sort_unstable();
        assert_eq!(sequences.iter().unique().count(), 20, "no duplicate sequence numbers");
        assert_eq!(sequences, (1..=20).collect::<Vec<i64>>());
        Ok(())
    }

    #[test(tokio::test)]
    async fn sequence_numbers_are_scoped_per_player() -> Result<()> {
        let bmc = InMemoryPipelineBmc::new();
        let one = bmc
            .create_pipeline(&Ctx::for_player(PlayerId(1)), &pipeline(PlayerId(1), "FAB_MATS", 0))
            .await?;
        let two = bmc
            .create_pipeline(&Ctx::for_player(PlayerId(2)), &pipeline(PlayerId(2), "FAB_MATS", 0))
            .await?;
        assert_eq!(one.sequence_number, 1);
        assert_eq!(two.sequence_number, 1);
        Ok(())
    }

    #[test(tokio::test)]
    async fn duplicate_product_guard_sees_only_non_terminal_pipelines() -> Result<()> {
        let bmc = InMemoryPipelineBmc::new();
        let ctx = Ctx::for_player(PlayerId(1));
        let stored = bmc.create_pipeline(&ctx, &pipeline(PlayerId(1), "FAB_MATS", 0)).await?;
        assert!(bmc.exists_non_terminal_for_product(&ctx, &"FAB_MATS".into()).await?);

        bmc.update_status(&ctx, &stored.id, PipelineStatus::Completed, None, fleet_domain::test_fixtures::test_epoch())
            .await?;
        assert!(!bmc.exists_non_terminal_for_product(&ctx, &"FAB_MATS".into()).await?);
        Ok(())
    }
}
