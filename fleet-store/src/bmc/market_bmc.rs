use crate::{Ctx, DbModelManager};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_domain::{ActivityLevel, MarketData, PlayerId, PriceSwing, SupplyLevel, TradeGoodSymbol, TradeGoodType, WaypointSymbol};
use itertools::Itertools;
use mockall::automock;
use sqlx::FromRow;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

#[automock]
#[async_trait]
pub trait MarketBmcTrait: Send + Sync + Debug {
    /// Latest-quote upsert; every quote is also appended to the history table
    /// backing the volatility read.
    async fn upsert_quotes(&self, ctx: &Ctx, quotes: &[MarketData]) -> Result<()>;
    async fn latest(&self, ctx: &Ctx, waypoint: &WaypointSymbol, good: &TradeGoodSymbol) -> Result<Option<MarketData>>;
    async fn list_for_good(&self, ctx: &Ctx, good: &TradeGoodSymbol) -> Result<Vec<MarketData>>;
    async fn list_all(&self, ctx: &Ctx) -> Result<Vec<MarketData>>;
    /// Largest purchase-price swing between consecutive observations since
    /// `since`, per (waypoint, good). LAG window over the history table.
    async fn price_swings(&self, ctx: &Ctx, since: DateTime<Utc>) -> Result<Vec<PriceSwing>>;
}

#[derive(Debug, FromRow)]
struct DbMarketDataRow {
    waypoint_symbol: String,
    good_symbol: String,
    supply: Option<String>,
    activity: Option<String>,
    trade_type: Option<String>,
    purchase_price: i64,
    sell_price: i64,
    trade_volume: i32,
    last_updated: DateTime<Utc>,
    player_id: i64,
}

impl TryFrom<DbMarketDataRow> for MarketData {
    type Error = anyhow::Error;

    fn try_from(row: DbMarketDataRow) -> Result<Self> {
        Ok(MarketData {
            waypoint_symbol: WaypointSymbol(row.waypoint_symbol),
            good_symbol: TradeGoodSymbol(row.good_symbol),
            supply: row.supply.map(|s| SupplyLevel::from_str(&s)).transpose().map_err(anyhow::Error::from)?,
            activity: row
                .activity
                .map(|s| ActivityLevel::from_str(&s))
                .transpose()
                .map_err(anyhow::Error::from)?,
            trade_type: row
                .trade_type
                .map(|s| TradeGoodType::from_str(&s))
                .transpose()
                .map_err(anyhow::Error::from)?,
            purchase_price: row.purchase_price,
            sell_price: row.sell_price,
            trade_volume: row.trade_volume,
            last_updated: row.last_updated,
            player_id: PlayerId(row.player_id),
        })
    }
}

const SELECT_COLUMNS: &str = r#"
select waypoint_symbol, good_symbol, supply, activity, trade_type, purchase_price, sell_price,
       trade_volume, last_updated, player_id
  from market_data
"#;

#[derive(Debug)]
pub struct DbMarketBmc {
    pub mm: DbModelManager,
}

#[async_trait]
impl MarketBmcTrait for DbMarketBmc {
    async fn upsert_quotes(&self, ctx: &Ctx, quotes: &[MarketData]) -> Result<()> {
        let mut tx = self.mm.pool().begin().await?;
        for quote in quotes {
            sqlx::query(
                r#"
insert into market_data
    (waypoint_symbol, good_symbol, supply, activity, trade_type, purchase_price, sell_price,
     trade_volume, last_updated, player_id)
values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
on conflict (waypoint_symbol, good_symbol) do update
   set supply = excluded.supply,
       activity = excluded.activity,
       trade_type = excluded.trade_type,
       purchase_price = excluded.purchase_price,
       sell_price = excluded.sell_price,
       trade_volume = excluded.trade_volume,
       last_updated = excluded.last_updated
            "#,
            )
            .bind(&quote.waypoint_symbol.0)
            .bind(&quote.good_symbol.0)
            .bind(quote.supply.map(|s| s.to_string()))
            .bind(quote.activity.map(|a| a.to_string()))
            .bind(quote.trade_type.map(|t| t.to_string()))
            .bind(quote.purchase_price)
            .bind(quote.sell_price)
            .bind(quote.trade_volume)
            .bind(quote.last_updated)
            .bind(ctx.player_id().0)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
insert into market_data_history (waypoint_symbol, good_symbol, purchase_price, sell_price, observed_at, player_id)
values ($1, $2, $3, $4, $5, $6)
            "#,
            )
            .bind(&quote.waypoint_symbol.0)
            .bind(&quote.good_symbol.0)
            .bind(quote.purchase_price)
            .bind(quote.sell_price)
            .bind(quote.last_updated)
            .bind(ctx.player_id().0)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn latest(&self, ctx: &Ctx, waypoint: &WaypointSymbol, good: &TradeGoodSymbol) -> Result<Option<MarketData>> {
        let row: Option<DbMarketDataRow> = sqlx::query_as(&format!(
            "{} where player_id = $1 and waypoint_symbol = $2 and good_symbol = $3",
            SELECT_COLUMNS
        ))
        .bind(ctx.player_id().0)
        .bind(&waypoint.0)
        .bind(&good.0)
        .fetch_optional(self.mm.pool())
        .await?;
        row.map(MarketData::try_from).transpose()
    }

    async fn list_for_good(&self, ctx: &Ctx, good: &TradeGoodSymbol) -> Result<Vec<MarketData>> {
        let rows: Vec<DbMarketDataRow> = sqlx::query_as(&format!("{} where player_id = $1 and good_symbol = $2", SELECT_COLUMNS))
            .bind(ctx.player_id().0)
            .bind(&good.0)
            .fetch_all(self.mm.pool())
            .await?;
        rows.into_iter().map(MarketData::try_from).collect()
    }

    async fn list_all(&self, ctx: &Ctx) -> Result<Vec<MarketData>> {
        let rows: Vec<DbMarketDataRow> = sqlx::query_as(&format!("{} where player_id = $1", SELECT_COLUMNS))
            .bind(ctx.player_id().0)
            .fetch_all(self.mm.pool())
            .await?;
        rows.into_iter().map(MarketData::try_from).collect()
    }

    async fn price_swings(&self, ctx: &Ctx, since: DateTime<Utc>) -> Result<Vec<PriceSwing>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            r#"
select waypoint_symbol, good_symbol, max(abs(purchase_price - prev_price)) as max_abs_swing
  from (select waypoint_symbol,
               good_symbol,
               purchase_price,
               lag(purchase_price) over (partition by waypoint_symbol, good_symbol order by observed_at) as prev_price
          from market_data_history
         where player_id = $1
           and observed_at >= $2) with_lag
 where prev_price is not null
 group by waypoint_symbol, good_symbol
 order by max_abs_swing desc
        "#,
        )
        .bind(ctx.player_id().0)
        .bind(since)
        .fetch_all(self.mm.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|(waypoint, good, swing)| PriceSwing {
                waypoint_symbol: WaypointSymbol(waypoint),
                good_symbol: TradeGoodSymbol(good),
                max_abs_swing: swing,
            })
            .collect())
    }
}

#[derive(Debug, Default)]
struct InMemoryMarket {
    latest: Vec<MarketData>,
    history: Vec<(WaypointSymbol, TradeGoodSymbol, i64, DateTime<Utc>, PlayerId)>,
}

#[derive(Debug, Default)]
pub struct InMemoryMarketBmc {
    inner: Arc<RwLock<InMemoryMarket>>,
}

impl InMemoryMarketBmc {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MarketBmcTrait for InMemoryMarketBmc {
    async fn upsert_quotes(&self, ctx: &Ctx, quotes: &[MarketData]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for quote in quotes {
            let mut stored = quote.clone();
            stored.player_id = ctx.player_id();
            let existing = inner
                .latest
                .iter()
                .position(|m| m.waypoint_symbol == quote.waypoint_symbol && m.good_symbol == quote.good_symbol && m.player_id == ctx.player_id());
            match existing {
                Some(idx) => inner.latest[idx] = stored,
                None => inner.latest.push(stored),
            }
            inner.history.push((
                quote.waypoint_symbol.clone(),
                quote.good_symbol.clone(),
                quote.purchase_price,
                quote.last_updated,
                ctx.player_id(),
            ));
        }
        Ok(())
    }

    async fn latest(&self, ctx: &Ctx, waypoint: &WaypointSymbol, good: &TradeGoodSymbol) -> Result<Option<MarketData>> {
        let inner = self.inner.read().await;
        Ok(inner
            .latest
            .iter()
            .find(|m| m.waypoint_symbol == *waypoint && m.good_symbol == *good && m.player_id == ctx.player_id())
            .cloned())
    }

    async fn list_for_good(&self, ctx: &Ctx, good: &TradeGoodSymbol) -> Result<Vec<MarketData>> {
        let inner = self.inner.read().await;
        Ok(inner
            .latest
            .iter()
            .filter(|m| m.good_symbol == *good && m.player_id == ctx.player_id())
            .cloned()
            .collect())
    }

    async fn list_all(&self, ctx: &Ctx) -> Result<Vec<MarketData>> {
        let inner = self.inner.read().await;
        Ok(inner.latest.iter().filter(|m| m.player_id == ctx.player_id()).cloned().collect())
    }

    async fn price_swings(&self, ctx: &Ctx, since: DateTime<Utc>) -> Result<Vec<PriceSwing>> {
        let inner = self.inner.read().await;
        let observations: Vec<_> = inner
            .history
            .iter()
            .filter(|(_, _, _, observed_at, player)| *player == ctx.player_id() && *observed_at >= since)
            .sorted_by_key(|(wp, good, _, observed_at, _)| (wp.clone(), good.clone(), *observed_at))
            .collect();

        let mut prices_by_market: Vec<((WaypointSymbol, TradeGoodSymbol), Vec<i64>)> = Vec::new();
        for (wp, good, price, _, _) in observations {
            let key = (wp.clone(), good.clone());
            match prices_by_market.last_mut() {
                Some((last_key, prices)) if *last_key == key => prices.push(*price),
                _ => prices_by_market.push((key, vec![*price])),
            }
        }

        let mut swings: Vec<PriceSwing> = prices_by_market
            .into_iter()
            .filter_map(|((wp, good), prices)| {
                let max_swing = prices.windows(2).map(|w| (w[1] - w[0]).abs()).max()?;
                Some(PriceSwing {
                    waypoint_symbol: wp,
                    good_symbol: good,
                    max_abs_swing: max_swing,
                })
            })
            .collect();
        swings.sort_by_key(|s| -s.max_abs_swing);
        Ok(swings)
    }
}
