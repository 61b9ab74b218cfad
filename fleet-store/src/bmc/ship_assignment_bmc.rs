use crate::{Ctx, DbModelManager};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_domain::{AssignmentStatus, ContainerId, LedgerError, PlayerId, ShipAssignment, ShipSymbol};
use mockall::automock;
use sqlx::FromRow;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// The fleet-wide ship-assignment ledger. At most one row per (ship, player)
/// is active at any instant; `transfer` is a single compare-and-set, never a
/// release followed by an assign.
#[automock]
#[async_trait]
pub trait ShipAssignmentBmcTrait: Send + Sync + Debug {
    async fn assign(&self, ctx: &Ctx, ship: &ShipSymbol, container_id: &ContainerId, at: DateTime<Utc>) -> Result<(), LedgerError>;
    async fn transfer(&self, ctx: &Ctx, ship: &ShipSymbol, from: &ContainerId, to: &ContainerId) -> Result<(), LedgerError>;
    async fn release(&self, ctx: &Ctx, ship: &ShipSymbol, reason: &str, at: DateTime<Utc>) -> Result<(), LedgerError>;
    async fn find_by_ship(&self, ctx: &Ctx, ship: &ShipSymbol) -> Result<Option<ShipAssignment>>;
    async fn find_by_container(&self, ctx: &Ctx, container_id: &ContainerId) -> Result<Vec<ShipAssignment>>;
    async fn release_all_for_container(&self, ctx: &Ctx, container_id: &ContainerId, reason: &str, at: DateTime<Utc>) -> Result<u64>;
}

#[derive(Debug, FromRow)]
struct DbShipAssignmentRow {
    ship_symbol: String,
    player_id: i64,
    container_id: Option<String>,
    status: String,
    assigned_at: DateTime<Utc>,
    released_at: Option<DateTime<Utc>>,
    release_reason: Option<String>,
}

impl TryFrom<DbShipAssignmentRow> for ShipAssignment {
    type Error = anyhow::Error;

    fn try_from(row: DbShipAssignmentRow) -> Result<Self> {
        Ok(ShipAssignment {
            ship_symbol: ShipSymbol(row.ship_symbol),
            player_id: PlayerId(row.player_id),
            container_id: row.container_id.map(ContainerId),
            status: AssignmentStatus::from_str(&row.status).map_err(anyhow::Error::from)?,
            assigned_at: row.assigned_at,
            released_at: row.released_at,
            release_reason: row.release_reason,
        })
    }
}

#[derive(Debug)]
pub struct DbShipAssignmentBmc {
    pub mm: DbModelManager,
}

#[async_trait]
impl ShipAssignmentBmcTrait for DbShipAssignmentBmc {
    async fn assign(&self, ctx: &Ctx, ship: &ShipSymbol, container_id: &ContainerId, at: DateTime<Utc>) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
insert into ship_assignments (ship_symbol, player_id, container_id, status, assigned_at)
values ($1, $2, $3, 'active', $4)
on conflict (ship_symbol, player_id) where status = 'active' do nothing
        "#,
        )
        .bind(&ship.0)
        .bind(ctx.player_id().0)
        .bind(&container_id.0)
        .bind(at)
        .execute(self.mm.pool())
        .await
        .map_err(|e| LedgerError::Other(e.into()))?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::Conflict { ship: ship.clone() });
        }
        Ok(())
    }

    async fn transfer(&self, ctx: &Ctx, ship: &ShipSymbol, from: &ContainerId, to: &ContainerId) -> Result<(), LedgerError> {
        // one conditional update; the WHERE clause is the compare half of the CAS
        let result = sqlx::query(
            r#"
update ship_assignments
   set container_id = $1
 where ship_symbol = $2
   and player_id = $3
   and status = 'active'
   and container_id = $4
        "#,
        )
        .bind(&to.0)
        .bind(&ship.0)
        .bind(ctx.player_id().0)
        .bind(&from.0)
        .execute(self.mm.pool())
        .await
        .map_err(|e| LedgerError::Other(e.into()))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        // lost the race; diagnose for the caller's rollback path
        match self
            .find_by_ship(ctx, ship)
            .await
            .map_err(LedgerError::Other)?
        {
            Some(current) if current.is_active() => Err(LedgerError::NotAssignedTo {
                ship: ship.clone(),
                expected: from.clone(),
            }),
            _ => Err(LedgerError::NotFound { ship: ship.clone() }),
        }
    }

    async fn release(&self, ctx: &Ctx, ship: &ShipSymbol, reason: &str, at: DateTime<Utc>) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
update ship_assignments
   set status = 'released', released_at = $1, release_reason = $2
 where ship_symbol = $3
   and player_id = $4
   and status = 'active'
        "#,
        )
        .bind(at)
        .bind(reason)
        .bind(&ship.0)
        .bind(ctx.player_id().0)
        .execute(self.mm.pool())
        .await
        .map_err(|e| LedgerError::Other(e.into()))?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound { ship: ship.clone() });
        }
        Ok(())
    }

    async fn find_by_ship(&self, ctx: &Ctx, ship: &ShipSymbol) -> Result<Option<ShipAssignment>> {
        let row: Option<DbShipAssignmentRow> = sqlx::query_as(
            r#"
select ship_symbol, player_id, container_id, status, assigned_at, released_at, release_reason
  from ship_assignments
 where ship_symbol = $1
   and player_id = $2
   and status = 'active'
        "#,
        )
        .bind(&ship.0)
        .bind(ctx.player_id().0)
        .fetch_optional(self.mm.pool())
        .await?;

        row.map(ShipAssignment::try_from).transpose()
    }

    async fn find_by_container(&self, ctx: &Ctx, container_id: &ContainerId) -> Result<Vec<ShipAssignment>> {
        let rows: Vec<DbShipAssignmentRow> = sqlx::query_as(
            r#"
select ship_symbol, player_id, container_id, status, assigned_at, released_at, release_reason
  from ship_assignments
 where container_id = $1
   and player_id = $2
   and status = 'active'
 order by ship_symbol
        "#,
        )
        .bind(&container_id.0)
        .bind(ctx.player_id().0)
        .fetch_all(self.mm.pool())
        .await?;

        rows.into_iter().map(ShipAssignment::try_from).collect()
    }

    async fn release_all_for_container(&self, ctx: &Ctx, container_id: &ContainerId, reason: &str, at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
update ship_assignments
   set status = 'released', released_at = $1, release_reason = $2
 where container_id = $3
   and player_id = $4
   and status = 'active'
        "#,
        )
        .bind(at)
        .bind(reason)
        .bind(&container_id.0)
        .bind(ctx.player_id().0)
        .execute(self.mm.pool())
        .await?;

        Ok(result.rows_affected())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryShipAssignmentBmc {
    rows: Arc<RwLock<Vec<ShipAssignment>>>,
}

impl InMemoryShipAssignmentBmc {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ShipAssignmentBmcTrait for InMemoryShipAssignmentBmc {
    async fn assign(&self, ctx: &Ctx, ship: &ShipSymbol, container_id: &ContainerId, at: DateTime<Utc>) -> Result<(), LedgerError> {
        let mut rows = self.rows.write().await;
        let already_active = rows
            .iter()
            .any(|a| a.is_active() && a.ship_symbol == *ship && a.player_id == ctx.player_id());
        if already_active {
            return Err(LedgerError::Conflict { ship: ship.clone() });
        }
        rows.push(ShipAssignment {
            ship_symbol: ship.clone(),
            player_id: ctx.player_id(),
            container_id: Some(container_id.clone()),
            status: AssignmentStatus::Active,
            assigned_at: at,
            released_at: None,
            release_reason: None,
        });
        Ok(())
    }

    async fn transfer(&self, ctx: &Ctx, ship: &ShipSymbol, from: &ContainerId, to: &ContainerId) -> Result<(), LedgerError> {
        // the whole compare-and-set happens under one write lock
        let mut rows = self.rows.write().await;
        let active = rows
            .iter_mut()
            .find(|a| a.is_active() && a.ship_symbol == *ship && a.player_id == ctx.player_id());
        match active {
            Some(row) if row.container_id.as_ref() == Some(from) => {
                row.container_id = Some(to.clone());
                Ok(())
            }
            Some(_) => Err(LedgerError::NotAssignedTo {
                ship: ship.clone(),
                expected: from.clone(),
            }),
            None => Err(LedgerError::NotFound { ship: ship.clone() }),
        }
    }

    async fn release(&self, ctx: &Ctx, ship: &ShipSymbol, reason: &str, at: DateTime<Utc>) -> Result<(), LedgerError> {
        let mut rows = self.rows.write().await;
        let active = rows
            .iter_mut()
            .find(|a| a.is_active() && a.ship_symbol == *ship && a.player_id == ctx.player_id());
        match active {
            Some(row) => {
                row.status = AssignmentStatus::Released;
                row.released_at = Some(at);
                row.release_reason = Some(reason.to_string());
                Ok(())
            }
            None => Err(LedgerError::NotFound { ship: ship.clone() }),
        }
    }

    async fn find_by_ship(&self, ctx: &Ctx, ship: &ShipSymbol) -> Result<Option<ShipAssignment>> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .find(|a| a.is_active() && a.ship_symbol == *ship && a.player_id == ctx.player_id())
            .cloned())
    }

    async fn find_by_container(&self, ctx: &Ctx, container_id: &ContainerId) -> Result<Vec<ShipAssignment>> {
        let rows = self.rows.read().await;
        let mut found: Vec<ShipAssignment> = rows
            .iter()
            .filter(|a| a.is_owned_by(container_id) && a.player_id == ctx.player_id())
            .cloned()
            .collect();
        found.sort_by(|a, b| a.ship_symbol.cmp(&b.ship_symbol));
        Ok(found)
    }

    async fn release_all_for_container(&self, ctx: &Ctx, container_id: &ContainerId, reason: &str, at: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.rows.write().await;
        let mut released = 0;
        for row in rows
            .iter_mut()
            .filter(|a| a.is_owned_by(container_id) && a.player_id == ctx.player_id())
        {
            row.status = AssignmentStatus::Released;
            row.released_at = Some(at);
            row.release_reason = Some(reason.to_string());
            released += 1;
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_domain::test_fixtures::test_epoch;
    use test_log::test;

    fn ctx() -> Ctx {
        Ctx::for_player(PlayerId(1))
    }

    fn ship() -> ShipSymbol {
        ShipSymbol("S-1".to_string())
    }

    #[test(tokio::test)]
    async fn assign_rejects_second_active_row() -> Result<()> {
        let bmc = InMemoryShipAssignmentBmc::new();
        bmc.assign(&ctx(), &ship(), &ContainerId("A".to_string()), test_epoch())
            .await?;

        let second = bmc
            .assign(&ctx(), &ship(), &ContainerId("B".to_string()), test_epoch())
            .await;
        assert!(matches!(second, Err(LedgerError::Conflict { .. })));

        // a different player may hold the same ship symbol
        bmc.assign(
            &Ctx::for_player(PlayerId(2)),
            &ship(),
            &ContainerId("B".to_string()),
            test_epoch(),
        )
        .await?;
        Ok(())
    }

    #[test(tokio::test)]
    async fn transfer_is_atomic_and_failed_transfer_leaves_owner_untouched() -> Result<()> {
        let bmc = InMemoryShipAssignmentBmc::new();
        let a = ContainerId("A".to_string());
        let b = ContainerId("B".to_string());
        let c = ContainerId("C".to_string());
        bmc.assign(&ctx(), &ship(), &a, test_epoch()).await?;

        bmc.transfer(&ctx(), &ship(), &a, &b).await?;
        let current = bmc.find_by_ship(&ctx(), &ship()).await?.unwrap();
        assert_eq!(current.container_id, Some(b.clone()));

        let stale = bmc.transfer(&ctx(), &ship(), &a, &c).await;
        assert!(matches!(stale, Err(LedgerError::NotAssignedTo { .. })));
        let current = bmc.find_by_ship(&ctx(), &ship()).await?.unwrap();
        assert_eq!(current.container_id, Some(b), "failed transfer must not move the ship");
        Ok(())
    }

    #[test(tokio::test)]
    async fn concurrent_transfers_from_same_owner_let_exactly_one_win() -> Result<()> {
        // scenario: container A owns S-1, B and C race for it
        for _ in 0..50 {
            let bmc = Arc::new(InMemoryShipAssignmentBmc::new());
            let a = ContainerId("A".to_string());
            bmc.assign(&ctx(), &ship(), &a, test_epoch()).await?;

            let bmc_b = Arc::clone(&bmc);
            let bmc_c = Arc::clone(&bmc);
            let a_b = a.clone();
            let a_c = a.clone();
            let to_b = tokio::spawn(async move {
                bmc_b
                    .transfer(&Ctx::for_player(PlayerId(1)), &ShipSymbol("S-1".to_string()), &a_b, &ContainerId("B".to_string()))
                    .await
            });
            let to_c = tokio::spawn(async move {
                bmc_c
                    .transfer(&Ctx::for_player(PlayerId(1)), &ShipSymbol("S-1".to_string()), &a_c, &ContainerId("C".to_string()))
                    .await
            });

            let (res_b, res_c) = (to_b.await?, to_c.await?);
            let wins = [&res_b, &res_c].iter().filter(|r| r.is_ok()).count();
            assert_eq!(wins, 1, "exactly one racer wins");

            let current = bmc.find_by_ship(&ctx(), &ship()).await?.unwrap();
            let owner = current.container_id.unwrap();
            assert!(owner.0 == "B" || owner.0 == "C");
            assert_ne!(owner.0, "A", "no row may still reference the old owner");
        }
        Ok(())
    }

    #[test(tokio::test)]
    async fn release_then_reassign_creates_fresh_row() -> Result<()> {
        let bmc = InMemoryShipAssignmentBmc::new();
        let a = ContainerId("A".to_string());
        bmc.assign(&ctx(), &ship(), &a, test_epoch()).await?;
        bmc.release(&ctx(), &ship(), "coordinator_stopped", test_epoch()).await?;
        assert!(bmc.find_by_ship(&ctx(), &ship()).await?.is_none());

        bmc.assign(&ctx(), &ship(), &a, test_epoch()).await?;
        let current = bmc.find_by_ship(&ctx(), &ship()).await?.unwrap();
        assert_eq!(current.container_id, Some(a));
        Ok(())
    }

    #[test(tokio::test)]
    async fn release_all_for_container_only_touches_that_container() -> Result<()> {
        let bmc = InMemoryShipAssignmentBmc::new();
        let a = ContainerId("A".to_string());
        let b = ContainerId("B".to_string());
        bmc.assign(&ctx(), &ShipSymbol("S-1".to_string()), &a, test_epoch()).await?;
        bmc.assign(&ctx(), &ShipSymbol("S-2".to_string()), &a, test_epoch()).await?;
        bmc.assign(&ctx(), &ShipSymbol("S-3".to_string()), &b, test_epoch()).await?;

        let released = bmc
            .release_all_for_container(&ctx(), &a, "coordinator_stopped", test_epoch())
            .await?;
        assert_eq!(released, 2);
        assert_eq!(bmc.find_by_container(&ctx(), &b).await?.len(), 1);
        Ok(())
    }
}
