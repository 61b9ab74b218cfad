use crate::{Ctx, DbModelManager};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_domain::{PipelineId, PlayerId, ShipSymbol, Task, TaskDependency, TaskId, TaskStatus, TaskType, TradeGoodSymbol, WaypointSymbol};
use mockall::automock;
use sqlx::FromRow;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Authoritative task store. The in-memory TaskQueue is recomputed from this;
/// every status transition writes here first.
#[automock]
#[async_trait]
pub trait TaskBmcTrait: Send + Sync + Debug {
    /// Persists a task batch and its dependency edges in one transaction.
    async fn insert_tasks_with_dependencies(&self, ctx: &Ctx, tasks: &[Task], dependencies: &[TaskDependency]) -> Result<()>;
    async fn get_task(&self, ctx: &Ctx, id: &TaskId) -> Result<Option<Task>>;
    async fn update_status(&self, ctx: &Ctx, id: &TaskId, status: TaskStatus, at: DateTime<Utc>) -> Result<()>;
    /// READY -> ASSIGNED with the reserved ship in the same statement.
    async fn set_assigned(&self, ctx: &Ctx, id: &TaskId, ship: &ShipSymbol, at: DateTime<Utc>) -> Result<()>;
    /// Drops the ship reservation and moves the task back to `status`.
    async fn clear_assignment(&self, ctx: &Ctx, id: &TaskId, status: TaskStatus, at: DateTime<Utc>) -> Result<()>;
    async fn record_outcome(
        &self,
        ctx: &Ctx,
        id: &TaskId,
        status: TaskStatus,
        actual_units: i32,
        cost_delta: i64,
        revenue_delta: i64,
        error_message: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()>;
    async fn increment_retry(&self, ctx: &Ctx, id: &TaskId) -> Result<i32>;
    async fn set_phase_flags(&self, ctx: &Ctx, id: &TaskId, collect_phase_completed: bool, acquire_phase_completed: bool, at: DateTime<Utc>) -> Result<()>;
    async fn list_non_terminal(&self, ctx: &Ctx) -> Result<Vec<Task>>;
    async fn list_by_pipeline(&self, ctx: &Ctx, pipeline_id: &PipelineId) -> Result<Vec<Task>>;
    async fn list_by_status(&self, ctx: &Ctx, status: TaskStatus) -> Result<Vec<Task>>;
    /// ASSIGNED and EXECUTING tasks; these are the ones holding ships.
    async fn list_holding_ships(&self, ctx: &Ctx) -> Result<Vec<Task>>;
    async fn list_dependencies(&self, ctx: &Ctx) -> Result<Vec<TaskDependency>>;
}

#[derive(Debug, FromRow)]
struct DbTaskRow {
    id: uuid::Uuid,
    pipeline_id: Option<uuid::Uuid>,
    player_id: i64,
    r#type: String,
    status: String,
    good: String,
    target_units: i32,
    actual_units: i32,
    source_market: Option<String>,
    target_market: Option<String>,
    factory: Option<String>,
    storage_operation_id: Option<String>,
    assigned_ship: Option<String>,
    priority: i32,
    retry_count: i32,
    max_retries: i32,
    budgeted_unit_price: i64,
    total_cost: i64,
    total_revenue: i64,
    error_message: Option<String>,
    collect_phase_completed: bool,
    acquire_phase_completed: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DbTaskRow> for Task {
    type Error = anyhow::Error;

    fn try_from(row: DbTaskRow) -> Result<Self> {
        Ok(Task {
            id: TaskId(row.id),
            pipeline_id: row.pipeline_id.map(PipelineId),
            player_id: PlayerId(row.player_id),
            task_type: TaskType::from_str(&row.r#type).map_err(anyhow::Error::from)?,
            status: TaskStatus::from_str(&row.status).map_err(anyhow::Error::from)?,
            good: TradeGoodSymbol(row.good),
            target_units: row.target_units,
            actual_units: row.actual_units,
            source_market: row.source_market.map(WaypointSymbol),
            target_market: row.target_market.map(WaypointSymbol),
            factory: row.factory.map(WaypointSymbol),
            storage_operation_id: row.storage_operation_id,
            assigned_ship: row.assigned_ship.map(ShipSymbol),
            priority: row.priority,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            budgeted_unit_price: row.budgeted_unit_price,
            total_cost: row.total_cost,
            total_revenue: row.total_revenue,
            error_message: row.error_message,
            collect_phase_completed: row.collect_phase_completed,
            acquire_phase_completed: row.acquire_phase_completed,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
select id, pipeline_id, player_id, type, status, good, target_units, actual_units,
       source_market, target_market, factory, storage_operation_id, assigned_ship,
       priority, retry_count, max_retries, budgeted_unit_price, total_cost, total_revenue,
       error_message, collect_phase_completed, acquire_phase_completed, created_at, updated_at
  from manufacturing_tasks
"#;

#[derive(Debug)]
pub struct DbTaskBmc {
    pub mm: DbModelManager,
}

#[async_trait]
impl TaskBmcTrait for DbTaskBmc {
    async fn insert_tasks_with_dependencies(&self, ctx: &Ctx, tasks: &[Task], dependencies: &[TaskDependency]) -> Result<()> {
        let mut tx = self.mm.pool().begin().await?;
        for task in tasks {
            sqlx::query(
                r#"
insert into manufacturing_tasks
    (id, pipeline_id, player_id, type, status, good, target_units, actual_units,
     source_market, target_market, factory, storage_operation_id, assigned_ship,
     priority, retry_count, max_retries, budgeted_unit_price, total_cost, total_revenue,
     error_message, collect_phase_completed, acquire_phase_completed, created_at, updated_at)
values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19,
        $20, $21, $22, $23, $24)
            "#,
            )
            .bind(task.id.0)
            .bind(task.pipeline_id.map(|p| p.0))
            .bind(ctx.player_id().0)
            .bind(task.task_type.to_string())
            .bind(task.status.to_string())
            .bind(&task.good.0)
            .bind(task.target_units)
            .bind(task.actual_units)
            .bind(task.source_market.as_ref().map(|w| w.0.clone()))
            .bind(task.target_market.as_ref().map(|w| w.0.clone()))
            .bind(task.factory.as_ref().map(|w| w.0.clone()))
            .bind(&task.storage_operation_id)
            .bind(task.assigned_ship.as_ref().map(|s| s.0.clone()))
            .bind(task.priority)
            .bind(task.retry_count)
            .bind(task.max_retries)
            .bind(task.budgeted_unit_price)
            .bind(task.total_cost)
            .bind(task.total_revenue)
            .bind(&task.error_message)
            .bind(task.collect_phase_completed)
            .bind(task.acquire_phase_completed)
            .bind(task.created_at)
            .bind(task.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        for dep in dependencies {
            sqlx::query(
                r#"
insert into manufacturing_task_dependencies (task_id, depends_on_id)
values ($1, $2)
            "#,
            )
            .bind(dep.task_id.0)
            .bind(dep.depends_on_id.0)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_task(&self, ctx: &Ctx, id: &TaskId) -> Result<Option<Task>> {
        let row: Option<DbTaskRow> = sqlx::query_as(&format!("{} where id = $1 and player_id = $2", SELECT_COLUMNS))
            .bind(id.0)
            .bind(ctx.player_id().0)
            .fetch_optional(self.mm.pool())
            .await?;
        row.map(Task::try_from).transpose()
    }

    async fn update_status(&self, ctx: &Ctx, id: &TaskId, status: TaskStatus, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("update manufacturing_tasks set status = $1, updated_at = $2 where id = $3 and player_id = $4")
            .bind(status.to_string())
            .bind(at)
            .bind(id.0)
            .bind(ctx.player_id().0)
            .execute(self.mm.pool())
            .await?;
        Ok(())
    }

    async fn set_assigned(&self, ctx: &Ctx, id: &TaskId, ship: &ShipSymbol, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
update manufacturing_tasks
   set status = 'ASSIGNED', assigned_ship = $1, updated_at = $2
 where id = $3 and player_id = $4
        "#,
        )
        .bind(&ship.0)
        .bind(at)
        .bind(id.0)
        .bind(ctx.player_id().0)
        .execute(self.mm.pool())
        .await?;
        Ok(())
    }

    async fn clear_assignment(&self, ctx: &Ctx, id: &TaskId, status: TaskStatus, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
update manufacturing_tasks
   set status = $1, assigned_ship = null, updated_at = $2
 where id = $3 and player_id = $4
        "#,
        )
        .bind(status.to_string())
        .bind(at)
        .bind(id.0)
        .bind(ctx.player_id().0)
        .execute(self.mm.pool())
        .await?;
        Ok(())
    }

    async fn record_outcome(
        &self,
        ctx: &Ctx,
        id: &TaskId,
        status: TaskStatus,
        actual_units: i32,
        cost_delta: i64,
        revenue_delta: i64,
        error_message: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
update manufacturing_tasks
   set status = $1, actual_units = actual_units + $2,
       total_cost = total_cost + $3, total_revenue = total_revenue + $4,
       error_message = $5, updated_at = $6
 where id = $7 and player_id = $8
        "#,
        )
        .bind(status.to_string())
        .bind(actual_units)
        .bind(cost_delta)
        .bind(revenue_delta)
        .bind(error_message)
        .bind(at)
        .bind(id.0)
        .bind(ctx.player_id().0)
        .execute(self.mm.pool())
        .await?;
        Ok(())
    }

    async fn increment_retry(&self, ctx: &Ctx, id: &TaskId) -> Result<i32> {
        let row: (i32,) = sqlx::query_as(
            r#"
update manufacturing_tasks
   set retry_count = retry_count + 1
 where id = $1 and player_id = $2
returning retry_count
        "#,
        )
        .bind(id.0)
        .bind(ctx.player_id().0)
        .fetch_one(self.mm.pool())
        .await?;
        Ok(row.0)
    }

    async fn set_phase_flags(&self, ctx: &Ctx, id: &TaskId, collect_phase_completed: bool, acquire_phase_completed: bool, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
update manufacturing_tasks
   set collect_phase_completed = $1, acquire_phase_completed = $2, updated_at = $3
 where id = $4 and player_id = $5
        "#,
        )
        .bind(collect_phase_completed)
        .bind(acquire_phase_completed)
        .bind(at)
        .bind(id.0)
        .bind(ctx.player_id().0)
        .execute(self.mm.pool())
        .await?;
        Ok(())
    }

    async fn list_non_terminal(&self, ctx: &Ctx) -> Result<Vec<Task>> {
        let rows: Vec<DbTaskRow> = sqlx::query_as(&format!(
            "{} where player_id = $1 and status not in ('COMPLETED', 'FAILED') order by created_at",
            SELECT_COLUMNS
        ))
        .bind(ctx.player_id().0)
        .fetch_all(self.mm.pool())
        .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn list_by_pipeline(&self, ctx: &Ctx, pipeline_id: &PipelineId) -> Result<Vec<Task>> {
        let rows: Vec<DbTaskRow> = sqlx::query_as(&format!("{} where player_id = $1 and pipeline_id = $2 order by created_at", SELECT_COLUMNS))
            .bind(ctx.player_id().0)
            .bind(pipeline_id.0)
            .fetch_all(self.mm.pool())
            .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn list_by_status(&self, ctx: &Ctx, status: TaskStatus) -> Result<Vec<Task>> {
        let rows: Vec<DbTaskRow> = sqlx::query_as(&format!("{} where player_id = $1 and status = $2 order by created_at", SELECT_COLUMNS))
            .bind(ctx.player_id().0)
            .bind(status.to_string())
            .fetch_all(self.mm.pool())
            .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn list_holding_ships(&self, ctx: &Ctx) -> Result<Vec<Task>> {
        let rows: Vec<DbTaskRow> = sqlx::query_as(&format!(
            "{} where player_id = $1 and status in ('ASSIGNED', 'EXECUTING') order by created_at",
            SELECT_COLUMNS
        ))
        .bind(ctx.player_id().0)
        .fetch_all(self.mm.pool())
        .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn list_dependencies(&self, ctx: &Ctx) -> Result<Vec<TaskDependency>> {
        let rows: Vec<(uuid::Uuid, uuid::Uuid)> = sqlx::query_as(
            r#"
select d.task_id, d.depends_on_id
  from manufacturing_task_dependencies d
  join manufacturing_tasks t on t.id = d.task_id
 where t.player_id = $1
        "#,
        )
        .bind(ctx.player_id().0)
        .fetch_all(self.mm.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|(task_id, depends_on_id)| TaskDependency {
                task_id: TaskId(task_id),
                depends_on_id: TaskId(depends_on_id),
            })
            .collect())
    }
}

#[derive(Debug, Default)]
struct InMemoryTasks {
    tasks: Vec<Task>,
    dependencies: Vec<TaskDependency>,
}

#[derive(Debug, Default)]
pub struct InMemoryTaskBmc {
    inner: Arc<RwLock<InMemoryTasks>>,
}

impl InMemoryTaskBmc {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskBmcTrait for InMemoryTaskBmc {
    async fn insert_tasks_with_dependencies(&self, ctx: &Ctx, tasks: &[Task], dependencies: &[TaskDependency]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for task in tasks {
            let mut stored = task.clone();
            stored.player_id = ctx.player_id();
            inner.tasks.push(stored);
        }
        inner.dependencies.extend(dependencies.iter().cloned());
        Ok(())
    }

    async fn get_task(&self, ctx: &Ctx, id: &TaskId) -> Result<Option<Task>> {
        let inner = self.inner.read().await;
        Ok(inner
            .tasks
            .iter()
            .find(|t| t.id == *id && t.player_id == ctx.player_id())
            .cloned())
    }

    async fn update_status(&self, ctx: &Ctx, id: &TaskId, status: TaskStatus, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(task) = inner
            .tasks
            .iter_mut()
            .find(|t| t.id == *id && t.player_id == ctx.player_id())
        {
            task.status = status;
            task.updated_at = at;
        }
        Ok(())
    }

    async fn set_assigned(&self, ctx: &Ctx, id: &TaskId, ship: &ShipSymbol, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(task) = inner
            .tasks
            .iter_mut()
            .find(|t| t.id == *id && t.player_id == ctx.player_id())
        {
            task.status = TaskStatus::Assigned;
            task.assigned_ship = Some(ship.clone());
            task.updated_at = at;
        }
        Ok(())
    }

    async fn clear_assignment(&self, ctx: &Ctx, id: &TaskId, status: TaskStatus, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(task) = inner
            .tasks
            .iter_mut()
            .find(|t| t.id == *id && t.player_id == ctx.player_id())
        {
            task.status = status;
            task.assigned_ship = None;
            task.updated_at = at;
        }
        Ok(())
    }

    async fn record_outcome(
        &self,
        ctx: &Ctx,
        id: &TaskId,
        status: TaskStatus,
        actual_units: i32,
        cost_delta: i64,
        revenue_delta: i64,
        error_message: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(task) = inner
            .tasks
            .iter_mut()
            .find(|t| t.id == *id && t.player_id == ctx.player_id())
        {
            task.status = status;
            task.actual_units += actual_units;
            task.total_cost += cost_delta;
            task.total_revenue += revenue_delta;
            task.error_message = error_message;
            task.updated_at = at;
        }
        Ok(())
    }

    async fn increment_retry(&self, ctx: &Ctx, id: &TaskId) -> Result<i32> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .iter_mut()
            .find(|t| t.id == *id && t.player_id == ctx.player_id())
            .ok_or_else(|| anyhow::anyhow!("task {} not found", id))?;
        task.retry_count += 1;
        Ok(task.retry_count)
    }

    async fn set_phase_flags(&self, ctx: &Ctx, id: &TaskId, collect_phase_completed: bool, acquire_phase_completed: bool, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(task) = inner
            .tasks
            .iter_mut()
            .find(|t| t.id == *id && t.player_id == ctx.player_id())
        {
            task.collect_phase_completed = collect_phase_completed;
            task.acquire_phase_completed = acquire_phase_completed;
            task.updated_at = at;
        }
        Ok(())
    }

    async fn list_non_terminal(&self, ctx: &Ctx) -> Result<Vec<Task>> {
        let inner = self.inner.read().await;
        let mut found: Vec<Task> = inner
            .tasks
            .iter()
            .filter(|t| t.player_id == ctx.player_id() && !t.is_terminal())
            .cloned()
            .collect();
        found.sort_by_key(|t| t.created_at);
        Ok(found)
    }

    async fn list_by_pipeline(&self, ctx: &Ctx, pipeline_id: &PipelineId) -> Result<Vec<Task>> {
        let inner = self.inner.read().await;
        let mut found: Vec<Task> = inner
            .tasks
            .iter()
            .filter(|t| t.player_id == ctx.player_id() && t.pipeline_id == Some(*pipeline_id))
            .cloned()
            .collect();
        found.sort_by_key(|t| t.created_at);
        Ok(found)
    }

    async fn list_by_status(&self, ctx: &Ctx, status: TaskStatus) -> Result<Vec<Task>> {
        let inner = self.inner.read().await;
        let mut found: Vec<Task> = inner
            .tasks
            .iter()
            .filter(|t| t.player_id == ctx.player_id() && t.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|t| t.created_at);
        Ok(found)
    }

    async fn list_holding_ships(&self, ctx: &Ctx) -> Result<Vec<Task>> {
        let inner = self.inner.read().await;
        Ok(inner
            .tasks
            .iter()
            .filter(|t| t.player_id == ctx.player_id() && t.status.holds_ship())
            .cloned()
            .collect())
    }

    async fn list_dependencies(&self, ctx: &Ctx) -> Result<Vec<TaskDependency>> {
        let inner = self.inner.read().await;
        let player_tasks: std::collections::HashSet<TaskId> = inner
            .tasks
            .iter()
            .filter(|t| t.player_id == ctx.player_id())
            .map(|t| t.id)
            .collect();
        Ok(inner
            .dependencies
            .iter()
            .filter(|d| player_tasks.contains(&d.task_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_domain::test_fixtures::{task, test_epoch};
    use fleet_domain::TaskType;
    use test_log::test;

    fn ctx() -> Ctx {
        Ctx::for_player(PlayerId(1))
    }

    #[test(tokio::test)]
    async fn batch_insert_stores_tasks_and_edges_together() -> Result<()> {
        let bmc = InMemoryTaskBmc::new();
        let upstream = task(TaskType::AcquireDeliver, "IRON", PlayerId(1));
        let downstream = task(TaskType::FabricateSell, "FAB_MATS", PlayerId(1));
        let edge = TaskDependency {
            task_id: downstream.id,
            depends_on_id: upstream.id,
        };

        bmc.insert_tasks_with_dependencies(&ctx(), &[upstream.clone(), downstream.clone()], &[edge.clone()])
            .await?;

        assert_eq!(bmc.list_non_terminal(&ctx()).await?.len(), 2);
        assert_eq!(bmc.list_dependencies(&ctx()).await?, vec![edge]);
        // another player sees neither tasks nor edges
        let other = Ctx::for_player(PlayerId(2));
        assert!(bmc.list_non_terminal(&other).await?.is_empty());
        assert!(bmc.list_dependencies(&other).await?.is_empty());
        Ok(())
    }

    #[test(tokio::test)]
    async fn holding_ships_tracks_assigned_and_executing_only() -> Result<()> {
        let bmc = InMemoryTaskBmc::new();
        let t = task(TaskType::CollectSell, "IRON", PlayerId(1));
        bmc.insert_tasks_with_dependencies(&ctx(), &[t.clone()], &[]).await?;
        assert!(bmc.list_holding_ships(&ctx()).await?.is_empty());

        bmc.set_assigned(&ctx(), &t.id, &ShipSymbol("S-1".to_string()), test_epoch()).await?;
        assert_eq!(bmc.list_holding_ships(&ctx()).await?.len(), 1);

        bmc.update_status(&ctx(), &t.id, TaskStatus::Executing, test_epoch()).await?;
        assert_eq!(bmc.list_holding_ships(&ctx()).await?.len(), 1);

        bmc.record_outcome(&ctx(), &t.id, TaskStatus::Completed, 40, 100, 200, None, test_epoch())
            .await?;
        assert!(bmc.list_holding_ships(&ctx()).await?.is_empty());

        let stored = bmc.get_task(&ctx(), &t.id).await?.unwrap();
        assert_eq!(stored.actual_units, 40);
        assert_eq!(stored.total_revenue, 200);
        Ok(())
    }

    #[test(tokio::test)]
    async fn clear_assignment_drops_the_ship() -> Result<()> {
        let bmc = InMemoryTaskBmc::new();
        let t = task(TaskType::CollectSell, "IRON", PlayerId(1));
        bmc.insert_tasks_with_dependencies(&ctx(), &[t.clone()], &[]).await?;
        bmc.set_assigned(&ctx(), &t.id, &ShipSymbol("S-1".to_string()), test_epoch()).await?;

        bmc.clear_assignment(&ctx(), &t.id, TaskStatus::Ready, test_epoch()).await?;
        let stored = bmc.get_task(&ctx(), &t.id).await?.unwrap();
        assert_eq!(stored.status, TaskStatus::Ready);
        assert_eq!(stored.assigned_ship, None);
        Ok(())
    }
}
