use crate::{Ctx, DbModelManager};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_domain::{Container, ContainerExit, ContainerId, ContainerStatus, ContainerType, PlayerId, RestartPolicy};
use mockall::automock;
use sqlx::types::Json;
use sqlx::FromRow;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Persistent registry of containers. Status only ever moves
/// PENDING -> RUNNING -> STOPPED; the update statements encode that.
#[automock]
#[async_trait]
pub trait ContainerBmcTrait: Send + Sync + Debug {
    /// Insert a PENDING record. Idempotent on (id, player): re-persisting an
    /// existing id is a no-op so callers can safely retry.
    async fn persist_container(&self, ctx: &Ctx, container: &Container) -> Result<()>;
    async fn get_container(&self, ctx: &Ctx, id: &ContainerId) -> Result<Option<Container>>;
    /// PENDING -> RUNNING. Returns false when the container was not PENDING.
    async fn mark_running(&self, ctx: &Ctx, id: &ContainerId, at: DateTime<Utc>) -> Result<bool>;
    /// Terminal transition; idempotent (a second stop keeps the first exit).
    async fn mark_stopped(&self, ctx: &Ctx, id: &ContainerId, at: DateTime<Utc>, exit: &ContainerExit) -> Result<()>;
    async fn increment_restart_count(&self, ctx: &Ctx, id: &ContainerId) -> Result<i32>;
    async fn list_by_status(&self, ctx: &Ctx, status: ContainerStatus) -> Result<Vec<Container>>;
    async fn list_running_of_type(&self, ctx: &Ctx, container_type: ContainerType) -> Result<Vec<Container>>;
    async fn list_children(&self, ctx: &Ctx, parent_id: &ContainerId) -> Result<Vec<Container>>;
    /// Singleton guard: within one transaction, persist `container` only if no
    /// RUNNING (or PENDING) container of the same type exists for the player.
    async fn create_if_no_running_of_type(&self, ctx: &Ctx, container: &Container) -> Result<bool>;
    /// Scoped singleton guard: additionally requires that no live container of
    /// the type carries `scope_fragment` anywhere in its config blob (one
    /// coordinator per system / per gas giant).
    async fn create_if_no_running_in_scope(&self, ctx: &Ctx, container: &Container, scope_fragment: &str) -> Result<bool>;
}

#[derive(Debug, FromRow)]
struct DbContainerRow {
    id: String,
    player_id: i64,
    r#type: String,
    command_label: String,
    status: String,
    parent_id: Option<String>,
    restart_policy: String,
    restart_count: i32,
    config: Json<fleet_domain::ContainerConfig>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    exit_reason: Option<String>,
}

impl TryFrom<DbContainerRow> for Container {
    type Error = anyhow::Error;

    fn try_from(row: DbContainerRow) -> Result<Self> {
        Ok(Container {
            id: ContainerId(row.id),
            player_id: PlayerId(row.player_id),
            container_type: ContainerType::from_str(&row.r#type).map_err(anyhow::Error::from)?,
            command_label: row.command_label,
            status: ContainerStatus::from_str(&row.status).map_err(anyhow::Error::from)?,
            parent_id: row.parent_id.map(ContainerId),
            restart_policy: RestartPolicy::from_str(&row.restart_policy).map_err(anyhow::Error::from)?,
            restart_count: row.restart_count,
            config: row.config.0,
            created_at: row.created_at,
            started_at: row.started_at,
            stopped_at: row.stopped_at,
            exit_code: row.exit_code,
            exit_reason: row.exit_reason,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
select id, player_id, type, command_label, status, parent_id, restart_policy, restart_count,
       config, created_at, started_at, stopped_at, exit_code, exit_reason
  from containers
"#;

#[derive(Debug)]
pub struct DbContainerBmc {
    pub mm: DbModelManager,
}

impl DbContainerBmc {
    async fn insert<'e, E>(executor: E, ctx: &Ctx, container: &Container) -> Result<u64>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        let result = sqlx::query(
            r#"
insert into containers (id, player_id, type, command_label, status, parent_id, restart_policy,
                        restart_count, config, created_at)
values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
on conflict (id, player_id) do nothing
        "#,
        )
        .bind(&container.id.0)
        .bind(ctx.player_id().0)
        .bind(container.container_type.to_string())
        .bind(&container.command_label)
        .bind(container.status.to_string())
        .bind(container.parent_id.as_ref().map(|p| p.0.clone()))
        .bind(container.restart_policy.to_string())
        .bind(container.restart_count)
        .bind(Json(container.config.clone()))
        .bind(container.created_at)
        .execute(executor)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ContainerBmcTrait for DbContainerBmc {
    async fn persist_container(&self, ctx: &Ctx, container: &Container) -> Result<()> {
        Self::insert(self.mm.pool(), ctx, container).await?;
        Ok(())
    }

    async fn get_container(&self, ctx: &Ctx, id: &ContainerId) -> Result<Option<Container>> {
        let row: Option<DbContainerRow> = sqlx::query_as(&format!("{} where id = $1 and player_id = $2", SELECT_COLUMNS))
            .bind(&id.0)
            .bind(ctx.player_id().0)
            .fetch_optional(self.mm.pool())
            .await?;
        row.map(Container::try_from).transpose()
    }

    async fn mark_running(&self, ctx: &Ctx, id: &ContainerId, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
update containers
   set status = 'RUNNING', started_at = $1
 where id = $2 and player_id = $3 and status = 'PENDING'
        "#,
        )
        .bind(at)
        .bind(&id.0)
        .bind(ctx.player_id().0)
        .execute(self.mm.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_stopped(&self, ctx: &Ctx, id: &ContainerId, at: DateTime<Utc>, exit: &ContainerExit) -> Result<()> {
        sqlx::query(
            r#"
update containers
   set status = 'STOPPED', stopped_at = $1, exit_code = $2, exit_reason = $3
 where id = $4 and player_id = $5 and status <> 'STOPPED'
        "#,
        )
        .bind(at)
        .bind(exit.exit_code)
        .bind(&exit.exit_reason)
        .bind(&id.0)
        .bind(ctx.player_id().0)
        .execute(self.mm.pool())
        .await?;
        Ok(())
    }

    async fn increment_restart_count(&self, ctx: &Ctx, id: &ContainerId) -> Result<i32> {
        let row: (i32,) = sqlx::query_as(
            r#"
update containers
   set restart_count = restart_count + 1
 where id = $1 and player_id = $2
returning restart_count
        "#,
        )
        .bind(&id.0)
        .bind(ctx.player_id().0)
        .fetch_one(self.mm.pool())
        .await?;
        Ok(row.0)
    }

    async fn list_by_status(&self, ctx: &Ctx, status: ContainerStatus) -> Result<Vec<Container>> {
        let rows: Vec<DbContainerRow> = sqlx::query_as(&format!("{} where player_id = $1 and status = $2 order by created_at", SELECT_COLUMNS))
            .bind(ctx.player_id().0)
            .bind(status.to_string())
            .fetch_all(self.mm.pool())
            .await?;
        rows.into_iter().map(Container::try_from).collect()
    }

    async fn list_running_of_type(&self, ctx: &Ctx, container_type: ContainerType) -> Result<Vec<Container>> {
        let rows: Vec<DbContainerRow> = sqlx::query_as(&format!(
            "{} where player_id = $1 and type = $2 and status = 'RUNNING' order by created_at",
            SELECT_COLUMNS
        ))
        .bind(ctx.player_id().0)
        .bind(container_type.to_string())
        .fetch_all(self.mm.pool())
        .await?;
        rows.into_iter().map(Container::try_from).collect()
    }

    async fn list_children(&self, ctx: &Ctx, parent_id: &ContainerId) -> Result<Vec<Container>> {
        let rows: Vec<DbContainerRow> = sqlx::query_as(&format!("{} where player_id = $1 and parent_id = $2 order by created_at", SELECT_COLUMNS))
            .bind(ctx.player_id().0)
            .bind(&parent_id.0)
            .fetch_all(self.mm.pool())
            .await?;
        rows.into_iter().map(Container::try_from).collect()
    }

    async fn create_if_no_running_of_type(&self, ctx: &Ctx, container: &Container) -> Result<bool> {
        let mut tx = self.mm.pool().begin().await?;
        let (count,): (i64,) = sqlx::query_as(
            r#"
select count(*) from containers
 where player_id = $1 and type = $2 and status in ('PENDING', 'RUNNING')
        "#,
        )
        .bind(ctx.player_id().0)
        .bind(container.container_type.to_string())
        .fetch_one(&mut *tx)
        .await?;

        if count > 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        Self::insert(&mut *tx, ctx, container).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn create_if_no_running_in_scope(&self, ctx: &Ctx, container: &Container, scope_fragment: &str) -> Result<bool> {
        let mut tx = self.mm.pool().begin().await?;
        let (count,): (i64,) = sqlx::query_as(
            r#"
select count(*) from containers
 where player_id = $1 and type = $2 and status in ('PENDING', 'RUNNING')
   and config::text like '%' || $3 || '%'
        "#,
        )
        .bind(ctx.player_id().0)
        .bind(container.container_type.to_string())
        .bind(scope_fragment)
        .fetch_one(&mut *tx)
        .await?;

        if count > 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        Self::insert(&mut *tx, ctx, container).await?;
        tx.commit().await?;
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryContainerBmc {
    containers: Arc<RwLock<Vec<Container>>>,
}

impl InMemoryContainerBmc {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContainerBmcTrait for InMemoryContainerBmc {
    async fn persist_container(&self, ctx: &Ctx, container: &Container) -> Result<()> {
        let mut containers = self.containers.write().await;
        let exists = containers
            .iter()
            .any(|c| c.id == container.id && c.player_id == ctx.player_id());
        if !exists {
            let mut stored = container.clone();
            stored.player_id = ctx.player_id();
            containers.push(stored);
        }
        Ok(())
    }

    async fn get_container(&self, ctx: &Ctx, id: &ContainerId) -> Result<Option<Container>> {
        let containers = self.containers.read().await;
        Ok(containers
            .iter()
            .find(|c| c.id == *id && c.player_id == ctx.player_id())
            .cloned())
    }

    async fn mark_running(&self, ctx: &Ctx, id: &ContainerId, at: DateTime<Utc>) -> Result<bool> {
        let mut containers = self.containers.write().await;
        match containers
            .iter_mut()
            .find(|c| c.id == *id && c.player_id == ctx.player_id() && c.status == ContainerStatus::Pending)
        {
            Some(container) => {
                container.status = ContainerStatus::Running;
                container.started_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_stopped(&self, ctx: &Ctx, id: &ContainerId, at: DateTime<Utc>, exit: &ContainerExit) -> Result<()> {
        let mut containers = self.containers.write().await;
        if let Some(container) = containers
            .iter_mut()
            .find(|c| c.id == *id && c.player_id == ctx.player_id() && c.status != ContainerStatus::Stopped)
        {
            container.status = ContainerStatus::Stopped;
            container.stopped_at = Some(at);
            container.exit_code = Some(exit.exit_code);
            container.exit_reason = Some(exit.exit_reason.clone());
        }
        Ok(())
    }

    async fn increment_restart_count(&self, ctx: &Ctx, id: &ContainerId) -> Result<i32> {
        let mut containers = self.containers.write().await;
        let container = containers
            .iter_mut()
            .find(|c| c.id == *id && c.player_id == ctx.player_id())
            .ok_or_else(|| anyhow::anyhow!("container {} not found", id))?;
        container.restart_count += 1;
        Ok(container.restart_count)
    }

    async fn list_by_status(&self, ctx: &Ctx, status: ContainerStatus) -> Result<Vec<Container>> {
        let containers = self.containers.read().await;
        Ok(containers
            .iter()
            .filter(|c| c.player_id == ctx.player_id() && c.status == status)
            .cloned()
            .collect())
    }

    async fn list_running_of_type(&self, ctx: &Ctx, container_type: ContainerType) -> Result<Vec<Container>> {
        let containers = self.containers.read().await;
        Ok(containers
            .iter()
            .filter(|c| c.player_id == ctx.player_id() && c.container_type == container_type && c.status == ContainerStatus::Running)
            .cloned()
            .collect())
    }

    async fn list_children(&self, ctx: &Ctx, parent_id: &ContainerId) -> Result<Vec<Container>> {
        let containers = self.containers.read().await;
        Ok(containers
            .iter()
            .filter(|c| c.player_id == ctx.player_id() && c.parent_id.as_ref() == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn create_if_no_running_of_type(&self, ctx: &Ctx, container: &Container) -> Result<bool> {
        let mut containers = self.containers.write().await;
        let live_of_type = containers.iter().any(|c| {
            c.player_id == ctx.player_id()
                && c.container_type == container.container_type
                && matches!(c.status, ContainerStatus::Pending | ContainerStatus::Running)
        });
        if live_of_type {
            return Ok(false);
        }
        let mut stored = container.clone();
        stored.player_id = ctx.player_id();
        containers.push(stored);
        Ok(true)
    }

    async fn create_if_no_running_in_scope(&self, ctx: &Ctx, container: &Container, scope_fragment: &str) -> Result<bool> {
        let mut containers = self.containers.write().await;
        let live_in_scope = containers.iter().any(|c| {
            c.player_id == ctx.player_id()
                && c.container_type == container.container_type
                && matches!(c.status, ContainerStatus::Pending | ContainerStatus::Running)
                && serde_json::to_string(&c.config)
                    .map(|blob| blob.contains(scope_fragment))
                    .unwrap_or(false)
        });
        if live_in_scope {
            return Ok(false);
        }
        let mut stored = container.clone();
        stored.player_id = ctx.player_id();
        containers.push(stored);
        Ok(true)
    }
}
