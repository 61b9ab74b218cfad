use crate::{Ctx, DbModelManager};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_domain::{ContainerId, ContainerLogEntry, LogLevel, PlayerId};
use mockall::automock;
use sqlx::FromRow;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

#[automock]
#[async_trait]
pub trait ContainerLogBmcTrait: Send + Sync + Debug {
    async fn append(&self, ctx: &Ctx, entry: &ContainerLogEntry) -> Result<()>;
    async fn list_recent(&self, ctx: &Ctx, container_id: &ContainerId, limit: i64) -> Result<Vec<ContainerLogEntry>>;
}

#[derive(Debug, FromRow)]
struct DbContainerLogRow {
    container_id: String,
    player_id: i64,
    timestamp: DateTime<Utc>,
    level: String,
    message: String,
    metadata: Option<serde_json::Value>,
}

impl TryFrom<DbContainerLogRow> for ContainerLogEntry {
    type Error = anyhow::Error;

    fn try_from(row: DbContainerLogRow) -> Result<Self> {
        Ok(ContainerLogEntry {
            container_id: ContainerId(row.container_id),
            player_id: PlayerId(row.player_id),
            timestamp: row.timestamp,
            level: LogLevel::from_str(&row.level).map_err(anyhow::Error::from)?,
            message: row.message,
            metadata: row.metadata,
        })
    }
}

#[derive(Debug)]
pub struct DbContainerLogBmc {
    pub mm: DbModelManager,
}

#[async_trait]
impl ContainerLogBmcTrait for DbContainerLogBmc {
    async fn append(&self, ctx: &Ctx, entry: &ContainerLogEntry) -> Result<()> {
        sqlx::query(
            r#"
insert into container_logs (container_id, player_id, timestamp, level, message, metadata)
values ($1, $2, $3, $4, $5, $6)
        "#,
        )
        .bind(&entry.container_id.0)
        .bind(ctx.player_id().0)
        .bind(entry.timestamp)
        .bind(entry.level.to_string())
        .bind(&entry.message)
        .bind(&entry.metadata)
        .execute(self.mm.pool())
        .await?;
        Ok(())
    }

    async fn list_recent(&self, ctx: &Ctx, container_id: &ContainerId, limit: i64) -> Result<Vec<ContainerLogEntry>> {
        let rows: Vec<DbContainerLogRow> = sqlx::query_as(
            r#"
select container_id, player_id, timestamp, level, message, metadata
  from container_logs
 where player_id = $1 and container_id = $2
 order by timestamp desc
 limit $3
        "#,
        )
        .bind(ctx.player_id().0)
        .bind(&container_id.0)
        .bind(limit)
        .fetch_all(self.mm.pool())
        .await?;
        rows.into_iter().map(ContainerLogEntry::try_from).collect()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryContainerLogBmc {
    entries: Arc<RwLock<Vec<ContainerLogEntry>>>,
}

impl InMemoryContainerLogBmc {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_entries(&self) -> Vec<ContainerLogEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl ContainerLogBmcTrait for InMemoryContainerLogBmc {
    async fn append(&self, ctx: &Ctx, entry: &ContainerLogEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        let mut stored = entry.clone();
        stored.player_id = ctx.player_id();
        entries.push(stored);
        Ok(())
    }

    async fn list_recent(&self, ctx: &Ctx, container_id: &ContainerId, limit: i64) -> Result<Vec<ContainerLogEntry>> {
        let entries = self.entries.read().await;
        let mut found: Vec<ContainerLogEntry> = entries
            .iter()
            .filter(|e| e.player_id == ctx.player_id() && e.container_id == *container_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        found.truncate(limit as usize);
        Ok(found)
    }
}
