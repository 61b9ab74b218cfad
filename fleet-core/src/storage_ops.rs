use anyhow::Result;
use async_trait::async_trait;
use fleet_domain::StorageOperationView;
use fleet_store::Ctx;
use mockall::automock;
use std::fmt::Debug;

/// Read-model of external storage operations; STORAGE_ACQUIRE_DELIVER tasks
/// become READY only while their operation is RUNNING with stock on a
/// storage ship.
#[automock]
#[async_trait]
pub trait StorageOperationsProvider: Send + Sync + Debug {
    async fn list_operations(&self, ctx: &Ctx) -> Result<Vec<StorageOperationView>>;
}

/// Default provider for players without storage operations.
#[derive(Debug, Default)]
pub struct NoStorageOperations;

#[async_trait]
impl StorageOperationsProvider for NoStorageOperations {
    async fn list_operations(&self, _ctx: &Ctx) -> Result<Vec<StorageOperationView>> {
        Ok(vec![])
    }
}
