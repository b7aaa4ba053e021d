pub mod client;
pub mod error;
pub mod types;

use async_trait::async_trait;

use crate::model::RepairTask;

pub use client::HttpRepairStore;
pub use error::StoreError;
pub use types::TaskFilter;

/// The cluster repair store. Every write is accepted only against the
/// task's current version.
#[async_trait]
pub trait RepairStore: Send + Sync {
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<RepairTask>, StoreError>;

    async fn create(&self, task: &RepairTask) -> Result<u64, StoreError>;

    /// Persist the task's state, data, target and impact; returns the new version.
    async fn update_execution_state(&self, task: &RepairTask) -> Result<u64, StoreError>;

    async fn cancel(&self, task: &RepairTask) -> Result<u64, StoreError>;
}
