pub mod client;
pub mod error;
pub mod types;

use async_trait::async_trait;

use crate::model::Snapshot;

pub use client::HttpPolicyAgentChannel;
pub use error::ChannelError;
pub use types::{RepairAction, StatusChange, StepResponse};

/// The control plane's maintenance job feed, as seen by the coordinator.
#[async_trait]
pub trait PolicyAgentChannel: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<Snapshot, ChannelError>;

    async fn acknowledge(
        &self,
        job_id: &str,
        response: StepResponse,
        delete_step_if_present: bool,
    ) -> Result<(), ChannelError>;

    /// Ask the control plane to create a job for `role_instance`. The job will
    /// carry `context_token` so it can be correlated later.
    async fn request_repair(
        &self,
        role_instance: &str,
        action: RepairAction,
        context_token: Option<&str>,
    ) -> Result<(), ChannelError>;

    async fn request_status_change(
        &self,
        job_id: &str,
        change: StatusChange,
    ) -> Result<(), ChannelError>;
}
