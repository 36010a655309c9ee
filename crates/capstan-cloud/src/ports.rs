use async_trait::async_trait;
use thiserror::Error;

use capstan_types::{FleetResult, FleetSpec, InstanceFilter, RunnerInstance};

/// Instance inventory and lifecycle. Terminate and tag operations are
/// idempotent; repeating them converges to the same state.
#[async_trait]
pub trait FleetOps: Send + Sync {
    /// Managed instances matching the filter, paginated transparently.
    async fn list_runners(&self, filter: &InstanceFilter) -> anyhow::Result<Vec<RunnerInstance>>;

    /// One bulk create. Partial fulfilment is not an error at this
    /// layer: whatever instances materialised are returned together
    /// with the per-failure error codes.
    async fn create_fleet(&self, spec: &FleetSpec) -> anyhow::Result<FleetResult>;

    async fn terminate(&self, instance_id: &str) -> anyhow::Result<()>;

    async fn tag(&self, instance_id: &str, tags: &[(String, String)]) -> anyhow::Result<()>;

    async fn untag(&self, instance_id: &str, tags: &[(String, String)]) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum ParamStoreError {
    #[error("parameter `{0}` not found")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Secret parameter store. Writes are blind overwrites; reads fail
/// distinctly when the parameter does not exist so callers can treat
/// cache misses as misses.
#[async_trait]
pub trait ParamStore: Send + Sync {
    async fn put_secret(
        &self,
        path: &str,
        value: &str,
        tags: &[(String, String)],
    ) -> anyhow::Result<()>;

    async fn put_parameter(&self, name: &str, value: &str) -> anyhow::Result<()>;

    async fn get_parameter(&self, name: &str) -> Result<String, ParamStoreError>;
}

/// Durable queue publisher used by the retry layer.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    async fn send_with_delay(
        &self,
        queue_url: &str,
        body: &str,
        delay_seconds: u32,
    ) -> anyhow::Result<()>;
}
