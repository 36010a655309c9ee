use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, Level};

use capstan_cloud::FleetOps;
use capstan_config::PoolConfig;
use capstan_observability::{emit_event, ControlEvent};
use capstan_github::RunnerApiFactory;
use capstan_types::{InstanceFilter, RunnerCreator, RunnerScope};

use crate::provision::RunnerProvisioner;

/// Pool top-up loop: keeps at least N idle instances warm for one
/// owning scope by launching the shortfall through the scale-up
/// provisioning primitives (creator = pool).
pub struct PoolManager {
    pool: PoolConfig,
    boot_time_minutes: i64,
    provisioner: RunnerProvisioner,
    fleet: Arc<dyn FleetOps>,
    github: Arc<dyn RunnerApiFactory>,
}

impl PoolManager {
    pub fn new(
        pool: PoolConfig,
        boot_time_minutes: i64,
        provisioner: RunnerProvisioner,
        fleet: Arc<dyn FleetOps>,
        github: Arc<dyn RunnerApiFactory>,
    ) -> Self {
        Self {
            pool,
            boot_time_minutes,
            provisioner,
            fleet,
            github,
        }
    }

    fn scope(&self) -> RunnerScope {
        match self.pool.owner.split_once('/') {
            Some((owner, name)) => RunnerScope::Repo {
                owner: owner.to_string(),
                name: name.to_string(),
            },
            None => RunnerScope::Org(self.pool.owner.clone()),
        }
    }

    /// One top-up pass. Returns how many instances were launched.
    #[instrument(skip_all, fields(owner = %self.pool.owner, target = self.pool.size))]
    pub async fn adjust(&self) -> anyhow::Result<usize> {
        let scope = self.scope();
        let client = self.github.for_scope(&scope, 0).await?;
        let runners = client.list_runners().await?;

        let filter = InstanceFilter::for_environment(&self.provisioner.config().environment)
            .owned_by(scope.key())
            .running_only();
        let instances = self.fleet.list_runners(&filter).await?;

        // In pool: registered, online and idle — or unregistered but
        // still within its boot window.
        let now = Utc::now();
        let pool = instances
            .iter()
            .filter(|instance| {
                let matched = runners
                    .iter()
                    .find(|runner| runner.name.ends_with(&instance.instance_id));
                match matched {
                    Some(runner) => runner.is_online() && !runner.busy,
                    None => instance.age_minutes(now) < self.boot_time_minutes,
                }
            })
            .count();

        let top_up = self.pool.size.saturating_sub(pool);
        if top_up == 0 {
            info!(pool, "pool is at or above target");
            return Ok(0);
        }

        info!(pool, top_up, "topping up pool");
        let created = self
            .provisioner
            .create_runners(&scope, RunnerCreator::Pool, top_up)
            .await?;
        self.provisioner
            .provision_secrets(&scope, &client, &created)
            .await?;
        let scope_key = scope.key();
        emit_event(
            Level::INFO,
            ControlEvent::new("pool.topped-up", "pool")
                .scope(&scope_key)
                .counts(top_up, created.len()),
        );
        Ok(created.len())
    }
}
