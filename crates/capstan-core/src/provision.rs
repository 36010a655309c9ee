use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use capstan_cloud::{is_retriable_fleet_error, FleetOps, ParamStore, ParamStoreError};
use capstan_config::ScaleUpConfig;
use capstan_observability::redact_secret;
use capstan_github::RunnerApi;
use capstan_types::{
    managed_instance_tags, tags, CapacityType, FleetSpec, RunnerCreator, RunnerScope,
};

use crate::error::ScaleError;

/// Default runner group; repo-level runners always register here.
const DEFAULT_RUNNER_GROUP_ID: i64 = 1;

/// Secret writes above this rate need spacing to stay under the
/// parameter store's sustained write rate.
const SECRET_PACING_THRESHOLD: usize = 40;
const SECRET_PACING: Duration = Duration::from_millis(25);
const SECRET_WORKERS: usize = 8;

/// Shared provisioning primitives: one bulk instance create plus the
/// per-instance registration secrets. Used by the scale-up dispatcher
/// and the pool top-up loop; the creator tag is always the caller's.
pub struct RunnerProvisioner {
    config: ScaleUpConfig,
    /// Web base for runner registration URLs (not the API endpoint).
    server_url: String,
    fleet: Arc<dyn FleetOps>,
    params: Arc<dyn ParamStore>,
}

impl RunnerProvisioner {
    pub fn new(
        config: ScaleUpConfig,
        server_url: impl Into<String>,
        fleet: Arc<dyn FleetOps>,
        params: Arc<dyn ParamStore>,
    ) -> Self {
        Self {
            config,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            fleet,
            params,
        }
    }

    pub fn config(&self) -> &ScaleUpConfig {
        &self.config
    }

    /// One bulk create for `count` instances in `scope`. Returns the
    /// instance ids that materialised; a short (but non-empty) result is
    /// not an error. Zero instances classify the error codes: any
    /// retriable code makes the whole request retriable.
    pub async fn create_runners(
        &self,
        scope: &RunnerScope,
        creator: RunnerCreator,
        count: usize,
    ) -> Result<Vec<String>, ScaleError> {
        let ami_id = self.resolve_ami().await.map_err(ScaleError::Cloud)?;
        let spec = FleetSpec {
            count,
            launch_template: self.config.launch_template.clone(),
            subnets: self.config.subnets.clone(),
            instance_types: self.config.instance_types.clone(),
            ami_id,
            allocation_strategy: self.config.allocation_strategy,
            max_spot_price: self.config.max_spot_price.clone(),
            capacity_type: self.config.capacity_type,
            instance_tags: managed_instance_tags(
                &self.config.environment,
                scope.kind(),
                &scope.key(),
                creator,
            ),
        };

        let mut result = self
            .fleet
            .create_fleet(&spec)
            .await
            .map_err(ScaleError::Cloud)?;

        // One-shot on-demand failover for the unfulfilled remainder when
        // every failure is a code the deployment opted in for.
        let shortfall = count.saturating_sub(result.instance_ids.len());
        if shortfall > 0
            && spec.capacity_type == CapacityType::Spot
            && !self.config.on_demand_failover_codes.is_empty()
            && !result.error_codes.is_empty()
            && result
                .error_codes
                .iter()
                .all(|code| self.config.on_demand_failover_codes.contains(code))
        {
            info!(
                scope = %scope,
                shortfall,
                errors = ?result.error_codes,
                "retrying unfulfilled spot capacity with on-demand"
            );
            let failover_spec = FleetSpec {
                count: shortfall,
                capacity_type: CapacityType::OnDemand,
                ..spec.clone()
            };
            let failover = self
                .fleet
                .create_fleet(&failover_spec)
                .await
                .map_err(ScaleError::Cloud)?;
            result.instance_ids.extend(failover.instance_ids);
            result.error_codes = failover.error_codes;
        }

        if result.instance_ids.is_empty() && count > 0 {
            if result
                .error_codes
                .iter()
                .any(|code| is_retriable_fleet_error(code))
            {
                return Err(ScaleError::Retriable {
                    failed_instance_count: count,
                    error_codes: result.error_codes,
                });
            }
            return Err(ScaleError::Fatal {
                error_codes: result.error_codes,
            });
        }

        if !result.error_codes.is_empty() {
            warn!(
                scope = %scope,
                created = result.instance_ids.len(),
                requested = count,
                errors = ?result.error_codes,
                "fleet came back short"
            );
        }
        Ok(result.instance_ids)
    }

    /// Provision one registration secret per created instance: a JIT
    /// blob when just-in-time registration is on, the runner config
    /// argument string otherwise. The booting instance polls its secret
    /// path, so writes may land after boot begins.
    pub async fn provision_secrets(
        &self,
        scope: &RunnerScope,
        github: &Arc<dyn RunnerApi>,
        instance_ids: &[String],
    ) -> anyhow::Result<()> {
        if instance_ids.is_empty() {
            return Ok(());
        }
        if self.config.ephemeral && self.config.jit_config {
            let group_id = self.runner_group_id(scope, github).await?;
            self.for_each_instance(instance_ids, |instance_id| {
                self.provision_jit(scope, github, group_id, instance_id)
            })
            .await
        } else {
            let token = github
                .create_registration_token()
                .await
                .with_context(|| format!("registration token for `{scope}`"))?;
            debug!(scope = %scope, token = %redact_secret(&token.token), "registration token issued");
            let runner_config = self.runner_config_string(scope, &token.token);
            self.for_each_instance(instance_ids, |instance_id| {
                let runner_config = runner_config.clone();
                async move {
                    self.put_instance_secret(instance_id, &runner_config).await
                }
            })
            .await
        }
    }

    async fn provision_jit(
        &self,
        scope: &RunnerScope,
        github: &Arc<dyn RunnerApi>,
        group_id: i64,
        instance_id: &str,
    ) -> anyhow::Result<()> {
        let name = format!("{}{}", self.config.name_prefix, instance_id);
        let jit = github
            .generate_jit_config(&name, group_id, &self.config.runner_labels)
            .await
            .with_context(|| format!("JIT config for `{name}`"))?;
        self.fleet
            .tag(
                instance_id,
                &[(tags::RUNNER_ID.to_string(), jit.runner.id.to_string())],
            )
            .await
            .with_context(|| format!("tagging runner id on `{instance_id}`"))?;
        self.put_instance_secret(instance_id, &jit.encoded_jit_config)
            .await
    }

    async fn put_instance_secret(&self, instance_id: &str, value: &str) -> anyhow::Result<()> {
        debug!(
            instance = instance_id,
            secret = %redact_secret(value),
            "writing registration secret"
        );
        self.params
            .put_secret(
                &self.config.token_parameter(instance_id),
                value,
                &[("InstanceId".to_string(), instance_id.to_string())],
            )
            .await
            .with_context(|| format!("writing registration secret for `{instance_id}`"))
    }

    /// Bounded fan-out over the created instances. Large batches fall
    /// back to a paced sequential loop to respect the parameter-store
    /// write rate.
    async fn for_each_instance<'a, F, Fut>(
        &self,
        instance_ids: &'a [String],
        work: F,
    ) -> anyhow::Result<()>
    where
        F: Fn(&'a str) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        if instance_ids.len() >= SECRET_PACING_THRESHOLD {
            for instance_id in instance_ids {
                work(instance_id.as_str()).await?;
                tokio::time::sleep(SECRET_PACING).await;
            }
            return Ok(());
        }
        let results: Vec<anyhow::Result<()>> = stream::iter(instance_ids)
            .map(|instance_id| work(instance_id.as_str()))
            .buffer_unordered(SECRET_WORKERS)
            .collect()
            .await;
        results.into_iter().collect()
    }

    /// The argument string the runner service config consumes, stored
    /// as the instance's registration secret in non-JIT mode.
    fn runner_config_string(&self, scope: &RunnerScope, token: &str) -> String {
        let mut parts = vec![
            format!("--url {}/{}", self.server_url, scope.key()),
            format!("--token {token}"),
        ];
        if !self.config.runner_labels.is_empty() {
            parts.push(format!("--labels {}", self.config.runner_labels.join(",")));
        }
        if self.config.disable_autoupdate {
            parts.push("--disableupdate".to_string());
        }
        if self.config.org_runners {
            if let Some(group) = &self.config.runner_group_name {
                parts.push(format!("--runnergroup {group}"));
            }
        }
        if self.config.ephemeral {
            parts.push("--ephemeral".to_string());
        }
        parts.join(" ")
    }

    /// Runner group id for JIT registration. Org groups resolve through
    /// the parameter-store cache first; a cache miss is not an error,
    /// only absence of the group upstream is.
    async fn runner_group_id(
        &self,
        scope: &RunnerScope,
        github: &Arc<dyn RunnerApi>,
    ) -> anyhow::Result<i64> {
        if scope.kind() != capstan_types::RunnerKind::Org {
            return Ok(DEFAULT_RUNNER_GROUP_ID);
        }
        let Some(group_name) = self.config.runner_group_name.clone() else {
            return Ok(DEFAULT_RUNNER_GROUP_ID);
        };
        let parameter = self.config.group_parameter(&group_name);
        match self.params.get_parameter(&parameter).await {
            Ok(raw) => raw
                .parse::<i64>()
                .with_context(|| format!("cached runner group id `{raw}` is not a number")),
            Err(ParamStoreError::NotFound(_)) => {
                debug!(group = %group_name, "runner group cache miss, asking upstream");
                let id = github
                    .runner_group_id(&group_name)
                    .await?
                    .with_context(|| format!("runner group `{group_name}` not found upstream"))?;
                self.params.put_parameter(&parameter, &id.to_string()).await?;
                Ok(id)
            }
            Err(ParamStoreError::Other(e)) => Err(e),
        }
    }

    async fn resolve_ami(&self) -> anyhow::Result<Option<String>> {
        let Some(parameter) = &self.config.ami_ssm_parameter else {
            return Ok(None);
        };
        let ami = self
            .params
            .get_parameter(parameter)
            .await
            .with_context(|| format!("resolving AMI from `{parameter}`"))?;
        Ok(Some(ami))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use capstan_types::{FleetResult, RunnerKind};

    use crate::testing::{scale_up_config, MockFleet, MockGithub, MockParams};

    fn provisioner(
        config: capstan_config::ScaleUpConfig,
        fleet: Arc<MockFleet>,
        params: Arc<MockParams>,
    ) -> RunnerProvisioner {
        RunnerProvisioner::new(config, "https://github.com", fleet, params)
    }

    #[tokio::test]
    async fn failover_retries_the_shortfall_on_demand() {
        let mut config = scale_up_config();
        config.on_demand_failover_codes = vec!["InsufficientInstanceCapacity".to_string()];
        let fleet = Arc::new(MockFleet::default());
        fleet.script_fleet_result(FleetResult {
            instance_ids: vec!["i-spot".to_string()],
            error_codes: vec!["InsufficientInstanceCapacity".to_string()],
        });
        fleet.script_fleet_result(FleetResult {
            instance_ids: vec!["i-od".to_string()],
            error_codes: Vec::new(),
        });
        let p = provisioner(config, fleet.clone(), Arc::new(MockParams::default()));

        let created = p
            .create_runners(
                &RunnerScope::Org("acme".to_string()),
                RunnerCreator::ScaleUp,
                2,
            )
            .await
            .unwrap();

        assert_eq!(created, vec!["i-spot", "i-od"]);
        let specs = fleet.created_specs.lock().unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].count, 1);
        assert_eq!(specs[1].capacity_type, CapacityType::OnDemand);
    }

    #[tokio::test]
    async fn failover_is_skipped_for_unlisted_codes() {
        let mut config = scale_up_config();
        config.on_demand_failover_codes = vec!["InsufficientInstanceCapacity".to_string()];
        let fleet = Arc::new(MockFleet::default());
        fleet.script_fleet_result(FleetResult {
            instance_ids: vec!["i-spot".to_string()],
            error_codes: vec!["RequestLimitExceeded".to_string()],
        });
        let p = provisioner(config, fleet.clone(), Arc::new(MockParams::default()));

        let created = p
            .create_runners(
                &RunnerScope::Org("acme".to_string()),
                RunnerCreator::ScaleUp,
                2,
            )
            .await
            .unwrap();

        assert_eq!(created, vec!["i-spot"]);
        assert_eq!(fleet.created_specs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn runner_group_cache_miss_resolves_upstream_and_caches() {
        let mut config = scale_up_config();
        config.runner_group_name = Some("default".to_string());
        let params = Arc::new(MockParams::default());
        let fleet = Arc::new(MockFleet::default());
        let github = Arc::new(MockGithub::default());
        github.groups.lock().unwrap().insert("default".to_string(), 12);
        let p = provisioner(config.clone(), fleet, params.clone());

        let client: Arc<dyn capstan_github::RunnerApi> = github;
        let id = p
            .runner_group_id(&RunnerScope::Org("acme".to_string()), &client)
            .await
            .unwrap();

        assert_eq!(id, 12);
        assert_eq!(
            params.store.lock().unwrap().get(&config.group_parameter("default")),
            Some(&"12".to_string())
        );
    }

    #[tokio::test]
    async fn runner_group_cache_hit_skips_upstream() {
        let mut config = scale_up_config();
        config.runner_group_name = Some("default".to_string());
        let params = Arc::new(MockParams::with_parameter(
            &config.group_parameter("default"),
            "31",
        ));
        let github = Arc::new(MockGithub::default());
        let p = provisioner(config, Arc::new(MockFleet::default()), params);

        let client: Arc<dyn capstan_github::RunnerApi> = github.clone();
        let id = p
            .runner_group_id(&RunnerScope::Org("acme".to_string()), &client)
            .await
            .unwrap();

        // No upstream group configured in the mock: a lookup would fail.
        assert_eq!(id, 31);
        assert!(github.groups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn repo_scopes_use_the_default_group() {
        let mut config = scale_up_config();
        config.org_runners = false;
        config.runner_group_name = Some("default".to_string());
        let github = Arc::new(MockGithub::default());
        let p = provisioner(
            config,
            Arc::new(MockFleet::default()),
            Arc::new(MockParams::default()),
        );

        let client: Arc<dyn capstan_github::RunnerApi> = github;
        let scope = RunnerScope::Repo {
            owner: "acme".to_string(),
            name: "widgets".to_string(),
        };
        assert_eq!(p.runner_group_id(&scope, &client).await.unwrap(), 1);
        assert_eq!(scope.kind(), RunnerKind::Repo);
    }

    #[tokio::test]
    async fn ami_override_is_resolved_from_the_parameter_store() {
        let mut config = scale_up_config();
        config.ami_ssm_parameter = Some("/capstan/ami".to_string());
        let params = Arc::new(MockParams::with_parameter("/capstan/ami", "ami-0abc"));
        let fleet = Arc::new(MockFleet::default());
        let p = provisioner(config, fleet.clone(), params);

        p.create_runners(
            &RunnerScope::Org("acme".to_string()),
            RunnerCreator::Pool,
            1,
        )
        .await
        .unwrap();

        let specs = fleet.created_specs.lock().unwrap();
        assert_eq!(specs[0].ami_id.as_deref(), Some("ami-0abc"));
        assert!(specs[0]
            .instance_tags
            .contains(&(tags::CREATED_BY.to_string(), "pool".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn large_batches_write_secrets_sequentially() {
        let config = scale_up_config();
        let params = Arc::new(MockParams::default());
        let github = Arc::new(MockGithub::default());
        let p = provisioner(config, Arc::new(MockFleet::default()), params.clone());

        let instance_ids: Vec<String> = (0..45).map(|n| format!("i-{n:03}")).collect();
        let client: Arc<dyn capstan_github::RunnerApi> = github;
        p.provision_secrets(&RunnerScope::Org("acme".to_string()), &client, &instance_ids)
            .await
            .unwrap();

        let writes = params.secret_writes.lock().unwrap();
        assert_eq!(writes.len(), 45);
        // Sequential path preserves instance order.
        assert!(writes[0].0.ends_with("i-000"));
        assert!(writes[44].0.ends_with("i-044"));
    }
}
