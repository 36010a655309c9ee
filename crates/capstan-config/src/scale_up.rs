use serde::{Deserialize, Serialize};

use capstan_types::{AllocationStrategy, CapacityType};

use crate::env;

/// Everything the scale-up dispatcher (and the pool loop, which reuses
/// its provisioning primitives) needs to know.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleUpConfig {
    /// Deployment partition; becomes the `ghr:environment` tag.
    pub environment: String,
    pub launch_template: String,
    pub subnets: Vec<String>,
    pub instance_types: Vec<String>,
    /// Org-level runners: scope = owner. Off: scope = owner/repo.
    pub org_runners: bool,
    /// Ephemeral runners accept exactly one job; only workflow_job
    /// events may scale them.
    pub ephemeral: bool,
    /// Just-in-time registration; only meaningful with `ephemeral`.
    pub jit_config: bool,
    /// Re-check that each job is still queued before creating capacity.
    pub queued_check: bool,
    pub disable_autoupdate: bool,
    /// Per-scope instance budget; -1 disables the cap (and the
    /// inventory query that feeds it).
    pub max_runners: i32,
    pub runner_labels: Vec<String>,
    pub runner_group_name: Option<String>,
    pub name_prefix: String,
    /// Parameter-store prefix for per-instance registration secrets.
    pub token_path: String,
    /// Parameter-store prefix for the runner-group id cache.
    pub config_path: String,
    pub allocation_strategy: AllocationStrategy,
    pub max_spot_price: Option<String>,
    pub capacity_type: CapacityType,
    /// Launch-template AMI override, resolved through this parameter.
    pub ami_ssm_parameter: Option<String>,
    /// Fleet error codes that trigger a one-shot on-demand retry of the
    /// unfulfilled remainder.
    pub on_demand_failover_codes: Vec<String>,
}

impl ScaleUpConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let ephemeral = env::flag("ENABLE_EPHEMERAL_RUNNERS");
        Ok(Self {
            environment: env::required("ENVIRONMENT")?,
            launch_template: env::required("LAUNCH_TEMPLATE_NAME")?,
            subnets: env::list("SUBNET_IDS"),
            instance_types: env::list("INSTANCE_TYPES"),
            org_runners: env::flag("ENABLE_ORGANIZATION_RUNNERS"),
            ephemeral,
            jit_config: env::flag("ENABLE_JIT_CONFIG") || ephemeral,
            queued_check: env::flag("ENABLE_JOB_QUEUED_CHECK"),
            disable_autoupdate: env::flag("DISABLE_RUNNER_AUTOUPDATE"),
            max_runners: env::integer("RUNNERS_MAXIMUM_COUNT", 3)?,
            runner_labels: env::list("RUNNER_LABELS"),
            runner_group_name: env::optional("RUNNER_GROUP_NAME"),
            name_prefix: env::optional("RUNNER_NAME_PREFIX").unwrap_or_default(),
            token_path: env::required("SSM_TOKEN_PATH")?
                .trim_end_matches('/')
                .to_string(),
            config_path: env::required("SSM_CONFIG_PATH")?
                .trim_end_matches('/')
                .to_string(),
            allocation_strategy: parse_allocation_strategy(
                env::optional("INSTANCE_ALLOCATION_STRATEGY").as_deref(),
            )?,
            max_spot_price: env::optional("INSTANCE_MAX_SPOT_PRICE"),
            capacity_type: parse_capacity_type(
                env::optional("INSTANCE_TARGET_CAPACITY_TYPE").as_deref(),
            )?,
            ami_ssm_parameter: env::optional("AMI_ID_SSM_PARAMETER_NAME"),
            on_demand_failover_codes: parse_failover_codes(
                env::optional("ENABLE_ON_DEMAND_FAILOVER_FOR_ERRORS").as_deref(),
            )?,
        })
    }

    /// Secret path for one instance's registration material.
    pub fn token_parameter(&self, instance_id: &str) -> String {
        format!("{}/{}", self.token_path, instance_id)
    }

    /// Cache path for one runner group's id.
    pub fn group_parameter(&self, group_name: &str) -> String {
        format!("{}/runner-group/{}", self.config_path, group_name)
    }

    pub fn unbounded(&self) -> bool {
        self.max_runners == -1
    }
}

fn parse_allocation_strategy(raw: Option<&str>) -> anyhow::Result<AllocationStrategy> {
    match raw {
        None => Ok(AllocationStrategy::default()),
        Some("lowest-price") => Ok(AllocationStrategy::LowestPrice),
        Some("diversified") => Ok(AllocationStrategy::Diversified),
        Some("capacity-optimized") => Ok(AllocationStrategy::CapacityOptimized),
        Some("price-capacity-optimized") => Ok(AllocationStrategy::PriceCapacityOptimized),
        Some(other) => anyhow::bail!("unknown allocation strategy `{other}`"),
    }
}

fn parse_capacity_type(raw: Option<&str>) -> anyhow::Result<CapacityType> {
    match raw {
        None | Some("spot") => Ok(CapacityType::Spot),
        Some("on-demand") => Ok(CapacityType::OnDemand),
        Some(other) => anyhow::bail!("unknown target capacity type `{other}`"),
    }
}

/// Accepts a JSON array (`["InsufficientInstanceCapacity"]`) or a plain
/// comma-separated list.
fn parse_failover_codes(raw: Option<&str>) -> anyhow::Result<Vec<String>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    if raw.trim_start().starts_with('[') {
        return serde_json::from_str(raw)
            .map_err(|e| anyhow::anyhow!("ENABLE_ON_DEMAND_FAILOVER_FOR_ERRORS is not valid JSON: {e}"));
    }
    Ok(raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}
