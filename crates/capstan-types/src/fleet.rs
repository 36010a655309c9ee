use serde::{Deserialize, Serialize};

use crate::instance::{tags, RunnerCreator};
use crate::scope::RunnerKind;

/// Spot allocation strategy, wire values as EC2 spells them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationStrategy {
    LowestPrice,
    Diversified,
    CapacityOptimized,
    #[default]
    PriceCapacityOptimized,
}

impl AllocationStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            AllocationStrategy::LowestPrice => "lowest-price",
            AllocationStrategy::Diversified => "diversified",
            AllocationStrategy::CapacityOptimized => "capacity-optimized",
            AllocationStrategy::PriceCapacityOptimized => "price-capacity-optimized",
        }
    }
}

/// Default purchasing model for fleet capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CapacityType {
    #[default]
    Spot,
    OnDemand,
}

/// One bulk-create request: N instances from a launch template with
/// per-(subnet, instance-type) overrides. The tag specification rides
/// on the call itself, so no window exists where a managed instance
/// lacks its marker tags.
#[derive(Debug, Clone)]
pub struct FleetSpec {
    pub count: usize,
    pub launch_template: String,
    pub subnets: Vec<String>,
    pub instance_types: Vec<String>,
    /// Resolved AMI override; `None` keeps the launch template's image.
    pub ami_id: Option<String>,
    pub allocation_strategy: AllocationStrategy,
    pub max_spot_price: Option<String>,
    pub capacity_type: CapacityType,
    pub instance_tags: Vec<(String, String)>,
}

/// Outcome of a bulk create: whatever instances materialised plus the
/// per-failure error codes the fleet API reported.
#[derive(Debug, Clone, Default)]
pub struct FleetResult {
    pub instance_ids: Vec<String>,
    pub error_codes: Vec<String>,
}

/// The tag set every managed instance must carry at create time.
pub fn managed_instance_tags(
    environment: &str,
    kind: RunnerKind,
    owner: &str,
    creator: RunnerCreator,
) -> Vec<(String, String)> {
    vec![
        (tags::APPLICATION.to_string(), tags::APPLICATION_VALUE.to_string()),
        (tags::ENVIRONMENT.to_string(), environment.to_string()),
        (tags::TYPE.to_string(), kind.as_tag().to_string()),
        (tags::OWNER.to_string(), owner.to_string()),
        (tags::CREATED_BY.to_string(), creator.as_tag().to_string()),
    ]
}
