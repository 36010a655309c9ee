use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scope::RunnerKind;

/// Tag keys and fixed values carried by every managed instance. The
/// application marker is the authoritative membership predicate; the
/// environment tag partitions fleets managed by distinct deployments.
pub mod tags {
    pub const APPLICATION: &str = "ghr:Application";
    pub const APPLICATION_VALUE: &str = "capstan";
    pub const ENVIRONMENT: &str = "ghr:environment";
    pub const TYPE: &str = "Type";
    pub const OWNER: &str = "Owner";
    pub const CREATED_BY: &str = "ghr:created_by";
    pub const RUNNER_ID: &str = "ghr:github_runner_id";
    pub const ORPHAN: &str = "ghr:orphan";
}

/// Which control loop asked for an instance. Always supplied by the
/// caller, never inferred from the request size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunnerCreator {
    ScaleUp,
    Pool,
}

impl RunnerCreator {
    pub fn as_tag(self) -> &'static str {
        match self {
            RunnerCreator::ScaleUp => "scale-up",
            RunnerCreator::Pool => "pool",
        }
    }
}

/// Lifecycle states the inventory queries care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
}

impl InstanceState {
    pub fn as_filter(self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
        }
    }
}

/// Projection of a live cloud instance. Instances are the sole durable
/// representation of controller state; everything here comes from tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerInstance {
    pub instance_id: String,
    pub launch_time: Option<DateTime<Utc>>,
    /// `Owner` tag value: org name or `owner/repo`.
    pub owner: String,
    pub kind: RunnerKind,
    /// `ghr:github_runner_id` tag, present once registration has been
    /// observed. Monotonic: set once, never cleared.
    pub runner_id: Option<i64>,
    /// `ghr:orphan` tag, set and cleared only by the scale-down reaper.
    pub orphan: bool,
}

impl RunnerInstance {
    /// Minutes since launch, saturating at zero. Instances with no
    /// recorded launch time count as arbitrarily old.
    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        match self.launch_time {
            Some(launched) => (now - launched).num_minutes().max(0),
            None => i64::MAX,
        }
    }
}

/// Inventory query predicates. `orphan` narrows to instances carrying
/// the orphan tag; owner/states narrow by tag and lifecycle state.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub environment: String,
    pub owner: Option<String>,
    pub states: Vec<InstanceState>,
    pub orphan: bool,
}

impl InstanceFilter {
    pub fn for_environment(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            owner: None,
            states: vec![InstanceState::Pending, InstanceState::Running],
            orphan: false,
        }
    }

    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn orphans_only(mut self) -> Self {
        self.orphan = true;
        self
    }

    pub fn running_only(mut self) -> Self {
        self.states = vec![InstanceState::Running];
        self
    }
}
