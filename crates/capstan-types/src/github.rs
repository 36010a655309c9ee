use serde::{Deserialize, Serialize};

/// Status of a queued workflow job as the jobs endpoint reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
    Waiting,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub id: i64,
    pub status: JobStatus,
}

/// A self-hosted runner as the upstream service lists it. Status is
/// kept as the raw string; only `"online"` and `"offline"` matter to
/// the controller and new states must not break deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfHostedRunner {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub busy: bool,
}

impl SelfHostedRunner {
    pub fn is_online(&self) -> bool {
        self.status == "online"
    }

    pub fn is_offline(&self) -> bool {
        self.status == "offline"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerList {
    pub total_count: i64,
    pub runners: Vec<SelfHostedRunner>,
}

/// Response to a just-in-time config generation call.
#[derive(Debug, Clone, Deserialize)]
pub struct JitConfig {
    pub runner: SelfHostedRunner,
    pub encoded_jit_config: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationToken {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerGroup {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerGroupList {
    pub total_count: i64,
    pub runner_groups: Vec<RunnerGroup>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Installation {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallationToken {
    pub token: String,
    pub expires_at: String,
}
