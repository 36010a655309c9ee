use serde::{Deserialize, Serialize};

use crate::scope::RunnerScope;

/// Workflow event kind carried by a scale-up request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowJob,
    CheckRun,
}

/// Account type owning the repository a job was queued against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnerType {
    Organization,
    User,
}

/// Queue payload describing one queued job that may need a runner.
///
/// The wire shape matches the webhook relay exactly; the SQS message id
/// travels beside this payload as [`ScaleUpRequest::delivery_id`], never
/// inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleUpMessage {
    pub id: i64,
    pub event_type: EventKind,
    pub repository_name: String,
    pub repository_owner: String,
    /// 0 means "resolve the installation on demand".
    #[serde(default)]
    pub installation_id: i64,
    pub repo_owner_type: OwnerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_counter: Option<u32>,
}

impl ScaleUpMessage {
    /// The owning scope this message maps to under the given mode.
    pub fn scope(&self, org_runners: bool) -> RunnerScope {
        if org_runners {
            RunnerScope::Org(self.repository_owner.clone())
        } else {
            RunnerScope::Repo {
                owner: self.repository_owner.clone(),
                name: self.repository_name.clone(),
            }
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_counter.unwrap_or(0)
    }
}

/// A scale-up message paired with its queue delivery id, the handle
/// used for partial-batch failure reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleUpRequest {
    pub delivery_id: String,
    pub message: ScaleUpMessage,
}
