use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, instrument, warn, Level};

use capstan_cloud::FleetOps;
use capstan_config::ScaleUpConfig;
use capstan_observability::{emit_event, ControlEvent};
use capstan_github::{RunnerApi, RunnerApiFactory};
use capstan_types::{
    EventKind, InstanceFilter, JobStatus, OwnerType, RunnerCreator, RunnerScope, ScaleUpRequest,
};

use crate::error::ScaleError;
use crate::provision::RunnerProvisioner;

/// Outcome of one scope's processing, separated so the batch loop can
/// treat upstream trouble (reject the scope, keep going) differently
/// from scaling trouble (abort the batch).
enum ScopeError {
    /// Client construction, job fetch, token or JIT generation failed.
    Upstream(anyhow::Error),
    /// The bulk create classified as retriable or fatal.
    Scaling(ScaleError),
}

/// The scale-up dispatcher: consumes one batch of queue messages,
/// creates capacity per owning scope, provisions registration secrets,
/// and reports which delivery ids must be re-driven by the queue.
pub struct ScaleUpDispatcher {
    provisioner: RunnerProvisioner,
    fleet: Arc<dyn FleetOps>,
    github: Arc<dyn RunnerApiFactory>,
}

impl ScaleUpDispatcher {
    pub fn new(
        provisioner: RunnerProvisioner,
        fleet: Arc<dyn FleetOps>,
        github: Arc<dyn RunnerApiFactory>,
    ) -> Self {
        Self {
            provisioner,
            fleet,
            github,
        }
    }

    fn config(&self) -> &ScaleUpConfig {
        self.provisioner.config()
    }

    /// Handle one batch. Returns the delivery ids the queue must
    /// re-deliver; propagates only batch-wide scaling failures.
    #[instrument(skip_all, fields(batch = requests.len()))]
    pub async fn scale(
        &self,
        mut requests: Vec<ScaleUpRequest>,
    ) -> Result<Vec<String>, ScaleError> {
        // Oldest retries first, so a capacity cap defers the youngest
        // messages. The sort is stable: batch order survives within one
        // retry generation.
        requests.sort_by_key(|r| r.message.retry_count());

        let mut rejected: Vec<String> = Vec::new();
        let mut scopes: Vec<(RunnerScope, Vec<ScaleUpRequest>)> = Vec::new();
        let mut scope_index: HashMap<String, usize> = HashMap::new();

        for request in requests {
            if !self.accept(&request, &mut rejected) {
                continue;
            }
            let scope = request.message.scope(self.config().org_runners);
            let index = *scope_index.entry(scope.key()).or_insert_with(|| {
                scopes.push((scope.clone(), Vec::new()));
                scopes.len() - 1
            });
            scopes[index].1.push(request);
        }

        // One lazily-built client per scope, held for the batch only.
        let mut clients: HashMap<String, Arc<dyn RunnerApi>> = HashMap::new();

        for (scope, scope_requests) in scopes {
            match self
                .process_scope(&scope, &scope_requests, &mut clients)
                .await
            {
                Ok(mut scope_rejects) => rejected.append(&mut scope_rejects),
                Err(ScopeError::Upstream(error)) => {
                    let scope_key = scope.key();
                    let detail = format!("{error:#}");
                    warn!(
                        scope = %scope_key,
                        error = %detail,
                        "upstream failure, re-queueing every message in scope"
                    );
                    emit_event(
                        Level::WARN,
                        ControlEvent::new("scope.requeued", "scale-up")
                            .scope(&scope_key)
                            .detail(&detail),
                    );
                    rejected.extend(scope_requests.iter().map(|r| r.delivery_id.clone()));
                }
                Err(ScopeError::Scaling(error)) => return Err(error),
            }
        }

        Ok(rejected)
    }

    /// Validation pass for one message: false means "do not process"
    /// (either rejected for re-delivery or silently skipped).
    fn accept(&self, request: &ScaleUpRequest, rejected: &mut Vec<String>) -> bool {
        let message = &request.message;
        if self.config().ephemeral && message.event_type != EventKind::WorkflowJob {
            warn!(
                job = message.id,
                event = ?message.event_type,
                "only workflow_job events can scale ephemeral runners, re-queueing"
            );
            rejected.push(request.delivery_id.clone());
            return false;
        }
        // check_run payloads carry no workflow-job id the queued check
        // could resolve, so the two settings are mutually exclusive.
        if message.event_type == EventKind::CheckRun && self.config().queued_check {
            warn!(
                job = message.id,
                "check_run cannot be combined with the job queued check, re-queueing"
            );
            rejected.push(request.delivery_id.clone());
            return false;
        }
        if self.config().org_runners && message.repo_owner_type != OwnerType::Organization {
            warn!(
                job = message.id,
                owner = %message.repository_owner,
                "organization runners are enabled but the repo owner is a user, skipping"
            );
            return false;
        }
        true
    }

    async fn process_scope(
        &self,
        scope: &RunnerScope,
        requests: &[ScaleUpRequest],
        clients: &mut HashMap<String, Arc<dyn RunnerApi>>,
    ) -> Result<Vec<String>, ScopeError> {
        let client = match clients.entry(scope.key()) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.get().clone(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let installation_id = requests
                    .iter()
                    .map(|r| r.message.installation_id)
                    .find(|id| *id > 0)
                    .unwrap_or(0);
                let client = self
                    .github
                    .for_scope(scope, installation_id)
                    .await
                    .map_err(ScopeError::Upstream)?;
                entry.insert(client).clone()
            }
        };

        let mut rejects = Vec::new();
        let surviving = self
            .queued_filter(requests, &client)
            .await
            .map_err(ScopeError::Upstream)?;
        let want = surviving.len();
        if want == 0 {
            return Ok(rejects);
        }

        let new_count = if self.config().unbounded() {
            want
        } else {
            let filter = InstanceFilter::for_environment(&self.config().environment)
                .owned_by(scope.key());
            let current = self
                .fleet
                .list_runners(&filter)
                .await
                .context("listing current capacity")
                .map_err(ScopeError::Upstream)?
                .len();
            let budget = (self.config().max_runners.max(0) as usize).saturating_sub(current);
            want.min(budget)
        };

        // Capacity cap: defer the youngest surviving messages.
        let deferred = want - new_count;
        rejects.extend(
            surviving[..deferred]
                .iter()
                .map(|r| r.delivery_id.clone()),
        );
        let consumable = &surviving[deferred..];

        if new_count == 0 {
            info!(scope = %scope, want, "scope is at its instance budget, re-queueing");
            return Ok(rejects);
        }

        let created = self
            .provisioner
            .create_runners(scope, RunnerCreator::ScaleUp, new_count)
            .await
            .map_err(ScopeError::Scaling)?;

        // Partial creation: the shortfall's messages go back to the
        // queue; secrets are provisioned only for real instances.
        let shortfall = new_count.saturating_sub(created.len());
        rejects.extend(
            consumable[..shortfall]
                .iter()
                .map(|r| r.delivery_id.clone()),
        );
        info!(
            scope = %scope,
            requested = new_count,
            created = created.len(),
            deferred = deferred + shortfall,
            "fleet request settled"
        );
        let scope_key = scope.key();
        emit_event(
            Level::INFO,
            ControlEvent::new("fleet.settled", "scale-up")
                .scope(&scope_key)
                .counts(new_count, created.len()),
        );

        self.provisioner
            .provision_secrets(scope, &client, &created)
            .await
            .map_err(ScopeError::Upstream)?;

        Ok(rejects)
    }

    /// Drop messages whose job is no longer queued. Silent: these are
    /// neither rejected nor retried.
    async fn queued_filter<'a>(
        &self,
        requests: &'a [ScaleUpRequest],
        client: &Arc<dyn RunnerApi>,
    ) -> anyhow::Result<Vec<&'a ScaleUpRequest>> {
        if !self.config().queued_check {
            return Ok(requests.iter().collect());
        }
        let mut surviving = Vec::with_capacity(requests.len());
        for request in requests {
            let message = &request.message;
            let job = client
                .get_workflow_job(&message.repository_owner, &message.repository_name, message.id)
                .await
                .with_context(|| format!("fetching status of job {}", message.id))?;
            if job.status == JobStatus::Queued {
                surviving.push(request);
            } else {
                info!(
                    job = message.id,
                    status = ?job.status,
                    "job is no longer queued, dropping message"
                );
            }
        }
        Ok(surviving)
    }
}
