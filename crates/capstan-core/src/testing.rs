//! In-memory doubles for the adapter traits, shared by the controller
//! tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use capstan_cloud::{FleetOps, ParamStore, ParamStoreError, QueuePublisher};
use capstan_config::{RetryConfig, ScaleDownConfig, ScaleUpConfig};
use capstan_github::{RunnerApi, RunnerApiFactory};
use capstan_types::{
    AllocationStrategy, CapacityType, EventKind, FleetResult, FleetSpec, InstanceFilter,
    JitConfig, JobStatus, OwnerType, RegistrationToken, RunnerInstance, RunnerKind, RunnerScope,
    ScaleUpMessage, ScaleUpRequest, SelfHostedRunner, WorkflowJob,
};

#[derive(Default)]
pub(crate) struct MockFleet {
    pub instances: Mutex<Vec<RunnerInstance>>,
    /// Scripted create_fleet responses; empty means "fulfil in full".
    pub fleet_results: Mutex<VecDeque<FleetResult>>,
    pub created_specs: Mutex<Vec<FleetSpec>>,
    pub list_calls: AtomicUsize,
    pub terminated: Mutex<Vec<String>>,
    pub tags_added: Mutex<Vec<(String, Vec<(String, String)>)>>,
    pub tags_removed: Mutex<Vec<(String, Vec<(String, String)>)>>,
    next_instance: AtomicUsize,
}

impl MockFleet {
    pub fn with_instances(instances: Vec<RunnerInstance>) -> Self {
        Self {
            instances: Mutex::new(instances),
            ..Self::default()
        }
    }

    pub fn script_fleet_result(&self, result: FleetResult) {
        self.fleet_results.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl FleetOps for MockFleet {
    async fn list_runners(&self, filter: &InstanceFilter) -> anyhow::Result<Vec<RunnerInstance>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .instances
            .lock()
            .unwrap()
            .iter()
            .filter(|i| filter.owner.as_deref().map(|o| i.owner == o).unwrap_or(true))
            .filter(|i| !filter.orphan || i.orphan)
            .cloned()
            .collect())
    }

    async fn create_fleet(&self, spec: &FleetSpec) -> anyhow::Result<FleetResult> {
        self.created_specs.lock().unwrap().push(spec.clone());
        if let Some(result) = self.fleet_results.lock().unwrap().pop_front() {
            return Ok(result);
        }
        let instance_ids = (0..spec.count)
            .map(|_| {
                let n = self.next_instance.fetch_add(1, Ordering::SeqCst);
                format!("i-{n:08x}")
            })
            .collect();
        Ok(FleetResult {
            instance_ids,
            error_codes: Vec::new(),
        })
    }

    async fn terminate(&self, instance_id: &str) -> anyhow::Result<()> {
        self.terminated.lock().unwrap().push(instance_id.to_string());
        Ok(())
    }

    async fn tag(&self, instance_id: &str, tags: &[(String, String)]) -> anyhow::Result<()> {
        self.tags_added
            .lock()
            .unwrap()
            .push((instance_id.to_string(), tags.to_vec()));
        Ok(())
    }

    async fn untag(&self, instance_id: &str, tags: &[(String, String)]) -> anyhow::Result<()> {
        self.tags_removed
            .lock()
            .unwrap()
            .push((instance_id.to_string(), tags.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MockParams {
    pub store: Mutex<HashMap<String, String>>,
    pub secret_writes: Mutex<Vec<(String, String)>>,
}

impl MockParams {
    pub fn with_parameter(name: &str, value: &str) -> Self {
        let params = Self::default();
        params
            .store
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
        params
    }
}

#[async_trait]
impl ParamStore for MockParams {
    async fn put_secret(
        &self,
        path: &str,
        value: &str,
        _tags: &[(String, String)],
    ) -> anyhow::Result<()> {
        self.secret_writes
            .lock()
            .unwrap()
            .push((path.to_string(), value.to_string()));
        self.store
            .lock()
            .unwrap()
            .insert(path.to_string(), value.to_string());
        Ok(())
    }

    async fn put_parameter(&self, name: &str, value: &str) -> anyhow::Result<()> {
        self.store
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn get_parameter(&self, name: &str) -> Result<String, ParamStoreError> {
        self.store
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ParamStoreError::NotFound(name.to_string()))
    }
}

#[derive(Default)]
pub(crate) struct MockGithub {
    pub jobs: Mutex<HashMap<i64, JobStatus>>,
    pub runners: Mutex<Vec<SelfHostedRunner>>,
    pub groups: Mutex<HashMap<String, i64>>,
    pub deleted: Mutex<Vec<i64>>,
    pub delete_failures: Mutex<HashSet<i64>>,
    pub jit_names: Mutex<Vec<String>>,
    pub token_calls: AtomicUsize,
    pub job_calls: AtomicUsize,
    next_runner_id: AtomicUsize,
}

impl MockGithub {
    pub fn set_job(&self, id: i64, status: JobStatus) {
        self.jobs.lock().unwrap().insert(id, status);
    }

    pub fn add_runner(&self, id: i64, name: &str, status: &str, busy: bool) {
        self.runners.lock().unwrap().push(SelfHostedRunner {
            id,
            name: name.to_string(),
            status: status.to_string(),
            busy,
        });
    }
}

#[async_trait]
impl RunnerApi for MockGithub {
    async fn get_workflow_job(
        &self,
        _repo_owner: &str,
        _repo_name: &str,
        job_id: i64,
    ) -> anyhow::Result<WorkflowJob> {
        self.job_calls.fetch_add(1, Ordering::SeqCst);
        let status = self
            .jobs
            .lock()
            .unwrap()
            .get(&job_id)
            .copied()
            .unwrap_or(JobStatus::Queued);
        Ok(WorkflowJob { id: job_id, status })
    }

    async fn create_registration_token(&self) -> anyhow::Result<RegistrationToken> {
        self.token_calls.fetch_add(1, Ordering::SeqCst);
        Ok(RegistrationToken {
            token: "reg-token".to_string(),
        })
    }

    async fn generate_jit_config(
        &self,
        name: &str,
        _runner_group_id: i64,
        _labels: &[String],
    ) -> anyhow::Result<JitConfig> {
        self.jit_names.lock().unwrap().push(name.to_string());
        let id = 1000 + self.next_runner_id.fetch_add(1, Ordering::SeqCst) as i64;
        let runner = SelfHostedRunner {
            id,
            name: name.to_string(),
            status: "offline".to_string(),
            busy: false,
        };
        self.runners.lock().unwrap().push(runner.clone());
        Ok(JitConfig {
            runner,
            encoded_jit_config: format!("jit-{name}"),
        })
    }

    async fn list_runners(&self) -> anyhow::Result<Vec<SelfHostedRunner>> {
        Ok(self.runners.lock().unwrap().clone())
    }

    async fn get_runner(&self, runner_id: i64) -> anyhow::Result<Option<SelfHostedRunner>> {
        Ok(self
            .runners
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == runner_id)
            .cloned())
    }

    async fn delete_runner(&self, runner_id: i64) -> anyhow::Result<()> {
        if self.delete_failures.lock().unwrap().contains(&runner_id) {
            anyhow::bail!("de-registration of runner {runner_id} returned 500 instead of 204");
        }
        self.deleted.lock().unwrap().push(runner_id);
        self.runners.lock().unwrap().retain(|r| r.id != runner_id);
        Ok(())
    }

    async fn runner_group_id(&self, group_name: &str) -> anyhow::Result<Option<i64>> {
        Ok(self.groups.lock().unwrap().get(group_name).copied())
    }
}

/// Hands the same mock client to every scope and records the scopes it
/// was asked for.
pub(crate) struct MockFactory {
    pub client: Arc<MockGithub>,
    pub scope_calls: Mutex<Vec<String>>,
    pub fail: Mutex<bool>,
}

impl MockFactory {
    pub fn new(client: Arc<MockGithub>) -> Self {
        Self {
            client,
            scope_calls: Mutex::new(Vec::new()),
            fail: Mutex::new(false),
        }
    }
}

#[async_trait]
impl RunnerApiFactory for MockFactory {
    async fn for_scope(
        &self,
        scope: &RunnerScope,
        _installation_id: i64,
    ) -> anyhow::Result<Arc<dyn RunnerApi>> {
        if *self.fail.lock().unwrap() {
            anyhow::bail!("upstream authentication unavailable");
        }
        self.scope_calls.lock().unwrap().push(scope.key());
        Ok(self.client.clone())
    }
}

#[derive(Default)]
pub(crate) struct MockPublisher {
    pub sent: Mutex<Vec<(String, String, u32)>>,
}

#[async_trait]
impl QueuePublisher for MockPublisher {
    async fn send_with_delay(
        &self,
        queue_url: &str,
        body: &str,
        delay_seconds: u32,
    ) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((queue_url.to_string(), body.to_string(), delay_seconds));
        Ok(())
    }
}

pub(crate) fn scale_up_config() -> ScaleUpConfig {
    ScaleUpConfig {
        environment: "test".to_string(),
        launch_template: "capstan-test".to_string(),
        subnets: vec!["subnet-a".to_string()],
        instance_types: vec!["m5.large".to_string()],
        org_runners: true,
        ephemeral: true,
        jit_config: true,
        queued_check: false,
        disable_autoupdate: false,
        max_runners: 3,
        runner_labels: vec!["self-hosted".to_string(), "linux".to_string()],
        runner_group_name: None,
        name_prefix: "capstan-".to_string(),
        token_path: "/capstan/test/tokens".to_string(),
        config_path: "/capstan/test/config".to_string(),
        allocation_strategy: AllocationStrategy::default(),
        max_spot_price: None,
        capacity_type: CapacityType::Spot,
        ami_ssm_parameter: None,
        on_demand_failover_codes: Vec::new(),
    }
}

pub(crate) fn scale_down_config() -> ScaleDownConfig {
    ScaleDownConfig {
        environment: "test".to_string(),
        min_running_minutes: 5,
        boot_time_minutes: 5,
        schedule: Vec::new(),
    }
}

pub(crate) fn retry_config() -> RetryConfig {
    RetryConfig {
        enable: true,
        max_attempts: 3,
        delay_in_seconds: 30,
        delay_backoff: 2,
        queue_url: "https://sqs/retry".to_string(),
    }
}

pub(crate) fn org_message(id: i64) -> ScaleUpMessage {
    ScaleUpMessage {
        id,
        event_type: EventKind::WorkflowJob,
        repository_name: "widgets".to_string(),
        repository_owner: "acme".to_string(),
        installation_id: 77,
        repo_owner_type: OwnerType::Organization,
        retry_counter: None,
    }
}

pub(crate) fn request(delivery_id: &str, message: ScaleUpMessage) -> ScaleUpRequest {
    ScaleUpRequest {
        delivery_id: delivery_id.to_string(),
        message,
    }
}

pub(crate) fn instance(
    instance_id: &str,
    owner: &str,
    age_minutes: i64,
    runner_id: Option<i64>,
    orphan: bool,
) -> RunnerInstance {
    RunnerInstance {
        instance_id: instance_id.to_string(),
        launch_time: Some(Utc::now() - Duration::minutes(age_minutes)),
        owner: owner.to_string(),
        kind: if owner.contains('/') {
            RunnerKind::Repo
        } else {
            RunnerKind::Org
        },
        runner_id,
        orphan,
    }
}
