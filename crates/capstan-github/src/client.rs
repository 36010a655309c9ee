use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::json;

use capstan_types::{
    JitConfig, RegistrationToken, RunnerGroupList, RunnerList, RunnerScope, SelfHostedRunner,
    WorkflowJob,
};

use crate::auth::AppAuth;

pub(crate) const USER_AGENT: &str = "capstan";
pub(crate) const API_VERSION: &str = "2022-11-28";

const RUNNERS_PER_PAGE: usize = 100;

/// The upstream operations the control loops consume, behind a trait so
/// the controllers can run against in-memory fakes.
#[async_trait]
pub trait RunnerApi: Send + Sync {
    /// Status of one workflow job. The job always lives in a concrete
    /// repository, even when the client is org-scoped.
    async fn get_workflow_job(
        &self,
        repo_owner: &str,
        repo_name: &str,
        job_id: i64,
    ) -> anyhow::Result<WorkflowJob>;

    async fn create_registration_token(&self) -> anyhow::Result<RegistrationToken>;

    async fn generate_jit_config(
        &self,
        name: &str,
        runner_group_id: i64,
        labels: &[String],
    ) -> anyhow::Result<JitConfig>;

    /// All self-hosted runners registered to the scope; paginates
    /// transparently.
    async fn list_runners(&self) -> anyhow::Result<Vec<SelfHostedRunner>>;

    /// One runner by id; `None` when upstream no longer knows it.
    async fn get_runner(&self, runner_id: i64) -> anyhow::Result<Option<SelfHostedRunner>>;

    /// De-register a runner. Anything but 204 is a failure.
    async fn delete_runner(&self, runner_id: i64) -> anyhow::Result<()>;

    /// Resolve a runner group by name. Org-scoped clients only.
    async fn runner_group_id(&self, group_name: &str) -> anyhow::Result<Option<i64>>;
}

/// Creates one [`RunnerApi`] per owning scope. The scale-up dispatcher
/// holds a scope-keyed map of these for the duration of one batch.
#[async_trait]
pub trait RunnerApiFactory: Send + Sync {
    /// `installation_id = 0` means "resolve via the app".
    async fn for_scope(
        &self,
        scope: &RunnerScope,
        installation_id: i64,
    ) -> anyhow::Result<Arc<dyn RunnerApi>>;
}

/// Scope-bound REST client carrying an installation token.
pub struct GithubClient {
    http: Client,
    api_base: String,
    scope: RunnerScope,
    token: String,
}

impl GithubClient {
    pub fn new(api_base: impl Into<String>, scope: RunnerScope, token: String) -> Self {
        Self {
            http: Client::new(),
            api_base: api_base.into(),
            scope,
            token,
        }
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .header("User-Agent", USER_AGENT)
    }

    /// `…/orgs/{org}` or `…/repos/{owner}/{repo}`.
    fn scope_base(&self) -> String {
        scope_base(&self.api_base, &self.scope)
    }
}

#[async_trait]
impl RunnerApi for GithubClient {
    async fn get_workflow_job(
        &self,
        repo_owner: &str,
        repo_name: &str,
        job_id: i64,
    ) -> anyhow::Result<WorkflowJob> {
        let url = format!(
            "{}/repos/{}/{}/actions/jobs/{}",
            self.api_base, repo_owner, repo_name, job_id
        );
        let resp = self.request(Method::GET, url).send().await?;
        let job = check_response(resp)
            .await
            .with_context(|| format!("failed to fetch job {job_id} in {repo_owner}/{repo_name}"))?
            .json()
            .await?;
        Ok(job)
    }

    async fn create_registration_token(&self) -> anyhow::Result<RegistrationToken> {
        let url = format!("{}/actions/runners/registration-token", self.scope_base());
        let resp = self.request(Method::POST, url).send().await?;
        let token = check_response(resp)
            .await
            .with_context(|| format!("failed to create registration token for `{}`", self.scope))?
            .json()
            .await?;
        Ok(token)
    }

    async fn generate_jit_config(
        &self,
        name: &str,
        runner_group_id: i64,
        labels: &[String],
    ) -> anyhow::Result<JitConfig> {
        let url = format!("{}/actions/runners/generate-jitconfig", self.scope_base());
        let resp = self
            .request(Method::POST, url)
            .json(&json!({
                "name": name,
                "runner_group_id": runner_group_id,
                "labels": labels,
            }))
            .send()
            .await?;
        let jit = check_response(resp)
            .await
            .with_context(|| format!("failed to generate JIT config for `{name}`"))?
            .json()
            .await?;
        Ok(jit)
    }

    async fn list_runners(&self) -> anyhow::Result<Vec<SelfHostedRunner>> {
        let base = format!("{}/actions/runners", self.scope_base());
        let mut runners = Vec::new();
        for page in 1.. {
            let url = format!("{base}?per_page={RUNNERS_PER_PAGE}&page={page}");
            let resp = self.request(Method::GET, url).send().await?;
            let list: RunnerList = check_response(resp)
                .await
                .with_context(|| format!("failed to list runners for `{}`", self.scope))?
                .json()
                .await?;
            let batch = list.runners.len();
            runners.extend(list.runners);
            if batch < RUNNERS_PER_PAGE || runners.len() >= list.total_count as usize {
                break;
            }
        }
        Ok(runners)
    }

    async fn get_runner(&self, runner_id: i64) -> anyhow::Result<Option<SelfHostedRunner>> {
        let url = format!("{}/actions/runners/{}", self.scope_base(), runner_id);
        let resp = self.request(Method::GET, url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let runner = check_response(resp)
            .await
            .with_context(|| format!("failed to fetch runner {runner_id}"))?
            .json()
            .await?;
        Ok(Some(runner))
    }

    async fn delete_runner(&self, runner_id: i64) -> anyhow::Result<()> {
        let url = format!("{}/actions/runners/{}", self.scope_base(), runner_id);
        let resp = self.request(Method::DELETE, url).send().await?;
        if resp.status() != StatusCode::NO_CONTENT {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "de-registration of runner {} returned {} instead of 204: {}",
                runner_id,
                status,
                truncate_for_error(&body, 500)
            );
        }
        Ok(())
    }

    async fn runner_group_id(&self, group_name: &str) -> anyhow::Result<Option<i64>> {
        let RunnerScope::Org(org) = &self.scope else {
            anyhow::bail!("runner groups are org-level; `{}` is a repo scope", self.scope);
        };
        let base = format!("{}/orgs/{}/actions/runner-groups", self.api_base, org);
        let mut seen = 0usize;
        for page in 1.. {
            let url = format!("{base}?per_page={RUNNERS_PER_PAGE}&page={page}");
            let resp = self.request(Method::GET, url).send().await?;
            let list: RunnerGroupList = check_response(resp)
                .await
                .with_context(|| format!("failed to list runner groups for `{org}`"))?
                .json()
                .await?;
            let batch = list.runner_groups.len();
            if let Some(group) = list.runner_groups.into_iter().find(|g| g.name == group_name) {
                return Ok(Some(group.id));
            }
            seen += batch;
            if batch < RUNNERS_PER_PAGE || seen >= list.total_count as usize {
                break;
            }
        }
        Ok(None)
    }
}

/// Factory backed by a real GitHub App.
pub struct GithubClientFactory {
    auth: Arc<AppAuth>,
}

impl GithubClientFactory {
    pub fn new(auth: Arc<AppAuth>) -> Self {
        Self { auth }
    }
}

#[async_trait]
impl RunnerApiFactory for GithubClientFactory {
    async fn for_scope(
        &self,
        scope: &RunnerScope,
        installation_id: i64,
    ) -> anyhow::Result<Arc<dyn RunnerApi>> {
        let installation = if installation_id > 0 {
            installation_id
        } else {
            self.auth.installation_for_scope(scope).await?
        };
        let token = self.auth.installation_token(installation).await?;
        Ok(Arc::new(GithubClient::new(
            self.auth.api_base(),
            scope.clone(),
            token,
        )))
    }
}

pub(crate) fn scope_base(api_base: &str, scope: &RunnerScope) -> String {
    match scope {
        RunnerScope::Org(owner) => format!("{api_base}/orgs/{owner}"),
        RunnerScope::Repo { owner, name } => format!("{api_base}/repos/{owner}/{name}"),
    }
}

pub(crate) async fn check_response(resp: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    anyhow::bail!(
        "github request failed with status {}: {}",
        status,
        truncate_for_error(&body, 500)
    )
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        format!("{}...", &input[..max_len])
    }
}
