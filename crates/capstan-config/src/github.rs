use serde::{Deserialize, Serialize};

use crate::env;

/// GitHub App credentials plus the optional GHES endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubAppConfig {
    pub app_id: u64,
    /// PEM-encoded private key, inline. Preferred for local runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// Parameter-store path holding the PEM; resolved at startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_ssm_parameter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ghes_url: Option<String>,
}

impl GithubAppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            app_id: env::integer("GITHUB_APP_ID", 0u64)?,
            private_key: env::optional("GITHUB_APP_PRIVATE_KEY"),
            private_key_ssm_parameter: env::optional("GITHUB_APP_KEY_SSM_PARAMETER"),
            ghes_url: env::optional("GHES_URL"),
        };
        if config.app_id == 0 {
            anyhow::bail!("GITHUB_APP_ID must be set to the numeric app id");
        }
        if config.private_key.is_none() && config.private_key_ssm_parameter.is_none() {
            anyhow::bail!(
                "one of GITHUB_APP_PRIVATE_KEY or GITHUB_APP_KEY_SSM_PARAMETER must be set"
            );
        }
        Ok(config)
    }

    pub fn api_base(&self) -> String {
        github_api_base(self.ghes_url.as_deref())
    }
}

/// Resolve the REST endpoint for a deployment.
///
/// No GHES URL means github.com. A `.ghe.com` host (GHES with data
/// residency) exposes the API on an `api.` subdomain; classic GHES
/// serves it under `/api/v3`.
pub fn github_api_base(ghes_url: Option<&str>) -> String {
    let Some(base) = ghes_url.map(str::trim).filter(|s| !s.is_empty()) else {
        return "https://api.github.com".to_string();
    };
    let base = base.trim_end_matches('/');
    let host = base
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(base)
        .split('/')
        .next()
        .unwrap_or_default();
    if host.ends_with(".ghe.com") {
        format!("https://api.{host}")
    } else {
        format!("{base}/api/v3")
    }
}
