use anyhow::Context;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::Serialize;

use capstan_types::{Installation, InstallationToken, RunnerScope};

use crate::client::{check_response, API_VERSION, USER_AGENT};

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

/// GitHub App identity. Signs short-lived RS256 JWTs and exchanges them
/// for installation tokens.
pub struct AppAuth {
    app_id: u64,
    key: EncodingKey,
    api_base: String,
    http: Client,
}

impl AppAuth {
    pub fn new(app_id: u64, private_key_pem: &str, api_base: impl Into<String>) -> anyhow::Result<Self> {
        let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .context("GitHub App private key is not a valid RSA PEM")?;
        Ok(Self {
            app_id,
            key,
            api_base: api_base.into(),
            http: Client::new(),
        })
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// App JWT: backdated a minute against clock drift, valid ten.
    fn app_jwt(&self) -> anyhow::Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = AppClaims {
            iat: now - 60,
            exp: now + 600,
            iss: self.app_id.to_string(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .context("failed to sign app JWT")
    }

    /// Resolve the installation id covering a scope. Used when a queue
    /// message carries `installationId = 0`.
    pub async fn installation_for_scope(&self, scope: &RunnerScope) -> anyhow::Result<i64> {
        let url = match scope {
            RunnerScope::Org(owner) => format!("{}/orgs/{}/installation", self.api_base, owner),
            RunnerScope::Repo { owner, name } => {
                format!("{}/repos/{}/{}/installation", self.api_base, owner, name)
            }
        };
        let resp = self
            .http
            .get(url)
            .bearer_auth(self.app_jwt()?)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .header("User-Agent", USER_AGENT)
            .send()
            .await?;
        let installation: Installation = check_response(resp)
            .await
            .with_context(|| format!("no app installation found for `{scope}`"))?
            .json()
            .await?;
        Ok(installation.id)
    }

    /// Mint an installation token for API calls within that installation.
    pub async fn installation_token(&self, installation_id: i64) -> anyhow::Result<String> {
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, installation_id
        );
        let resp = self
            .http
            .post(url)
            .bearer_auth(self.app_jwt()?)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .header("User-Agent", USER_AGENT)
            .send()
            .await?;
        let token: InstallationToken = check_response(resp)
            .await
            .with_context(|| format!("failed to create token for installation {installation_id}"))?
            .json()
            .await?;
        Ok(token.token)
    }
}
