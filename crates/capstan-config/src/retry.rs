use serde::{Deserialize, Serialize};

use crate::env;

/// `JOB_RETRY_CONFIG` wire shape. The retry layer is opt-in and
/// best-effort; everything here has a usable default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_in_seconds")]
    pub delay_in_seconds: u32,
    #[serde(default = "default_delay_backoff")]
    pub delay_backoff: u32,
    #[serde(default)]
    pub queue_url: String,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_delay_in_seconds() -> u32 {
    60
}

fn default_delay_backoff() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enable: false,
            max_attempts: default_max_attempts(),
            delay_in_seconds: default_delay_in_seconds(),
            delay_backoff: default_delay_backoff(),
            queue_url: String::new(),
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        match env::optional("JOB_RETRY_CONFIG") {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("JOB_RETRY_CONFIG is not valid JSON: {e}")),
            None => Ok(Self::default()),
        }
    }
}
