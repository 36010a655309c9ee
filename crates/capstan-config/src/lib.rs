//! Typed views over the environment-style configuration surface.
//!
//! Every control loop parses its configuration once at startup; JSON-valued
//! variables (`SCALE_DOWN_CONFIG`, `JOB_RETRY_CONFIG`) are deserialized with
//! serde, everything else is plain string/flag parsing.

mod env;
pub mod github;
pub mod retry;
pub mod scale_down;
pub mod scale_up;

pub use github::*;
pub use retry::*;
pub use scale_down::*;
pub use scale_up::*;

use serde::{Deserialize, Serialize};

/// Pool top-up settings. Absent (`POOL_SIZE` unset or 0) disables the
/// pool loop entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub size: usize,
    /// Organization (or `owner/repo`) whose warm pool is maintained.
    pub owner: String,
}

impl PoolConfig {
    pub fn from_env() -> anyhow::Result<Option<Self>> {
        let size: usize = env::integer("POOL_SIZE", 0)?;
        if size == 0 {
            return Ok(None);
        }
        Ok(Some(Self {
            size,
            owner: env::required("POOL_OWNER")?,
        }))
    }
}

/// Daemon-level wiring: the scale-up queue plus tick intervals for the
/// periodic loops.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub scale_up_queue_url: String,
    pub scale_down_interval_secs: u64,
    pub pool_interval_secs: u64,
    pub pool: Option<PoolConfig>,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            scale_up_queue_url: env::required("SCALE_UP_QUEUE_URL")?,
            scale_down_interval_secs: env::integer("SCALE_DOWN_INTERVAL_SECONDS", 300)?,
            pool_interval_secs: env::integer("POOL_INTERVAL_SECONDS", 600)?,
            pool: PoolConfig::from_env()?,
        })
    }
}
