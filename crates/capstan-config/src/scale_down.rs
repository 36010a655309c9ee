use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::env;

/// Sort order for scale-down candidates within an owner group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionStrategy {
    /// Favours churn: long-lived instances go first.
    #[default]
    OldestFirst,
    /// Favours warm pools: the freshest instances go first.
    NewestFirst,
}

/// One `SCALE_DOWN_CONFIG` entry. The cron expression uses cron-crate
/// syntax (seconds field included); an entry is active while the
/// current instant matches it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdleSchedule {
    pub cron: String,
    pub idle_count: usize,
    #[serde(default)]
    pub eviction_strategy: EvictionStrategy,
}

/// Scale-down reaper settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleDownConfig {
    pub environment: String,
    /// Instances younger than this are never reaped.
    pub min_running_minutes: i64,
    /// Unregistered instances older than this are presumed lost.
    pub boot_time_minutes: i64,
    #[serde(default)]
    pub schedule: Vec<IdleSchedule>,
}

impl ScaleDownConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let schedule = match env::optional("SCALE_DOWN_CONFIG") {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("SCALE_DOWN_CONFIG is not valid JSON: {e}"))?,
            None => Vec::new(),
        };
        Ok(Self {
            environment: env::required("ENVIRONMENT")?,
            min_running_minutes: env::integer("MINIMUM_RUNNING_TIME_IN_MINUTES", 5)?,
            boot_time_minutes: env::integer("RUNNER_BOOT_TIME_IN_MINUTES", 5)?,
            schedule,
        })
    }

    /// Idle quota and eviction order for this tick: the first schedule
    /// entry whose cron expression includes `now`. No match means no
    /// idle runners are preserved.
    pub fn idle_config(&self, now: DateTime<Utc>) -> (usize, EvictionStrategy) {
        for entry in &self.schedule {
            match Schedule::from_str(&entry.cron) {
                Ok(schedule) if schedule.includes(now) => {
                    return (entry.idle_count, entry.eviction_strategy);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(cron = %entry.cron, error = %e, "skipping unparsable scale-down schedule entry");
                }
            }
        }
        (0, EvictionStrategy::default())
    }
}
