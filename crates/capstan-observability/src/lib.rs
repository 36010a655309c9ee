use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_PREFIX: &str = "capstan.daemon";

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub removed_logs: usize,
    pub initialized_at: DateTime<Utc>,
}

/// One structured audit record for a control decision: a scale-up
/// settlement, a termination, an orphan mark. Emitted under the
/// `capstan.obs` target so deployments can route the audit stream
/// separately from plain logs.
#[derive(Debug, Clone, Serialize)]
pub struct ControlEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub scope: Option<&'a str>,
    pub instance_id: Option<&'a str>,
    pub runner_id: Option<i64>,
    pub job_id: Option<i64>,
    pub requested: Option<usize>,
    pub created: Option<usize>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

impl<'a> ControlEvent<'a> {
    pub fn new(event: &'a str, component: &'a str) -> Self {
        Self {
            event,
            component,
            scope: None,
            instance_id: None,
            runner_id: None,
            job_id: None,
            requested: None,
            created: None,
            error_code: None,
            detail: None,
        }
    }

    pub fn scope(mut self, scope: &'a str) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn instance(mut self, instance_id: &'a str) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    pub fn runner(mut self, runner_id: i64) -> Self {
        self.runner_id = Some(runner_id);
        self
    }

    pub fn job(mut self, job_id: i64) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn counts(mut self, requested: usize, created: usize) -> Self {
        self.requested = Some(requested);
        self.created = Some(created);
        self
    }

    pub fn error_code(mut self, code: &'a str) -> Self {
        self.error_code = Some(code);
        self
    }

    pub fn detail(mut self, detail: &'a str) -> Self {
        self.detail = Some(detail);
        self
    }
}

pub fn emit_event(level: Level, event: ControlEvent<'_>) {
    match level {
        Level::ERROR => tracing::error!(
            target: "capstan.obs",
            event = event.event,
            component = event.component,
            scope = event.scope.unwrap_or(""),
            instance_id = event.instance_id.unwrap_or(""),
            runner_id = event.runner_id.unwrap_or(0),
            job_id = event.job_id.unwrap_or(0),
            requested = event.requested.unwrap_or(0),
            created = event.created.unwrap_or(0),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "control_event"
        ),
        Level::WARN => tracing::warn!(
            target: "capstan.obs",
            event = event.event,
            component = event.component,
            scope = event.scope.unwrap_or(""),
            instance_id = event.instance_id.unwrap_or(""),
            runner_id = event.runner_id.unwrap_or(0),
            job_id = event.job_id.unwrap_or(0),
            requested = event.requested.unwrap_or(0),
            created = event.created.unwrap_or(0),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "control_event"
        ),
        _ => tracing::info!(
            target: "capstan.obs",
            event = event.event,
            component = event.component,
            scope = event.scope.unwrap_or(""),
            instance_id = event.instance_id.unwrap_or(""),
            runner_id = event.runner_id.unwrap_or(0),
            job_id = event.job_id.unwrap_or(0),
            requested = event.requested.unwrap_or(0),
            created = event.created.unwrap_or(0),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "control_event"
        ),
    }
}

/// Mask registration tokens and JIT blobs before they can reach a log
/// line. Keeps enough shape (length + hash) to correlate without
/// disclosing the value.
pub fn redact_secret(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!(
        "[redacted len={} hash={}]",
        trimmed.len(),
        short_hash(trimmed)
    )
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Console layer plus a daily-rolling JSONL file layer. The env filter
/// comes from `RUST_LOG`, defaulting to `info`.
pub fn init_logging(
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    let removed_logs = sweep_expired_logs(logs_dir, retention_days)?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(LOG_PREFIX)
        .filename_suffix("jsonl")
        .build(logs_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(true);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        logs_dir: logs_dir.display().to_string(),
        prefix: LOG_PREFIX.to_string(),
        retention_days,
        removed_logs,
        initialized_at: Utc::now(),
    };

    Ok((guard, info))
}

/// Delete rolled log files older than the retention window. Returns how
/// many were removed.
fn sweep_expired_logs(logs_dir: &Path, retention_days: u64) -> anyhow::Result<usize> {
    let cutoff = (Utc::now() - chrono::Duration::days(retention_days as i64)).date_naive();
    let mut removed = 0;

    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(date) = log_file_date(name, LOG_PREFIX) else {
            continue;
        };
        if date < cutoff && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }

    Ok(removed)
}

/// Date stamp of a rolled log file, `<prefix>.YYYY-MM-DD.jsonl`.
fn log_file_date(name: &str, prefix: &str) -> Option<NaiveDate> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('.')?;
    let date_part = rest.strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

pub fn canonical_logs_dir(root: &Path) -> PathBuf {
    root.join("logs")
}
