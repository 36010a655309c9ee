use std::sync::Arc;

use tracing::{debug, info, instrument, warn, Level};

use capstan_cloud::QueuePublisher;
use capstan_config::RetryConfig;
use capstan_observability::{emit_event, ControlEvent};
use capstan_github::RunnerApiFactory;
use capstan_types::{JobStatus, ScaleUpMessage};

/// Queue delay ceiling imposed by the queue service.
pub const MAX_QUEUE_DELAY_SECONDS: u32 = 900;

/// Best-effort retry layer: re-enqueues a scale-up message with
/// exponential backoff while its job is still queued upstream. All
/// failures are logged and swallowed; this layer must never take a
/// control loop down.
pub struct JobRetry {
    config: RetryConfig,
    org_runners: bool,
    github: Arc<dyn RunnerApiFactory>,
    publisher: Arc<dyn QueuePublisher>,
}

impl JobRetry {
    pub fn new(
        config: RetryConfig,
        org_runners: bool,
        github: Arc<dyn RunnerApiFactory>,
        publisher: Arc<dyn QueuePublisher>,
    ) -> Self {
        Self {
            config,
            org_runners,
            github,
            publisher,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enable
    }

    #[instrument(skip_all, fields(job = message.id))]
    pub async fn retry(&self, message: &ScaleUpMessage) {
        if !self.config.enable {
            return;
        }
        if let Err(error) = self.try_republish(message).await {
            warn!(
                job = message.id,
                error = %format!("{error:#}"),
                "job retry failed, giving up on this attempt"
            );
        }
    }

    async fn try_republish(&self, message: &ScaleUpMessage) -> anyhow::Result<()> {
        let attempt = message.retry_count();
        let next_counter = message.retry_counter.map(|c| c + 1).unwrap_or(0);
        if next_counter >= self.config.max_attempts {
            info!(
                job = message.id,
                attempts = next_counter,
                "retry budget exhausted, dropping job"
            );
            return Ok(());
        }

        let scope = message.scope(self.org_runners);
        let client = self
            .github
            .for_scope(&scope, message.installation_id)
            .await?;
        let job = client
            .get_workflow_job(&message.repository_owner, &message.repository_name, message.id)
            .await?;
        if job.status != JobStatus::Queued {
            debug!(job = message.id, status = ?job.status, "job settled, no retry needed");
            return Ok(());
        }

        let delay = retry_delay(&self.config, attempt);
        let mut republished = message.clone();
        republished.retry_counter = Some(next_counter);
        let body = serde_json::to_string(&republished)?;
        self.publisher
            .send_with_delay(&self.config.queue_url, &body, delay)
            .await?;
        info!(
            job = message.id,
            attempt = next_counter,
            delay,
            "job still queued, republished"
        );
        let scope_key = scope.key();
        let detail = format!("attempt {next_counter}, delay {delay}s");
        emit_event(
            Level::INFO,
            ControlEvent::new("job.republished", "job-retry")
                .scope(&scope_key)
                .job(message.id)
                .detail(&detail),
        );
        Ok(())
    }
}

/// `min(900, delay × backoff^attempt)`, saturating well before overflow.
pub fn retry_delay(config: &RetryConfig, attempt: u32) -> u32 {
    let mut delay = config.delay_in_seconds.max(1) as u64;
    for _ in 0..attempt {
        delay = delay.saturating_mul(config.delay_backoff.max(1) as u64);
        if delay >= MAX_QUEUE_DELAY_SECONDS as u64 {
            return MAX_QUEUE_DELAY_SECONDS;
        }
    }
    delay.min(MAX_QUEUE_DELAY_SECONDS as u64) as u32
}


#[cfg(test)]
mod republish_tests {
    use super::*;

    use capstan_types::{JobStatus, ScaleUpMessage};

    use crate::testing::{org_message, retry_config, MockFactory, MockGithub, MockPublisher};

    struct Harness {
        github: Arc<MockGithub>,
        publisher: Arc<MockPublisher>,
        retry: JobRetry,
    }

    fn harness(config: RetryConfig) -> Harness {
        let github = Arc::new(MockGithub::default());
        let factory = Arc::new(MockFactory::new(github.clone()));
        let publisher = Arc::new(MockPublisher::default());
        let retry = JobRetry::new(config, true, factory, publisher.clone());
        Harness {
            github,
            publisher,
            retry,
        }
    }

    fn sent(h: &Harness) -> Vec<(String, String, u32)> {
        h.publisher.sent.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn queued_job_is_republished_with_incremented_counter() {
        let h = harness(retry_config());
        let mut message = org_message(1);
        message.retry_counter = Some(1);

        h.retry.retry(&message).await;

        let sent = sent(&h);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "https://sqs/retry");
        // delay = 30 * 2^1
        assert_eq!(sent[0].2, 60);
        let republished: ScaleUpMessage = serde_json::from_str(&sent[0].1).unwrap();
        assert_eq!(republished.retry_counter, Some(2));
        assert_eq!(republished.id, message.id);
    }

    #[tokio::test]
    async fn first_retry_starts_the_counter_at_zero() {
        let h = harness(retry_config());
        let message = org_message(1);

        h.retry.retry(&message).await;

        let sent = sent(&h);
        assert_eq!(sent[0].2, 30);
        let republished: ScaleUpMessage = serde_json::from_str(&sent[0].1).unwrap();
        assert_eq!(republished.retry_counter, Some(0));
    }

    #[tokio::test]
    async fn exhausted_budget_drops_the_job() {
        let h = harness(retry_config());
        let mut message = org_message(1);
        message.retry_counter = Some(2); // next would be 3 = max_attempts

        h.retry.retry(&message).await;

        assert!(sent(&h).is_empty());
        // The job status is never even queried.
        assert_eq!(h.github.job_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn settled_jobs_are_not_republished() {
        let h = harness(retry_config());
        h.github.set_job(1, JobStatus::InProgress);

        h.retry.retry(&org_message(1)).await;

        assert!(sent(&h).is_empty());
    }

    #[tokio::test]
    async fn disabled_layer_is_inert() {
        let mut config = retry_config();
        config.enable = false;
        let h = harness(config);

        h.retry.retry(&org_message(1)).await;

        assert!(sent(&h).is_empty());
        assert_eq!(h.github.job_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
