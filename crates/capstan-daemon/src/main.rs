use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use capstan_cloud::{Ec2Fleet, ParamStore, SqsQueue, SsmParams};
use capstan_config::{
    DaemonConfig, GithubAppConfig, RetryConfig, ScaleDownConfig, ScaleUpConfig,
};
use capstan_core::{
    JobRetry, PoolManager, QueueRecord, RunnerProvisioner, ScaleDownReaper, ScaleUpDispatcher,
    ScaleUpHandler,
};
use capstan_github::{AppAuth, GithubClientFactory};
use capstan_types::ScaleUpMessage;

#[derive(Parser, Debug)]
#[command(name = "capstan")]
#[command(about = "Autoscaling control plane for self-hosted GitHub Actions runners")]
struct Cli {
    #[arg(long, env = "CAPSTAN_LOGS_DIR", default_value = "/var/lib/capstan/logs")]
    logs_dir: PathBuf,
    #[arg(long, env = "CAPSTAN_LOG_RETENTION_DAYS", default_value_t = 14)]
    log_retention_days: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (_guard, log_info) =
        capstan_observability::init_logging(&cli.logs_dir, cli.log_retention_days)?;
    info!(logs_dir = %log_info.logs_dir, "capstan daemon starting");

    let scale_up_config = ScaleUpConfig::from_env().context("scale-up configuration")?;
    let scale_down_config = ScaleDownConfig::from_env().context("scale-down configuration")?;
    let retry_config = RetryConfig::from_env().context("job retry configuration")?;
    let app_config = GithubAppConfig::from_env().context("github app configuration")?;
    let daemon_config = DaemonConfig::from_env().context("daemon configuration")?;

    let aws = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let fleet = Arc::new(Ec2Fleet::new(aws_sdk_ec2::Client::new(&aws)));
    let params = Arc::new(SsmParams::new(aws_sdk_ssm::Client::new(&aws)));
    let queue = Arc::new(SqsQueue::new(aws_sdk_sqs::Client::new(&aws)));

    let github = Arc::new(GithubClientFactory::new(Arc::new(
        build_app_auth(&app_config, params.as_ref()).await?,
    )));
    let server_url = app_config
        .ghes_url
        .clone()
        .unwrap_or_else(|| "https://github.com".to_string());

    let org_runners = scale_up_config.org_runners;
    let handler = ScaleUpHandler::new(ScaleUpDispatcher::new(
        RunnerProvisioner::new(
            scale_up_config.clone(),
            server_url.clone(),
            fleet.clone(),
            params.clone(),
        ),
        fleet.clone(),
        github.clone(),
    ));
    let job_retry = Arc::new(JobRetry::new(
        retry_config.clone(),
        org_runners,
        github.clone(),
        queue.clone(),
    ));

    let reaper = Arc::new(ScaleDownReaper::new(
        scale_down_config.clone(),
        fleet.clone(),
        github.clone(),
    ));
    let scale_down_ticker = tokio::spawn(tick(
        Duration::from_secs(daemon_config.scale_down_interval_secs),
        "scale-down",
        move || {
            let reaper = reaper.clone();
            async move { reaper.run().await.map(|_| ()) }
        },
    ));

    let pool_ticker = daemon_config.pool.clone().map(|pool_config| {
        let manager = Arc::new(PoolManager::new(
            pool_config,
            scale_down_config.boot_time_minutes,
            RunnerProvisioner::new(
                scale_up_config.clone(),
                server_url,
                fleet.clone(),
                params.clone(),
            ),
            fleet.clone(),
            github.clone(),
        ));
        tokio::spawn(tick(
            Duration::from_secs(daemon_config.pool_interval_secs),
            "pool",
            move || {
                let manager = manager.clone();
                async move { manager.adjust().await.map(|_| ()) }
            },
        ))
    });

    info!(queue = %daemon_config.scale_up_queue_url, "entering intake loop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            batch = queue.receive(&daemon_config.scale_up_queue_url, 10, 10) => {
                match batch {
                    Ok(deliveries) if deliveries.is_empty() => {}
                    Ok(deliveries) => {
                        handle_batch(&handler, &queue, &job_retry, &daemon_config, deliveries).await;
                    }
                    Err(e) => {
                        error!(error = %format!("{e:#}"), "queue receive failed");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }
    }

    scale_down_ticker.abort();
    if let Some(ticker) = pool_ticker {
        ticker.abort();
    }
    Ok(())
}

/// One intake round: dispatch the batch, settle what was processed, and
/// hand the rejected messages to the retry layer. With the retry layer
/// enabled, rejected messages are settled too — the delayed republish
/// (bounded by the attempt budget) replaces raw visibility-timeout
/// redelivery; disabled, the queue re-drives them itself.
async fn handle_batch(
    handler: &ScaleUpHandler,
    queue: &SqsQueue,
    job_retry: &JobRetry,
    config: &DaemonConfig,
    deliveries: Vec<capstan_cloud::QueueDelivery>,
) {
    let records: Vec<QueueRecord> = deliveries
        .iter()
        .map(|d| QueueRecord {
            delivery_id: d.message_id.clone(),
            body: d.body.clone(),
        })
        .collect();
    let response = handler.handle(records).await;
    let failed: HashSet<&str> = response
        .batch_item_failures
        .iter()
        .map(|f| f.item_identifier.as_str())
        .collect();

    let retry_owns_redelivery = job_retry.enabled();
    for delivery in &deliveries {
        let rejected = failed.contains(delivery.message_id.as_str());
        if rejected {
            if let Ok(message) = serde_json::from_str::<ScaleUpMessage>(&delivery.body) {
                job_retry.retry(&message).await;
            }
            if !retry_owns_redelivery {
                continue;
            }
        }
        if let Err(e) = queue
            .delete(&config.scale_up_queue_url, &delivery.receipt_handle)
            .await
        {
            warn!(
                delivery_id = %delivery.message_id,
                error = %format!("{e:#}"),
                "failed to settle queue message"
            );
        }
    }
}

/// Resolve the App private key (inline or via the parameter store) and
/// build the authenticator.
async fn build_app_auth(config: &GithubAppConfig, params: &SsmParams) -> anyhow::Result<AppAuth> {
    let pem = match (&config.private_key, &config.private_key_ssm_parameter) {
        (Some(pem), _) => pem.clone(),
        (None, Some(parameter)) => params
            .get_parameter(parameter)
            .await
            .with_context(|| format!("reading app key from `{parameter}`"))?,
        (None, None) => anyhow::bail!("no GitHub App private key configured"),
    };
    AppAuth::new(config.app_id, &pem, config.api_base())
}

/// Periodic loop wrapper: errors are logged, never propagated, so a bad
/// tick cannot kill the scheduler.
async fn tick<F, Fut>(period: Duration, name: &'static str, run: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(e) = run().await {
            error!(loop_name = name, error = %format!("{e:#}"), "tick failed");
        }
    }
}
