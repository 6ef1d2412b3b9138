mod cli;
mod shutdown;
mod telemetry;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context as _;
use clap::Parser as _;

use predq_engine::{ProcessEngine, QueueWorker, S3Store, Uploader, WorkerConfig};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.reject_positional_args();
    let redis_url = cli.resolve_redis_url()?;

    let telemetry = telemetry::init();

    let should_exit = Arc::new(AtomicBool::new(false));
    let armed = Arc::new(AtomicBool::new(false));
    shutdown::spawn_signal_handler(should_exit.clone(), armed.clone());

    let client = redis::Client::open(redis_url.as_str()).context("invalid redis url")?;
    let redis = redis::aio::ConnectionManager::new(client)
        .await
        .context("connect to redis")?;
    tracing::info!("connected to redis");

    let store = Arc::new(S3Store::new(build_s3_client(&cli), cli.s3_bucket.clone()));
    let uploader = Arc::new(Uploader::new(store, cli.s3_bucket.clone()));

    let engine = Arc::new(ProcessEngine::spawn(&cli.engine_argv())?);

    let worker = QueueWorker::new(
        WorkerConfig {
            input_queue: cli.input_queue.clone(),
            consumer_id: cli.consumer_id.clone(),
            predict_timeout: cli.predict_timeout,
            report_setup_run_url: cli.report_setup_run_url.clone(),
            max_failure_count: cli.max_failure_count,
        },
        engine,
        redis,
        uploader,
        should_exit,
    )?;

    // From here on, termination signals request a cooperative stop.
    armed.store(true, Ordering::SeqCst);

    let result = worker.run().await;

    if let Some(provider) = telemetry {
        if let Err(err) = provider.shutdown() {
            tracing::warn!("failed to flush telemetry: {err}");
        }
    }
    result
}

fn build_s3_client(cli: &Cli) -> aws_sdk_s3::Client {
    let credentials = aws_sdk_s3::config::Credentials::new(
        cli.s3_access_key.clone(),
        cli.s3_secret_key.clone(),
        None,
        None,
        "cli",
    );
    let mut config = aws_sdk_s3::Config::builder()
        .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
        .region(aws_sdk_s3::config::Region::new(cli.s3_region.clone()))
        .credentials_provider(credentials)
        .retry_config(aws_sdk_s3::config::retry::RetryConfig::standard().with_max_attempts(3));
    if let Some(endpoint) = &cli.s3_endpoint_url {
        config = config.endpoint_url(endpoint.clone());
    }
    aws_sdk_s3::Client::from_conf(config.build())
}
