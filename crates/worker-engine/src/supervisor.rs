//! The supervisor: engine setup, the main receive/dispatch loop, the
//! failure-streak exit policy, and shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tracing::Instrument as _;
use tracing_opentelemetry::OpenTelemetrySpanExt as _;

use predq_core::{DoneEvent, EngineEvent, Response, Status, WebhookEvent, events_filter, time};

use crate::cancel::RedisCancelOracle;
use crate::config::WorkerConfig;
use crate::driver::{JobRoute, PredictionDriver};
use crate::engine::Engine;
use crate::sink::sink_for_job;
use crate::stream::StreamClient;
use crate::upload::{UploadJob, Uploader, run_upload_worker};

/// Tracks consecutive failed jobs; exceeding the configured maximum asks
/// the worker to exit. Catches a worker stuck in a state where it can only
/// fail predictions without exiting on its own.
pub struct FailureStreak {
    max: Option<u32>,
    count: u32,
}

impl FailureStreak {
    /// A streak with no maximum never requests an exit.
    pub fn new(max: Option<u32>) -> Self {
        Self { max, count: 0 }
    }

    /// Record a terminal status. Returns true when the streak has exceeded
    /// the maximum. Any non-failed terminal resets the streak.
    pub fn observe(&mut self, status: Status) -> bool {
        let Some(max) = self.max else {
            return false;
        };
        if status == Status::Failed {
            self.count += 1;
            self.count > max
        } else {
            self.count = 0;
            false
        }
    }

    /// Current streak length.
    pub fn count(&self) -> u32 {
        self.count
    }
}

/// One worker instance: competes for jobs on the stream, drives the engine,
/// and publishes results until asked to exit.
pub struct QueueWorker {
    cfg: WorkerConfig,
    engine: Arc<dyn Engine>,
    redis: ConnectionManager,
    stream: StreamClient,
    http: reqwest::Client,
    uploader: Arc<Uploader>,
    should_exit: Arc<AtomicBool>,
}

impl QueueWorker {
    /// Wire up a worker. `should_exit` is shared with the signal handler.
    pub fn new(
        cfg: WorkerConfig,
        engine: Arc<dyn Engine>,
        redis: ConnectionManager,
        uploader: Arc<Uploader>,
        should_exit: Arc<AtomicBool>,
    ) -> anyhow::Result<Self> {
        let stream = StreamClient::new(
            redis.clone(),
            cfg.input_queue.clone(),
            cfg.consumer_id.clone(),
            cfg.autoclaim_after(),
        );
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { cfg, engine, redis, stream, http, uploader, should_exit })
    }

    /// Run setup and the main loop until shutdown, then drain the upload
    /// stage and stop the engine.
    pub async fn run(self) -> anyhow::Result<()> {
        self.stream.ensure_group().await?;

        let (upload_tx, upload_rx) = mpsc::unbounded_channel();
        let upload_task = tokio::spawn(run_upload_worker(upload_rx, self.uploader.clone()));

        self.run_setup().await?;

        let mut failures = FailureStreak::new(self.cfg.max_failure_count);

        tracing::info!(queue = %self.cfg.input_queue, "waiting for messages");
        while !self.should_exit.load(Ordering::SeqCst) {
            if let Err(err) = self.handle_next_message(&upload_tx, &mut failures).await {
                tracing::error!("failed to handle message: {err:#}");
            }
        }

        tracing::info!("shutting down worker");
        self.engine.shutdown().await;

        // Closing the queue lets the upload worker finish in-flight
        // responses and stop.
        drop(upload_tx);
        if let Err(err) = upload_task.await {
            tracing::error!("upload worker join error: {err:#}");
        }
        Ok(())
    }

    async fn run_setup(&self) -> anyhow::Result<()> {
        let span = tracing::info_span!("setup");
        async {
            let started_at = time::now_local();
            let mut setup_logs = String::new();
            let mut done: Option<DoneEvent> = None;

            match self.engine.setup().await {
                Ok(mut events) => {
                    while let Some(event) = events.recv().await {
                        match event {
                            EngineEvent::Log { message } => setup_logs.push_str(&message),
                            EngineEvent::Done(event) => done = Some(event),
                            _ => {}
                        }
                    }
                }
                Err(err) => tracing::error!("engine setup error: {err:#}"),
            }

            let status = match done {
                Some(done) if !done.error => Status::Succeeded,
                _ => Status::Failed,
            };
            if status == Status::Failed {
                tracing::error!("setup failed, exiting after reporting");
                self.should_exit.store(true, Ordering::SeqCst);
            }

            let completed_at = time::now_local();

            // Readiness is signaled even on failure so the pod is observable
            // while it reports and exits.
            touch_ready_probe();

            if let Some(url) = &self.cfg.report_setup_run_url {
                let report = serde_json::json!({
                    "status": status,
                    "started_at": time::format_timestamp(started_at),
                    "completed_at": time::format_timestamp(completed_at),
                    "logs": setup_logs,
                });
                if let Err(err) = self.http.post(url).json(&report).send().await {
                    tracing::warn!("failed to report setup run: {err:#}");
                }
            }

            let setup_time = time::elapsed_seconds(started_at, completed_at);
            self.stream
                .record_duration(WorkerConfig::SETUP_TIME_SUFFIX, setup_time)
                .await?;
            tracing::info!(status = %status, seconds = setup_time, "setup finished");
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn handle_next_message(
        &self,
        upload_tx: &mpsc::UnboundedSender<UploadJob>,
        failures: &mut FailureStreak,
    ) -> anyhow::Result<()> {
        let Some((message_id, payload)) = self.stream.claim_or_read().await? else {
            // Idle timeout; loop around so should_exit is honored.
            return Ok(());
        };

        let time_in_queue =
            time::time_in_queue(&message_id, Utc::now().timestamp_millis()).unwrap_or_default();
        let message: Response = serde_json::from_str(&payload)?;

        let span = tracing::info_span!("process_message", time_in_queue);
        if let Some(traceparent) = &message.traceparent {
            span.set_parent(extract_trace_context(traceparent));
        }

        self.process_message(&message_id, message, upload_tx, failures)
            .instrument(span)
            .await
    }

    async fn process_message(
        &self,
        message_id: &str,
        message: Response,
        upload_tx: &mpsc::UnboundedSender<UploadJob>,
        failures: &mut FailureStreak,
    ) -> anyhow::Result<()> {
        tracing::info!(message_id, queue = %self.cfg.input_queue, "received message");

        let sink = sink_for_job(&self.http, &self.redis, &message)?;
        let filter_applies = message.webhook.is_some();

        let filter = match events_filter(message.webhook_events_filter.as_deref()) {
            Ok(filter) => filter,
            Err(err) => {
                // A bad filter fails the job without ever invoking the
                // engine; the message is still consumed.
                let mut response = message;
                response.status = Some(Status::Failed);
                response.error = Some(err.to_string());
                sink.send(WebhookEvent::Completed, &response).await?;
                self.observe_terminal(Status::Failed, failures);
                self.stream.ack_and_delete(message_id).await?;
                return Ok(());
            }
        };

        let oracle = Arc::new(RedisCancelOracle::new(
            self.redis.clone(),
            message.cancel_key.clone(),
        ));
        let route = JobRoute::new(sink, filter, filter_applies, upload_tx.clone());
        let driver = PredictionDriver::new(
            self.engine.clone(),
            oracle,
            route,
            self.cfg.predict_timeout.map(Duration::from_secs),
            WorkerConfig::POLL_INTERVAL,
        );

        let predict_started = Instant::now();
        let response = driver.run(message).await?;

        self.stream
            .record_duration(
                WorkerConfig::RUN_TIME_SUFFIX,
                predict_started.elapsed().as_secs_f64(),
            )
            .await?;

        if let Some(status) = response.status {
            self.observe_terminal(status, failures);
        }

        self.stream.ack_and_delete(message_id).await?;
        Ok(())
    }

    fn observe_terminal(&self, status: Status, failures: &mut FailureStreak) {
        if failures.observe(status) {
            tracing::error!(
                streak = failures.count(),
                "had too many failures in a row, exiting"
            );
            self.should_exit.store(true, Ordering::SeqCst);
        }
    }
}

/// Best-effort readiness signal for orchestrated deployments: touch the
/// file named by `PREDQ_READY_FILE`, when set.
fn touch_ready_probe() {
    let Some(path) = std::env::var_os("PREDQ_READY_FILE") else {
        return;
    };
    if let Err(err) = std::fs::write(&path, b"") {
        tracing::warn!("failed to touch readiness probe file: {err}");
    }
}

/// Recover the remote span context from a job's W3C `traceparent` value
/// (e.g. `00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01`).
fn extract_trace_context(traceparent: &str) -> opentelemetry::Context {
    use opentelemetry::propagation::TextMapPropagator as _;

    let carrier =
        HashMap::from([("traceparent".to_string(), traceparent.to_string())]);
    opentelemetry_sdk::propagation::TraceContextPropagator::new().extract(&carrier)
}
