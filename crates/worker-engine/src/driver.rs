//! The prediction driver: runs one job end-to-end against the engine.
//!
//! The driver consumes the engine's event stream, enforcing the cancel and
//! timeout transitions before each event, and emits a bounded sequence of
//! response events: `start` once, `logs` zero or more times, `completed`
//! exactly once. A completed response that still carries artifacts is handed
//! to the upload stage, which then owns the terminal delivery.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use predq_core::{
    DoneEvent, EngineEvent, Metrics, Response, Status, UploadObject, WebhookEvent, time,
};

use crate::cancel::CancelOracle;
use crate::engine::Engine;
use crate::sink::ResponseSink;
use crate::upload::UploadJob;

// These messages are user-visible, so they stay intentionally vague about
// what the engine did wrong.
#[derive(Debug, thiserror::Error)]
enum PredictError {
    #[error("Predictor returned unexpected output")]
    UnexpectedOutput,
    #[error("Predictor unexpectedly returned done twice")]
    DoneTwice,
    #[error("Predictor stopped without a done event")]
    MissingDone,
}

enum DriverFailure {
    /// The prediction itself failed; the job completes as `failed`.
    Predict(anyhow::Error),
    /// Delivering an event failed; bubbles up so the message is not acked.
    Emit(anyhow::Error),
}

/// Routes one job's emitted events to their destination: the upload stage
/// for a completed response with pending artifacts, the job's sink for
/// everything else (subject to the webhook event filter).
pub struct JobRoute {
    sink: Arc<dyn ResponseSink>,
    events_filter: HashSet<WebhookEvent>,
    filter_applies: bool,
    upload_tx: mpsc::UnboundedSender<UploadJob>,
}

impl JobRoute {
    /// Build the route for one job. `filter_applies` is true for webhook
    /// destinations only; pub/sub receives every event.
    pub fn new(
        sink: Arc<dyn ResponseSink>,
        events_filter: HashSet<WebhookEvent>,
        filter_applies: bool,
        upload_tx: mpsc::UnboundedSender<UploadJob>,
    ) -> Self {
        Self { sink, events_filter, filter_applies, upload_tx }
    }

    async fn emit(&self, event: WebhookEvent, response: &Response) -> anyhow::Result<()> {
        if event == WebhookEvent::Completed && !response.upload_outputs.is_empty() {
            // The upload stage takes over terminal delivery for this job.
            self.upload_tx
                .send(UploadJob { response: response.clone(), sink: self.sink.clone() })
                .map_err(|_| anyhow::anyhow!("upload queue is closed"))?;
            return Ok(());
        }

        if event != WebhookEvent::Completed
            && self.filter_applies
            && !self.events_filter.contains(&event)
        {
            return Ok(());
        }
        self.sink.send(event, response).await
    }
}

/// Drives one prediction to completion.
pub struct PredictionDriver {
    engine: Arc<dyn Engine>,
    oracle: Arc<dyn CancelOracle>,
    route: JobRoute,
    predict_timeout: Option<Duration>,
    poll: Duration,
}

struct LoopState {
    was_canceled: bool,
    timed_out: bool,
    had_upload_error: bool,
    done: DoneEvent,
}

impl PredictionDriver {
    /// Build a driver for one job.
    pub fn new(
        engine: Arc<dyn Engine>,
        oracle: Arc<dyn CancelOracle>,
        route: JobRoute,
        predict_timeout: Option<Duration>,
        poll: Duration,
    ) -> Self {
        Self { engine, oracle, route, predict_timeout, poll }
    }

    /// Run the job. Returns the terminal response after `completed` has been
    /// emitted (or queued on the upload stage). An `Err` means an event
    /// could not be delivered; the caller must then leave the message
    /// pending for reclaim.
    pub async fn run(&self, message: Response) -> anyhow::Result<Response> {
        let mut response = message;
        response.status = Some(Status::Processing);
        response.output = Some(Value::Null);
        response.logs = Some(String::new());

        let input = response.input.clone().unwrap_or_default();

        if let Err(err) = self.engine.validate(&input) {
            response.status = Some(Status::Failed);
            response.error = Some(err.to_string());
            self.route.emit(WebhookEvent::Completed, &response).await?;
            self.engine.cleanup().await;
            return Ok(response);
        }

        let started_at = time::now_local();
        let started = Instant::now();
        response.started_at = Some(time::format_timestamp(started_at));

        self.route.emit(WebhookEvent::Start, &response).await?;

        let deadline = self.predict_timeout.map(|timeout| started + timeout);
        let outcome = self.predict_loop(&mut response, input, deadline).await;

        let completed_at = time::now_local();
        response.completed_at = Some(time::format_timestamp(completed_at));

        match outcome {
            Ok(state) => {
                if state.had_upload_error {
                    response.status = Some(Status::Failed);
                    response.error = Some("Error uploading files".to_string());
                } else if state.done.canceled && state.was_canceled {
                    response.status = Some(Status::Canceled);
                } else if state.done.canceled && state.timed_out {
                    response.status = Some(Status::Failed);
                    response.error = Some("Prediction timed out".to_string());
                } else if state.done.error {
                    response.status = Some(Status::Failed);
                    response.error = Some(state.done.error_detail);
                } else {
                    response.status = Some(Status::Succeeded);
                    response.metrics = Some(Metrics {
                        predict_time: time::elapsed_seconds(started_at, completed_at),
                    });
                }
            }
            Err(DriverFailure::Predict(err)) => {
                tracing::error!("error in prediction: {err:#}");
                response.status = Some(Status::Failed);
                response.error = Some(err.to_string());
            }
            Err(DriverFailure::Emit(err)) => {
                self.engine.cleanup().await;
                return Err(err);
            }
        }

        self.route.emit(WebhookEvent::Completed, &response).await?;
        self.engine.cleanup().await;
        Ok(response)
    }

    async fn predict_loop(
        &self,
        response: &mut Response,
        input: Map<String, Value>,
        deadline: Option<Instant>,
    ) -> Result<LoopState, DriverFailure> {
        let mut events = self
            .engine
            .predict(input.clone(), self.poll)
            .await
            .map_err(DriverFailure::Predict)?;

        let mut was_canceled = false;
        let mut timed_out = false;
        let mut had_upload_error = false;
        let mut output_type: Option<bool> = None;
        let mut done: Option<DoneEvent> = None;

        // A silent engine must not starve the cancel/timeout checks, so the
        // loop also wakes on the poll cadence.
        let mut poll_tick = tokio::time::interval(self.poll);
        poll_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = poll_tick.tick() => {
                    self.check_cancel_and_deadline(&mut was_canceled, &mut timed_out, deadline)
                        .await?;
                    continue;
                }
            };
            let Some(event) = event else { break };

            self.check_cancel_and_deadline(&mut was_canceled, &mut timed_out, deadline)
                .await?;

            match event {
                EngineEvent::Heartbeat => {}
                EngineEvent::Log { message } => {
                    response.append_logs(&message);
                    self.route
                        .emit(WebhookEvent::Logs, response)
                        .await
                        .map_err(DriverFailure::Emit)?;
                }
                EngineEvent::OutputType { multi } => {
                    if output_type.is_some() {
                        return Err(DriverFailure::Predict(PredictError::UnexpectedOutput.into()));
                    }
                    output_type = Some(multi);
                    response.multi_output = multi;
                    if multi {
                        response.output = Some(Value::Array(Vec::new()));
                    }
                }
                EngineEvent::Output { payload } => {
                    if output_type.is_none() {
                        return Err(DriverFailure::Predict(PredictError::UnexpectedOutput.into()));
                    }

                    response.upload_prefix = input
                        .get("upload_path_prefix")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();

                    if payload.nsfw_count == 0 && payload.outputs.is_empty() {
                        tracing::error!("engine produced neither outputs nor an nsfw count");
                        had_upload_error = true;
                    } else {
                        // nsfw_count can be positive with zero outputs; the
                        // response then carries an empty output list.
                        response.output = Some(Value::Array(Vec::new()));
                        for artifact in payload.outputs {
                            response.upload_outputs.push(UploadObject {
                                image_bytes: artifact.image_bytes,
                                target_extension: artifact.target_extension,
                                target_quality: artifact.target_quality,
                            });
                        }
                        response.nsfw_count = Some(payload.nsfw_count);
                    }
                }
                EngineEvent::Done(event) => {
                    if done.is_some() {
                        return Err(DriverFailure::Predict(PredictError::DoneTwice.into()));
                    }
                    done = Some(event);
                }
            }
        }

        let done = done.ok_or_else(|| DriverFailure::Predict(PredictError::MissingDone.into()))?;
        Ok(LoopState { was_canceled, timed_out, had_upload_error, done })
    }

    /// One-shot transitions, checked before each event: cancel first, then
    /// the deadline. Each signals the engine at most once.
    async fn check_cancel_and_deadline(
        &self,
        was_canceled: &mut bool,
        timed_out: &mut bool,
        deadline: Option<Instant>,
    ) -> Result<(), DriverFailure> {
        if !*was_canceled
            && self
                .oracle
                .should_cancel()
                .await
                .map_err(DriverFailure::Predict)?
        {
            *was_canceled = true;
            self.engine.cancel().await;
        }

        if !*timed_out {
            if let Some(deadline) = deadline {
                if Instant::now() > deadline {
                    *timed_out = true;
                    self.engine.cancel().await;
                }
            }
        }
        Ok(())
    }
}
