//! The inference-engine contract and the subprocess-backed implementation.
//!
//! The engine is a black box that runs setup once, then one prediction at a
//! time, reporting progress as a stream of [`EngineEvent`]s. `ProcessEngine`
//! drives an external engine process over newline-delimited JSON: requests
//! go to the child's stdin, events come back on its stdout, and the child's
//! stderr passes straight through to ours.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};

use predq_core::EngineEvent;

/// A lazily-consumed sequence of engine events ending in one `Done`.
pub type EventStream = mpsc::UnboundedReceiver<EngineEvent>;

/// The black-box inference engine driven by the worker.
#[async_trait::async_trait]
pub trait Engine: Send + Sync {
    /// Run engine setup. The stream yields `Log` events and exactly one
    /// terminal `Done` whose `error` flag reports the outcome.
    async fn setup(&self) -> anyhow::Result<EventStream>;

    /// Apply the engine's input schema to a job's inputs. A failure here
    /// fails the job without invoking the engine.
    fn validate(&self, input: &Map<String, Value>) -> anyhow::Result<()>;

    /// Run one prediction. The stream terminates with exactly one `Done`;
    /// `poll` is the cadence at which the engine should emit heartbeats.
    async fn predict(&self, payload: Map<String, Value>, poll: Duration)
    -> anyhow::Result<EventStream>;

    /// Cooperatively signal the engine to stop the running prediction.
    /// Idempotent; the prediction still terminates through its `Done` event.
    async fn cancel(&self);

    /// Best-effort per-job input cleanup hook.
    async fn cleanup(&self);

    /// Terminate the engine. Called once at worker exit.
    async fn shutdown(&self);
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EngineRequest<'a> {
    Setup,
    Predict {
        payload: &'a Map<String, Value>,
        poll_ms: u64,
    },
    Cancel,
    Cleanup,
    Shutdown,
}

/// An engine running as a child process, spoken to over stdin/stdout.
pub struct ProcessEngine {
    stdin: Arc<Mutex<ChildStdin>>,
    subscriber: Arc<Mutex<Option<mpsc::UnboundedSender<EngineEvent>>>>,
    child: Mutex<Option<Child>>,
}

impl ProcessEngine {
    /// Spawn the engine process from its argv (program plus arguments).
    pub fn spawn(command: &[String]) -> anyhow::Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("engine command is empty"))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn engine process {program:?}"))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("engine process has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("engine process has no stdout"))?;

        let subscriber: Arc<Mutex<Option<mpsc::UnboundedSender<EngineEvent>>>> =
            Arc::new(Mutex::new(None));

        let reader_subscriber = subscriber.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        tracing::warn!("engine stdout closed");
                        break;
                    }
                    Err(err) => {
                        tracing::error!("error reading engine stdout: {err:#}");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                let event: EngineEvent = match serde_json::from_str(&line) {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!("skipping unparseable engine event: {err}");
                        continue;
                    }
                };

                let terminal = matches!(event, EngineEvent::Done(_));
                let mut current = reader_subscriber.lock().await;
                match current.as_ref() {
                    Some(tx) => {
                        let _ = tx.send(event);
                    }
                    None => tracing::warn!("engine event arrived with no active request"),
                }
                // Done ends the current request; dropping the sender closes
                // the stream on the driver's side.
                if terminal {
                    *current = None;
                }
            }
        });

        Ok(Self {
            stdin: Arc::new(Mutex::new(stdin)),
            subscriber,
            child: Mutex::new(Some(child)),
        })
    }

    async fn begin(&self, request: EngineRequest<'_>) -> anyhow::Result<EventStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut current = self.subscriber.lock().await;
            if current.is_some() {
                anyhow::bail!("engine already has an active request");
            }
            *current = Some(tx);
        }

        if let Err(err) = self.send(&request).await {
            *self.subscriber.lock().await = None;
            return Err(err);
        }
        Ok(rx)
    }

    async fn send(&self, request: &EngineRequest<'_>) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');

        let mut stdin = self.stdin.lock().await;
        stdin.write_all(&line).await.context("write to engine stdin")?;
        stdin.flush().await.context("flush engine stdin")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Engine for ProcessEngine {
    async fn setup(&self) -> anyhow::Result<EventStream> {
        self.begin(EngineRequest::Setup).await
    }

    fn validate(&self, input: &Map<String, Value>) -> anyhow::Result<()> {
        // Deep schema validation is the engine's job (a bad input still
        // terminates with Done{error}); only the fields this process relies
        // on are checked here.
        if let Some(prefix) = input.get("upload_path_prefix") {
            if !prefix.is_string() {
                anyhow::bail!("upload_path_prefix must be a string");
            }
        }
        Ok(())
    }

    async fn predict(
        &self,
        payload: Map<String, Value>,
        poll: Duration,
    ) -> anyhow::Result<EventStream> {
        self.begin(EngineRequest::Predict {
            payload: &payload,
            poll_ms: poll.as_millis() as u64,
        })
        .await
    }

    async fn cancel(&self) {
        if let Err(err) = self.send(&EngineRequest::Cancel).await {
            tracing::warn!("failed to send cancel to engine: {err:#}");
        }
    }

    async fn cleanup(&self) {
        if let Err(err) = self.send(&EngineRequest::Cleanup).await {
            tracing::debug!("failed to send cleanup to engine: {err:#}");
        }
    }

    async fn shutdown(&self) {
        if let Err(err) = self.send(&EngineRequest::Shutdown).await {
            tracing::warn!("failed to send shutdown to engine: {err:#}");
        }

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(Duration::from_secs(10), child.wait()).await {
            Ok(Ok(status)) => tracing::info!(%status, "engine process exited"),
            Ok(Err(err)) => tracing::error!("error waiting for engine process: {err:#}"),
            Err(_) => {
                tracing::warn!("engine process did not exit in time, killing it");
                if let Err(err) = child.kill().await {
                    tracing::error!("failed to kill engine process: {err:#}");
                }
            }
        }
    }
}
