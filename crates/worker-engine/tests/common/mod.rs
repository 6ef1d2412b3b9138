//! Test doubles for the engine, cancel oracle, response sink, and object
//! store seams.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use predq_core::{DoneEvent, EngineEvent, Response, WebhookEvent};
use predq_engine::{CancelOracle, Engine, EventStream, ObjectStore, ResponseSink};

/// An engine that replays a scripted event sequence, with optional delays
/// between events, and counts cancel signals.
pub struct ScriptedEngine {
    validate_error: Option<String>,
    events: Mutex<Vec<(Duration, EngineEvent)>>,
    pub cancel_count: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(events: Vec<(Duration, EngineEvent)>) -> Self {
        Self {
            validate_error: None,
            events: Mutex::new(events),
            cancel_count: AtomicUsize::new(0),
        }
    }

    pub fn failing_validation(message: &str) -> Self {
        Self {
            validate_error: Some(message.to_string()),
            events: Mutex::new(Vec::new()),
            cancel_count: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl Engine for ScriptedEngine {
    async fn setup(&self) -> anyhow::Result<EventStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(EngineEvent::Done(DoneEvent::default()));
        Ok(rx)
    }

    fn validate(&self, _input: &Map<String, Value>) -> anyhow::Result<()> {
        match &self.validate_error {
            Some(message) => Err(anyhow::anyhow!("{message}")),
            None => Ok(()),
        }
    }

    async fn predict(
        &self,
        _payload: Map<String, Value>,
        _poll: Duration,
    ) -> anyhow::Result<EventStream> {
        let events = std::mem::take(&mut *self.events.lock().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            for (delay, event) in events {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn cancel(&self) {
        self.cancel_count.fetch_add(1, Ordering::SeqCst);
    }

    async fn cleanup(&self) {}

    async fn shutdown(&self) {}
}

/// An oracle that starts reporting cancelation from its nth query onward.
pub struct CountdownOracle {
    calls: AtomicUsize,
    trigger_at: usize,
}

impl CountdownOracle {
    pub fn trigger_at(trigger_at: usize) -> Self {
        Self { calls: AtomicUsize::new(0), trigger_at }
    }

    pub fn never() -> Self {
        Self::trigger_at(usize::MAX)
    }
}

#[async_trait::async_trait]
impl CancelOracle for CountdownOracle {
    async fn should_cancel(&self) -> anyhow::Result<bool> {
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(calls >= self.trigger_at)
    }
}

/// A sink that records every delivered event with its serialized payload.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(WebhookEvent, Value)>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<(WebhookEvent, Value)> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<WebhookEvent> {
        self.events().into_iter().map(|(kind, _)| kind).collect()
    }

    pub fn completed(&self) -> Value {
        self.events()
            .into_iter()
            .rev()
            .find(|(kind, _)| *kind == WebhookEvent::Completed)
            .map(|(_, payload)| payload)
            .expect("no completed event delivered")
    }
}

#[async_trait::async_trait]
impl ResponseSink for RecordingSink {
    async fn send(&self, event: WebhookEvent, response: &Response) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push((event, serde_json::to_value(response)?));
        Ok(())
    }
}

/// An object store that records keys/content types and can delay individual
/// puts to exercise out-of-order completion.
#[derive(Default)]
pub struct RecordingStore {
    puts: Mutex<Vec<(String, Option<String>)>>,
    fail: bool,
}

impl RecordingStore {
    pub fn failing() -> Self {
        Self { puts: Mutex::new(Vec::new()), fail: true }
    }

    pub fn keys(&self) -> Vec<String> {
        self.puts.lock().unwrap().iter().map(|(key, _)| key.clone()).collect()
    }

    pub fn content_types(&self) -> Vec<Option<String>> {
        self.puts.lock().unwrap().iter().map(|(_, ct)| ct.clone()).collect()
    }
}

#[async_trait::async_trait]
impl ObjectStore for RecordingStore {
    async fn put(
        &self,
        key: &str,
        content_type: Option<&str>,
        _body: Vec<u8>,
    ) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("store unavailable");
        }
        // Make the first-submitted artifact finish last so ordered gathering
        // is actually exercised.
        if key.ends_with(".png") {
            tokio::time::sleep(Duration::from_millis(80)).await;
        }
        self.puts
            .lock()
            .unwrap()
            .push((key.to_string(), content_type.map(str::to_string)));
        Ok(())
    }
}

/// A job message delivered over pub/sub, as parsed from the stream payload.
pub fn pubsub_message(extra_json: &str) -> Response {
    let raw = format!(
        r#"{{"input":{{"prompt":"a red square"}},"redis_pubsub_key":"results:ch"{extra_json}}}"#
    );
    serde_json::from_str(&raw).expect("test message must parse")
}

/// A tiny valid PNG for transcode paths.
pub fn png_bytes() -> Vec<u8> {
    let image = image::RgbImage::from_pixel(4, 4, image::Rgb([10, 200, 10]));
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut out, image::ImageFormat::Png)
        .expect("png fixture must encode");
    out.into_inner()
}

pub fn artifact(extension: &str, quality: u8) -> predq_core::OutputArtifact {
    predq_core::OutputArtifact {
        image_bytes: png_bytes(),
        target_extension: extension.to_string(),
        target_quality: quality,
    }
}

pub fn sink_and_route(
    filter: std::collections::HashSet<WebhookEvent>,
    filter_applies: bool,
) -> (
    Arc<RecordingSink>,
    predq_engine::JobRoute,
    mpsc::UnboundedReceiver<predq_engine::UploadJob>,
) {
    let sink = Arc::new(RecordingSink::default());
    let (upload_tx, upload_rx) = mpsc::unbounded_channel();
    let route = predq_engine::JobRoute::new(sink.clone(), filter, filter_applies, upload_tx);
    (sink, route, upload_rx)
}
