//! The job/response envelope and its enums.
//!
//! A job message arrives as one JSON object and the same object, enriched
//! over the job's lifetime, is what gets delivered back to the requester.
//! Known fields are typed; everything else lands in `extra` and is echoed
//! back verbatim in every serialized response.

use std::collections::HashSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Terminal and intermediate job states, as they appear on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The job has been claimed and the engine is (or is about to be) running.
    Processing,
    /// The engine finished and all artifacts were delivered.
    Succeeded,
    /// The job ended with an error (validation, engine, upload, or timeout).
    Failed,
    /// The job was canceled by request.
    Canceled,
}

impl Status {
    /// Wire form of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Processing => "processing",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event kinds that can be delivered to a requester.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WebhookEvent {
    /// Emitted once, after input validation and before the engine runs.
    Start,
    /// Output became available (delivered via the terminal response).
    Output,
    /// The accumulated log text grew.
    Logs,
    /// Terminal event; exactly one per job.
    Completed,
}

impl WebhookEvent {
    /// Wire form of the event kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEvent::Start => "start",
            WebhookEvent::Output => "output",
            WebhookEvent::Logs => "logs",
            WebhookEvent::Completed => "completed",
        }
    }

    /// The filter applied when a job does not provide one: every event.
    pub fn default_events() -> HashSet<WebhookEvent> {
        HashSet::from([
            WebhookEvent::Start,
            WebhookEvent::Output,
            WebhookEvent::Logs,
            WebhookEvent::Completed,
        ])
    }
}

impl std::fmt::Display for WebhookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `webhook_events_filter` entry that is not a known event kind.
#[derive(Debug, thiserror::Error)]
#[error("invalid webhook event {0:?}; must be one of start, output, logs, completed")]
pub struct InvalidWebhookEvent(pub String);

impl FromStr for WebhookEvent {
    type Err = InvalidWebhookEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(WebhookEvent::Start),
            "output" => Ok(WebhookEvent::Output),
            "logs" => Ok(WebhookEvent::Logs),
            "completed" => Ok(WebhookEvent::Completed),
            other => Err(InvalidWebhookEvent(other.to_string())),
        }
    }
}

/// Resolve a job's `webhook_events_filter` into the effective event set.
///
/// `completed` is always included. A missing filter means every event.
pub fn events_filter(
    filter: Option<&[String]>,
) -> Result<HashSet<WebhookEvent>, InvalidWebhookEvent> {
    let Some(filter) = filter else {
        return Ok(WebhookEvent::default_events());
    };

    let mut events = HashSet::with_capacity(filter.len() + 1);
    for raw in filter {
        events.insert(raw.parse::<WebhookEvent>()?);
    }
    events.insert(WebhookEvent::Completed);
    Ok(events)
}

/// Prediction timing reported on successful jobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Metrics {
    /// Wall-clock prediction time in seconds.
    pub predict_time: f64,
}

/// An image artifact held in memory until the upload stage stores it.
#[derive(Debug, Clone)]
pub struct UploadObject {
    /// Raw image bytes as produced by the engine.
    pub image_bytes: Vec<u8>,
    /// Target file extension including the leading dot (e.g. `.png`).
    pub target_extension: String,
    /// Target encode quality (codec-dependent).
    pub target_quality: u8,
}

/// One job's evolving message/response envelope.
///
/// Seeded by deserializing the stream payload; mutated throughout the job;
/// serialized whenever an event is delivered. The `upload_*` and
/// `multi_output` fields are process-internal and never serialized, which is
/// what strips them from delivered responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    /// Engine inputs; may include `upload_path_prefix`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Map<String, Value>>,
    /// Webhook endpoint; takes precedence over `redis_pubsub_key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    /// Pub/sub channel used when no webhook is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_pubsub_key: Option<String>,
    /// Key whose existence in the coordination store requests cancelation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_key: Option<String>,
    /// Requested webhook event kinds; validated before the engine runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_events_filter: Option<Vec<String>>,
    /// W3C trace context carried by the producer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceparent: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nsfw_count: Option<i64>,

    /// Unknown fields from the job message, echoed back verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,

    /// Artifacts pending upload. Internal; stripped from every response.
    #[serde(skip)]
    pub upload_outputs: Vec<UploadObject>,
    /// Object-key prefix for this job's artifacts. Internal.
    #[serde(skip)]
    pub upload_prefix: String,
    /// Whether the engine declared a multi-output prediction. Internal.
    #[serde(skip)]
    pub multi_output: bool,
}

impl Response {
    /// Append engine log text to the accumulated `logs` field.
    pub fn append_logs(&mut self, message: &str) {
        self.logs.get_or_insert_with(String::new).push_str(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extras_round_trip() {
        let raw = r#"{"input":{"prompt":"x"},"redis_pubsub_key":"ch","model_id":"m1","priority":3}"#;
        let mut response: Response = serde_json::from_str(raw).unwrap();
        response.status = Some(Status::Processing);

        let out: Value = serde_json::to_value(&response).unwrap();
        assert_eq!(out["model_id"], "m1");
        assert_eq!(out["priority"], 3);
        assert_eq!(out["status"], "processing");
    }

    #[test]
    fn internal_fields_are_stripped() {
        let mut response = Response::default();
        response.upload_prefix = "p".to_string();
        response.upload_outputs.push(UploadObject {
            image_bytes: vec![1, 2, 3],
            target_extension: ".png".to_string(),
            target_quality: 90,
        });

        let out = serde_json::to_string(&response).unwrap();
        assert!(!out.contains("upload_outputs"));
        assert!(!out.contains("upload_prefix"));
    }

    #[test]
    fn filter_always_includes_completed() {
        let filter = vec!["logs".to_string()];
        let events = events_filter(Some(&filter)).unwrap();
        assert!(events.contains(&WebhookEvent::Logs));
        assert!(events.contains(&WebhookEvent::Completed));
        assert!(!events.contains(&WebhookEvent::Start));
    }

    #[test]
    fn filter_rejects_unknown_events() {
        let filter = vec!["completed".to_string(), "bogus".to_string()];
        let err = events_filter(Some(&filter)).unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn missing_filter_means_all_events() {
        assert_eq!(events_filter(None).unwrap().len(), 4);
    }
}
