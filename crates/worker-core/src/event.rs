//! Engine event wire types.
//!
//! The inference engine is a black box that produces a tagged event stream:
//! zero or more `log`/`heartbeat`/`output_type`/`output` events followed by
//! exactly one terminal `done`. Image bytes cross the wire base64-encoded.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One event from the engine's setup or predict stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Log text to append to the job's accumulated logs.
    Log {
        /// Raw log text (may contain newlines).
        message: String,
    },
    /// No-op event; exists so the driver gets a regular chance to check
    /// cancelation and timeouts even while the engine is busy.
    Heartbeat,
    /// Declares the output shape; at most once, before any output.
    OutputType {
        /// When true, `output` is an ordered list; otherwise a single value.
        multi: bool,
    },
    /// A batch of produced artifacts plus the NSFW filter count.
    Output {
        /// The artifact payload.
        payload: OutputPayload,
    },
    /// Terminal event; exactly one per setup or predict run.
    Done(DoneEvent),
}

/// Payload of an [`EngineEvent::Output`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputPayload {
    /// Produced artifacts, in engine output order.
    pub outputs: Vec<OutputArtifact>,
    /// Number of outputs withheld by the engine's NSFW filter.
    pub nsfw_count: i64,
}

/// One produced artifact awaiting transcode and upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputArtifact {
    /// Raw image bytes (base64 on the wire).
    #[serde(with = "base64_bytes")]
    pub image_bytes: Vec<u8>,
    /// Target file extension including the leading dot.
    pub target_extension: String,
    /// Target encode quality.
    pub target_quality: u8,
}

/// Terminal result of a setup or predict run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DoneEvent {
    /// Whether the run failed.
    #[serde(default)]
    pub error: bool,
    /// Error detail when `error` is set.
    #[serde(default)]
    pub error_detail: String,
    /// Whether the engine observed a cancel signal before finishing.
    #[serde(default)]
    pub canceled: bool,
}

mod base64_bytes {
    use super::*;

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&B64.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        B64.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}
