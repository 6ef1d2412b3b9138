#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Shared data model for the `predq` queue worker: the job/response
//! envelope, engine event wire types, and stream-id/time helpers.

pub mod event;
pub mod response;
pub mod time;

pub use event::{DoneEvent, EngineEvent, OutputArtifact, OutputPayload};
pub use response::{
    InvalidWebhookEvent, Metrics, Response, Status, UploadObject, WebhookEvent, events_filter,
};
