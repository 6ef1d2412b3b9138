#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Queue-worker engine for `predq`: stream consumption, the prediction
//! driver, the artifact upload stage, and the supervisor loop that ties
//! them together.

pub mod cancel;
pub mod config;
pub mod driver;
pub mod engine;
pub mod sink;
pub mod stream;
pub mod supervisor;
pub mod upload;

pub use cancel::{CancelOracle, RedisCancelOracle};
pub use config::WorkerConfig;
pub use driver::{JobRoute, PredictionDriver};
pub use engine::{Engine, EventStream, ProcessEngine};
pub use sink::{PubSubSink, ResponseSink, WebhookSink, sink_for_job};
pub use stream::StreamClient;
pub use supervisor::{FailureStreak, QueueWorker};
pub use upload::{ObjectStore, S3Store, UploadJob, Uploader, run_upload_worker};
