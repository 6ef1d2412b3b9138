//! Worker configuration.

use std::time::Duration;

/// Configuration for one queue-worker instance.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stream to consume jobs from. The consumer group carries the same name.
    pub input_queue: String,

    /// This worker's consumer name within the group. Must be unique across
    /// the pool or two workers will shadow each other's pending entries.
    pub consumer_id: String,

    /// Prediction deadline in seconds. Breaching it sends the engine a
    /// cancel signal and the job fails as timed out.
    pub predict_timeout: Option<u64>,

    /// When set, the setup report is POSTed here after engine setup.
    pub report_setup_run_url: Option<String>,

    /// Maximum number of consecutive failed jobs before the worker exits.
    pub max_failure_count: Option<u32>,
}

impl WorkerConfig {
    /// How often the driver checks for cancelation and timeouts while the
    /// engine is running.
    pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// How long a blocking stream read waits before returning empty so the
    /// supervisor can observe shutdown.
    pub const READ_BLOCK: Duration = Duration::from_secs(1);

    /// Stats streams are capped to this many entries.
    pub const STATS_MAXLEN: usize = 100;

    /// Suffix of the setup-duration stats stream.
    pub const SETUP_TIME_SUFFIX: &'static str = "-setup-time";

    /// Suffix of the predict-duration stats stream.
    pub const RUN_TIME_SUFFIX: &'static str = "-run-time";

    /// Reclaim window used when no predict timeout is configured.
    pub const DEFAULT_AUTOCLAIM_AFTER: Duration = Duration::from_secs(10 * 60);

    /// Extra time on top of the predict timeout before another worker may
    /// reclaim a pending message. The grace period lets a timing-out worker
    /// emit its final response and ack before the job changes hands.
    pub const AUTOCLAIM_GRACE: Duration = Duration::from_secs(30);

    /// How long a pending message must sit idle before this worker claims it.
    pub fn autoclaim_after(&self) -> Duration {
        match self.predict_timeout {
            Some(secs) => Duration::from_secs(secs) + Self::AUTOCLAIM_GRACE,
            None => Self::DEFAULT_AUTOCLAIM_AFTER,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(predict_timeout: Option<u64>) -> WorkerConfig {
        WorkerConfig {
            input_queue: "input_queue".to_string(),
            consumer_id: "worker-1".to_string(),
            predict_timeout,
            report_setup_run_url: None,
            max_failure_count: None,
        }
    }

    #[test]
    fn autoclaim_window_includes_grace() {
        assert_eq!(config(Some(60)).autoclaim_after(), Duration::from_secs(90));
        assert_eq!(config(None).autoclaim_after(), Duration::from_secs(600));
    }
}
