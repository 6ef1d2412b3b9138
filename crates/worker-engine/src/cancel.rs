//! Per-job cancel oracle.

use redis::AsyncCommands;
use redis::aio::ConnectionManager;

/// Reports whether an external cancel signal exists for the current job.
///
/// Polled by the driver on every heartbeat rather than subscribed, to keep
/// the driver loop simple.
#[async_trait::async_trait]
pub trait CancelOracle: Send + Sync {
    /// True iff the job should be canceled.
    async fn should_cancel(&self) -> anyhow::Result<bool>;
}

/// Cancel oracle backed by key existence in the coordination store.
pub struct RedisCancelOracle {
    redis: ConnectionManager,
    cancel_key: Option<String>,
}

impl RedisCancelOracle {
    /// Bind an oracle to a job's `cancel_key`. Jobs without one can never
    /// be canceled externally.
    pub fn new(redis: ConnectionManager, cancel_key: Option<String>) -> Self {
        Self { redis, cancel_key }
    }
}

#[async_trait::async_trait]
impl CancelOracle for RedisCancelOracle {
    async fn should_cancel(&self) -> anyhow::Result<bool> {
        let Some(key) = &self.cancel_key else {
            return Ok(false);
        };
        let mut redis = self.redis.clone();
        Ok(redis.exists(key).await?)
    }
}
