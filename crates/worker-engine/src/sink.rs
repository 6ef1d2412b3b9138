//! Per-job response sinks.
//!
//! Each job gets a fresh sink bound to its destination: the webhook URL when
//! present, otherwise the job's pub/sub channel. The sink owns whatever
//! per-endpoint retry state the destination needs, which is why it is
//! rebuilt per job instead of shared.

use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use predq_core::{Response, WebhookEvent};

/// Delivers one status payload to the job's requester.
#[async_trait::async_trait]
pub trait ResponseSink: Send + Sync {
    /// Serialize and deliver `response` for the given event kind.
    async fn send(&self, event: WebhookEvent, response: &Response) -> anyhow::Result<()>;
}

/// POSTs responses to the job's webhook endpoint.
pub struct WebhookSink {
    http: reqwest::Client,
    url: String,
}

impl WebhookSink {
    const TERMINAL_ATTEMPTS: u32 = 3;

    /// Bind a sink to one job's webhook URL.
    pub fn new(http: reqwest::Client, url: String) -> Self {
        Self { http, url }
    }

    async fn post(&self, response: &Response) -> anyhow::Result<()> {
        let reply = self.http.post(&self.url).json(response).send().await?;
        if !reply.status().is_success() {
            anyhow::bail!("webhook returned http {}", reply.status());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResponseSink for WebhookSink {
    async fn send(&self, event: WebhookEvent, response: &Response) -> anyhow::Result<()> {
        if event != WebhookEvent::Completed {
            // Intermediate events are advisory; a flaky endpoint must not
            // fail the job.
            if let Err(err) = self.post(response).await {
                tracing::warn!(url = %self.url, %event, "dropping webhook event: {err:#}");
            }
            return Ok(());
        }

        let mut last_err = None;
        for attempt in 1..=Self::TERMINAL_ATTEMPTS {
            match self.post(response).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        url = %self.url,
                        attempt,
                        "webhook completed delivery failed: {err:#}"
                    );
                    last_err = Some(err);
                    if attempt < Self::TERMINAL_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("webhook delivery failed")))
    }
}

/// Publishes responses to the job's pub/sub channel.
pub struct PubSubSink {
    redis: ConnectionManager,
    channel: String,
}

impl PubSubSink {
    /// Bind a sink to one job's channel.
    pub fn new(redis: ConnectionManager, channel: String) -> Self {
        Self { redis, channel }
    }
}

#[async_trait::async_trait]
impl ResponseSink for PubSubSink {
    async fn send(&self, _event: WebhookEvent, response: &Response) -> anyhow::Result<()> {
        let payload = serde_json::to_string(response)?;
        let mut redis = self.redis.clone();
        let _: i64 = redis.publish(&self.channel, payload).await?;
        Ok(())
    }
}

/// Build the sink for one job. The webhook takes precedence; a job with
/// neither destination is malformed.
pub fn sink_for_job(
    http: &reqwest::Client,
    redis: &ConnectionManager,
    message: &Response,
) -> anyhow::Result<Arc<dyn ResponseSink>> {
    if let Some(url) = &message.webhook {
        return Ok(Arc::new(WebhookSink::new(http.clone(), url.clone())));
    }
    if let Some(channel) = &message.redis_pubsub_key {
        return Ok(Arc::new(PubSubSink::new(redis.clone(), channel.clone())));
    }
    anyhow::bail!("job has neither webhook nor redis_pubsub_key")
}
