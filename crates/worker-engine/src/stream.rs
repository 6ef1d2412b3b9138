//! Consumer-group stream client.
//!
//! All workers in the pool share one consumer group (named after the stream
//! itself) and compete for entries. Each entry carries the job JSON in a
//! single `value` field.

use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamMaxlen, StreamReadOptions,
    StreamReadReply,
};

use crate::config::WorkerConfig;

/// Claim/read/ack/delete operations on the job stream, plus stats appends.
pub struct StreamClient {
    redis: ConnectionManager,
    input_queue: String,
    consumer_id: String,
    autoclaim_after_ms: u64,
}

impl StreamClient {
    /// Create a client for `input_queue`, reclaiming pending messages idle
    /// longer than `autoclaim_after`.
    pub fn new(
        redis: ConnectionManager,
        input_queue: String,
        consumer_id: String,
        autoclaim_after: Duration,
    ) -> Self {
        Self {
            redis,
            input_queue,
            consumer_id,
            autoclaim_after_ms: autoclaim_after.as_millis() as u64,
        }
    }

    /// Create the consumer group if it does not exist yet (with MKSTREAM so
    /// a fresh deployment does not depend on the producer going first).
    pub async fn ensure_group(&self) -> anyhow::Result<()> {
        let mut redis = self.redis.clone();
        let created: redis::RedisResult<String> = redis
            .xgroup_create_mkstream(&self.input_queue, &self.input_queue, "$")
            .await;
        match created {
            Ok(_) => Ok(()),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Receive one message: first try to reclaim a pending message from any
    /// consumer in the group, then block up to one second for a new one.
    /// Returns `None` on idle timeout so the caller can check for shutdown.
    pub async fn claim_or_read(&self) -> anyhow::Result<Option<(String, String)>> {
        let mut redis = self.redis.clone();

        let reclaimed: StreamAutoClaimReply = redis
            .xautoclaim_options(
                &self.input_queue,
                &self.input_queue,
                &self.consumer_id,
                self.autoclaim_after_ms,
                "0-0",
                StreamAutoClaimOptions::default().count(1),
            )
            .await?;
        if let Some(entry) = reclaimed.claimed.into_iter().next() {
            return decode_entry(entry).map(Some);
        }

        let options = StreamReadOptions::default()
            .group(&self.input_queue, &self.consumer_id)
            .count(1)
            .block(WorkerConfig::READ_BLOCK.as_millis() as usize);
        let reply: StreamReadReply = redis
            .xread_options(&[&self.input_queue], &[">"], &options)
            .await?;

        for key in reply.keys {
            if let Some(entry) = key.ids.into_iter().next() {
                return decode_entry(entry).map(Some);
            }
        }
        Ok(None)
    }

    /// Acknowledge a message in the consumer group and remove it from the
    /// stream. Only called once a terminal response has been emitted (or
    /// queued on the upload stage).
    pub async fn ack_and_delete(&self, message_id: &str) -> anyhow::Result<()> {
        let mut redis = self.redis.clone();
        let _: i64 = redis
            .xack(&self.input_queue, &self.input_queue, &[message_id])
            .await?;
        let _: i64 = redis.xdel(&self.input_queue, &[message_id]).await?;
        Ok(())
    }

    /// Append a duration sample to a bounded stats stream
    /// (`<input_queue><suffix>`).
    pub async fn record_duration(&self, suffix: &str, seconds: f64) -> anyhow::Result<()> {
        let mut redis = self.redis.clone();
        let stream = format!("{}{}", self.input_queue, suffix);
        let _: String = redis
            .xadd_maxlen(
                &stream,
                StreamMaxlen::Approx(WorkerConfig::STATS_MAXLEN),
                "*",
                &[("duration", seconds)],
            )
            .await?;
        Ok(())
    }
}

fn decode_entry(entry: StreamId) -> anyhow::Result<(String, String)> {
    let value = entry
        .map
        .get("value")
        .ok_or_else(|| anyhow::anyhow!("stream entry {} has no value field", entry.id))?;
    let payload: String = redis::from_redis_value(value)?;
    Ok((entry.id, payload))
}
