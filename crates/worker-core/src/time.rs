//! Stream-id and timestamp helpers.

use chrono::{Local, NaiveDateTime};

/// Current local wall-clock time, naive (no offset).
pub fn now_local() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Format a timestamp as ISO-8601 with a literal trailing `Z`, so it also
/// parses as RFC-3339 for downstream consumers.
pub fn format_timestamp(timestamp: NaiveDateTime) -> String {
    format!("{}Z", timestamp.format("%Y-%m-%dT%H:%M:%S%.6f"))
}

/// Seconds between `started_at` and `completed_at`.
pub fn elapsed_seconds(started_at: NaiveDateTime, completed_at: NaiveDateTime) -> f64 {
    let delta = completed_at.signed_duration_since(started_at);
    delta.num_microseconds().unwrap_or(0) as f64 / 1_000_000.0
}

/// How long a message spent in the queue, from the millisecond timestamp in
/// the first 13 characters of its stream id. `None` when the id is malformed.
pub fn time_in_queue(message_id: &str, now_ms: i64) -> Option<f64> {
    let inserted_ms: i64 = message_id.get(..13)?.parse().ok()?;
    Some((now_ms - inserted_ms) as f64 / 1000.0)
}

/// Add a trailing slash to `prefix` if not already present.
pub fn ensure_trailing_slash(prefix: &str) -> String {
    if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}
