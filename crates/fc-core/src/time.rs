//! Time utilities for fleet-control
//!
//! Wall-clock timestamps are `chrono::DateTime<Utc>`; timers use the tokio
//! clock so tests can pause and advance it.

use chrono::{DateTime, SecondsFormat, Utc};
use std::time::Duration;

/// Wall-clock timestamp stored on records
pub type Timestamp = DateTime<Utc>;

/// Current wall-clock time
pub fn now() -> Timestamp {
    Utc::now()
}

/// Get the current Unix timestamp in milliseconds.
pub fn current_time_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Format a timestamp the way the append-only logs store it (RFC 3339, millis, `Z`).
pub fn log_timestamp(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Time elapsed since `since`, zero if `since` is in the future.
pub fn elapsed_since(since: &Timestamp) -> Duration {
    (Utc::now() - *since).to_std().unwrap_or(Duration::ZERO)
}

/// Whether `ts` is older than `age` relative to now.
pub fn is_older_than(ts: &Timestamp, age: Duration) -> bool {
    elapsed_since(ts) > age
}
