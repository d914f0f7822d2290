//! Time helpers shared across storage backends and the HTTP layer.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

/// Returns the current time as a Unix timestamp (seconds since epoch).
#[allow(clippy::cast_possible_wrap)]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Render a Unix timestamp as an RFC 3339 UTC string (`2026-02-22T03:00:00Z`).
///
/// Out-of-range values render as the empty string rather than panicking;
/// stored timestamps are always server-generated and in range.
pub fn format_rfc3339(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_default()
}
