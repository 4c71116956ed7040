//! Time-related utilities

use chrono::{DateTime, NaiveDateTime, Utc};

/// Wire format devices use for timestamps (always UTC).
pub const WIRE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// A timestamp string in neither supported format
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid timestamp {0:?}: expected 'YYYY-MM-DD HH:MM:SS.mmm' or RFC 3339")]
pub struct TimestampError(pub String);

/// Format a timestamp in the device wire format.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(WIRE_TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp in the device wire format or RFC 3339.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, TimestampError> {
    let s = s.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| TimestampError(s.to_string()))
}

/// Milliseconds since the UNIX epoch, as stored by the sinks.
pub fn to_unix_millis(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Inverse of [`to_unix_millis`]; out-of-range values clamp to the epoch.
pub fn from_unix_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
