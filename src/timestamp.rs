//! Conversions between TStorage timestamps and POSIX time.
//!
//! A TStorage timestamp (used for both `cap` and `acq`) is nanoseconds
//! since 2001-01-01T00:00:00 UTC, leap seconds not counted. The offset
//! from the POSIX epoch is the fixed constant below.

/// Seconds between the POSIX epoch (1970-01-01) and the TStorage epoch
/// (2001-01-01T00:00:00 UTC).
pub const EPOCH_OFFSET_SECS: i64 = 978_307_200;
const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Converts a TStorage timestamp (nanoseconds since the TStorage epoch)
/// to POSIX seconds. Integer division truncates toward zero, matching
/// the original `ts / TEN_9 + EPOCH_DIFF`.
pub fn to_unix(ts: i64) -> i64 {
    ts / NANOS_PER_SEC + EPOCH_OFFSET_SECS
}

/// Converts POSIX seconds to a TStorage timestamp (nanoseconds since
/// the TStorage epoch).
pub fn from_unix(unix_secs: i64) -> i64 {
    (unix_secs - EPOCH_OFFSET_SECS) * NANOS_PER_SEC
}
