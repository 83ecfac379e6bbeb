use anyhow::Context;
use chrono::{NaiveDate, TimeZone, Utc};

/// Normalize an epoch timestamp to milliseconds.
///
/// Checkpoints written by older tooling sometimes carry seconds instead of millis:
/// - seconds:  1_700_000_000
/// - millis:   1_700_000_000_000
/// - micros:   1_700_000_000_000_000
/// - nanos:    1_700_000_000_000_000_000
pub fn normalize_epoch_to_ms(ts: i64) -> i64 {
    if ts <= 0 {
        return ts;
    }
    if ts >= 1_000_000_000_000_000_000 {
        return ts / 1_000_000;
    }
    if ts >= 1_000_000_000_000_000 {
        return ts / 1_000;
    }
    if ts >= 1_000_000_000_000 {
        return ts;
    }
    // seconds (>= ~2001-09 in s)
    if ts >= 1_000_000_000 {
        return ts.saturating_mul(1_000);
    }
    ts
}

/// Parse a window bound from config.
///
/// Accepts RFC 3339 (`2023-01-01T00:00:00Z`) or a bare UTC date (`2023-01-01`).
/// A bare date resolves to the first millisecond of the day, or the last one when
/// `end_of_day` is set, so `date_to = "2024-12-31"` covers the whole day.
pub fn parse_window_bound_ms(raw: &str, end_of_day: bool) -> anyhow::Result<i64> {
    let raw = raw.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.timestamp_millis());
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("parse date {raw:?} (expected YYYY-MM-DD or RFC 3339)"))?;
    let naive = if end_of_day {
        date.and_hms_milli_opt(23, 59, 59, 999)
    } else {
        date.and_hms_opt(0, 0, 0)
    }
    .with_context(|| format!("build datetime for {raw:?}"))?;
    Ok(Utc.from_utc_datetime(&naive).timestamp_millis())
}

pub fn format_time_str_ms(ts_ms: i64) -> String {
    // Example: 2023-01-01 00:00:00.000
    match Utc.timestamp_millis_opt(ts_ms).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => ts_ms.to_string(),
    }
}
