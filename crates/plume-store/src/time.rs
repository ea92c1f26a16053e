//! Timestamp encoding for SQLite columns.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings so that plain
//! string comparison in SQL orders them chronologically.

use chrono::{DateTime, SecondsFormat, Utc};

/// Format a timestamp for storage (`2026-01-02T03:04:05.123456Z`).
pub fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored (or user supplied) RFC 3339 timestamp into UTC.
pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    #[test]
    fn test_format_is_fixed_width() {
        let a = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format_ts(a), "2026-01-02T03:04:05.000000Z");
    }

    #[test]
    fn test_parse_normalizes_offsets() {
        let parsed = parse_ts("2026-01-02T05:04:05+02:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_ts("tomorrow at noon").is_none());
        assert!(parse_ts("").is_none());
    }

    proptest! {
        // String order of formatted timestamps must match chronological order
        #[test]
        fn string_order_matches_time_order(a in 0i64..4_000_000_000_000_000, b in 0i64..4_000_000_000_000_000) {
            let base = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
            let ta = base + Duration::microseconds(a);
            let tb = base + Duration::microseconds(b);
            prop_assert_eq!(ta.cmp(&tb), format_ts(ta).cmp(&format_ts(tb)));
        }
    }
}
