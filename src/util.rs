//! Timestamp helpers shared by every store.
//!
//! All persisted timestamps use one fixed-width RFC3339 shape
//! (`2026-01-05T09:30:00.000000Z`) so that plain string comparison in SQL
//! orders them chronologically.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

/// Format a UTC instant in the canonical storage shape.
pub fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Canonical timestamp for "now".
pub fn now_ts() -> String {
    ts(Utc::now())
}

/// Parse a stored timestamp.
///
/// Accepts RFC3339 (any offset) and the bare SQLite `datetime()` format.
pub fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Parse a `YYYY-MM-DD` date, tolerating a trailing time component.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let head = value.get(..10).unwrap_or(value);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// Fractional days between `then` and `now`, never negative.
pub fn age_days(then: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let secs = (now - then).num_milliseconds() as f64 / 1000.0;
    (secs / 86_400.0).max(0.0)
}

/// Lower-case and trim a key for case-insensitive matching.
pub fn normalize_key(value: &str) -> String {
    value.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ts_is_fixed_width_and_sortable() {
        let a = Utc.with_ymd_and_hms(2026, 1, 5, 9, 30, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(1500);
        let (sa, sb) = (ts(a), ts(b));
        assert_eq!(sa, "2026-01-05T09:30:00.000000Z");
        assert_eq!(sa.len(), sb.len());
        assert!(sa < sb);
    }

    #[test]
    fn test_parse_ts_round_trips_and_accepts_sqlite_format() {
        let a = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_ts(&ts(a)), Some(a));
        assert_eq!(parse_ts("2026-03-01 12:00:00"), Some(a));
        assert_eq!(parse_ts("not a date"), None);
    }

    #[test]
    fn test_parse_date_with_time_suffix() {
        let d = parse_date("2026-06-30T00:00:00Z").unwrap();
        assert_eq!(d, NaiveDate::from_ymd_opt(2026, 6, 30).unwrap());
    }

    #[test]
    fn test_age_days_clamps_future_to_zero() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let later = now + chrono::Duration::days(2);
        assert_eq!(age_days(later, now), 0.0);
        assert!((age_days(now - chrono::Duration::hours(36), now) - 1.5).abs() < 1e-9);
    }
}
