//! Temporal decay for signal weighting (pure math, no DB).

use std::f64::consts::LN_2;

use chrono::{DateTime, Utc};

use crate::util::{age_days, parse_ts};

/// Half-life recency factor in `[0, 1]`.
///
/// `exp(-age_days / half_life_days * ln 2)`; a signal one half-life old
/// counts for half. Negative ages count as brand new.
pub fn recency_decay(age_days: f64, half_life_days: f64) -> f64 {
    if half_life_days <= 0.0 {
        return 1.0;
    }
    let age = age_days.max(0.0);
    (-age / half_life_days * LN_2).exp().clamp(0.0, 1.0)
}

/// Compute the decayed weight of a signal.
pub fn decayed_weight(base_weight: f64, age_days: f64, half_life_days: f64) -> f64 {
    base_weight * recency_decay(age_days, half_life_days)
}

/// Fractional days between a stored timestamp and `now`.
///
/// Unparseable timestamps are treated as fresh.
pub fn age_days_at(detected_at: &str, now: DateTime<Utc>) -> f64 {
    match parse_ts(detected_at) {
        Some(then) => age_days(then, now),
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_life_gives_half_weight() {
        let result = decayed_weight(1.0, 30.0, 30.0);
        assert!(
            (result - 0.5).abs() < 0.001,
            "expected ~0.5, got {}",
            result
        );
    }

    #[test]
    fn test_zero_age_full_weight() {
        assert_eq!(recency_decay(0.0, 14.0), 1.0);
        let result = decayed_weight(0.8, 0.0, 90.0);
        assert!((result - 0.8).abs() < 0.001);
    }

    #[test]
    fn test_double_half_life_quarter_weight() {
        let result = decayed_weight(1.0, 60.0, 30.0);
        assert!(
            (result - 0.25).abs() < 0.001,
            "expected ~0.25, got {}",
            result
        );
    }

    #[test]
    fn test_decay_strictly_decreasing_and_positive() {
        let mut prev = recency_decay(0.0, 14.0);
        for day in 1..=180 {
            let d = recency_decay(day as f64, 14.0);
            assert!(d > 0.0 && d <= 1.0, "decay({}) = {} out of range", day, d);
            assert!(d < prev, "decay must fall between day {} and {}", day - 1, day);
            prev = d;
        }
    }

    #[test]
    fn test_negative_age_counts_as_new() {
        assert_eq!(recency_decay(-5.0, 30.0), 1.0);
    }

    #[test]
    fn test_zero_half_life_disables_decay() {
        assert_eq!(decayed_weight(0.9, 10.0, 0.0), 0.9);
    }

    #[test]
    fn test_age_days_at_sqlite_format() {
        let now = DateTime::parse_from_rfc3339("2026-03-11T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let age = age_days_at("2026-03-01 00:00:00", now);
        assert!((age - 10.0).abs() < 1e-9, "expected 10 days, got {}", age);
        assert_eq!(age_days_at("garbage", now), 0.0);
    }
}
