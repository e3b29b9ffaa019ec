//! Sliding-window request budgets per integration.
//!
//! Counts live in hourly buckets (`window_start` truncated to the hour).
//! Buckets that fall wholly before the window are pruned on every read, so
//! the scan stays small.
//!
//! `can_proceed` followed by `record_request` is best-effort admission:
//! two callers can both pass the check before either records.
//! `check_and_record` does the check and the increment in one write
//! transaction, so concurrent callers on the same database cannot overspend.

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;

use super::RateLimitPolicy;
use crate::db::{AccountDb, DbError, SharedDb};
use crate::error::{RateLimitExceeded, SyncError};
use crate::util::ts;

/// Retry hint handed back when the budget is spent.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub integration: String,
    pub limit: i64,
    pub used: i64,
    pub remaining: i64,
    pub window_seconds: i64,
}

#[derive(Clone)]
pub struct RateLimiter {
    db: SharedDb,
    integration: String,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new(db: SharedDb, integration: &str, policy: RateLimitPolicy) -> Self {
        Self {
            db,
            integration: integration.to_string(),
            policy,
        }
    }

    pub fn integration(&self) -> &str {
        &self.integration
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Requests counted inside the window ending at `now`.
    pub fn get_current_count(&self) -> Result<i64, DbError> {
        self.get_current_count_at(Utc::now())
    }

    pub fn get_current_count_at(&self, now: DateTime<Utc>) -> Result<i64, DbError> {
        let db = self.db.lock();
        self.count_locked(&db, now)
    }

    pub fn can_proceed(&self, cost: i64) -> Result<bool, DbError> {
        self.can_proceed_at(cost, Utc::now())
    }

    pub fn can_proceed_at(&self, cost: i64, now: DateTime<Utc>) -> Result<bool, DbError> {
        Ok(self.policy.limit - self.get_current_count_at(now)? >= cost)
    }

    /// Add `cost` to the current hour's bucket.
    pub fn record_request(&self, cost: i64) -> Result<(), DbError> {
        self.record_request_at(cost, Utc::now())
    }

    pub fn record_request_at(&self, cost: i64, now: DateTime<Utc>) -> Result<(), DbError> {
        let db = self.db.lock();
        db.increment_rate_limit_window(&self.integration, &ts(hour_floor(now)), cost)
    }

    /// Spend `cost` from the budget or fail with a retry-after hint.
    pub fn check_and_record(&self, cost: i64) -> Result<(), SyncError> {
        self.check_and_record_at(cost, Utc::now())
    }

    /// `check_and_record` on the blocking pool. The budget check holds the
    /// database mutex through a `BEGIN IMMEDIATE` transaction, which must not
    /// stall an async worker.
    pub async fn acquire(&self, cost: i64) -> Result<(), SyncError> {
        let limiter = self.clone();
        let task = tokio::task::spawn_blocking(move || limiter.check_and_record(cost));
        match task.await {
            Ok(result) => result,
            Err(e) => Err(SyncError::Task(format!("rate limit check panicked: {}", e))),
        }
    }

    pub fn check_and_record_at(&self, cost: i64, now: DateTime<Utc>) -> Result<(), SyncError> {
        let admitted = {
            let db = self.db.lock();
            db.with_transaction(|tx| {
                let used = self.count_locked(tx, now)?;
                if self.policy.limit - used < cost {
                    return Ok(false);
                }
                tx.increment_rate_limit_window(&self.integration, &ts(hour_floor(now)), cost)?;
                Ok(true)
            })?
        };

        if admitted {
            Ok(())
        } else {
            log::warn!(
                "Rate limit reached for {} ({} per {}s)",
                self.integration,
                self.policy.limit,
                self.policy.window_seconds
            );
            Err(RateLimitExceeded {
                integration: self.integration.clone(),
                retry_after: DEFAULT_RETRY_AFTER_SECS,
            }
            .into())
        }
    }

    pub fn status(&self) -> Result<RateLimitStatus, DbError> {
        self.status_at(Utc::now())
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> Result<RateLimitStatus, DbError> {
        let used = self.get_current_count_at(now)?;
        Ok(RateLimitStatus {
            integration: self.integration.clone(),
            limit: self.policy.limit,
            used,
            remaining: (self.policy.limit - used).max(0),
            window_seconds: self.policy.window_seconds,
        })
    }

    /// Prune then sum. The bucket straddling the window start still counts.
    fn count_locked(&self, db: &AccountDb, now: DateTime<Utc>) -> Result<i64, DbError> {
        let cutoff = ts(hour_floor(now - Duration::seconds(self.policy.window_seconds)));
        db.prune_rate_limit_windows(&self.integration, &cutoff)?;
        db.sum_rate_limit_windows(&self.integration, &cutoff)
    }
}

/// Truncate to the start of the hour.
fn hour_floor(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(Duration::hours(1)).unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::db::test_utils::test_db;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 10, 25, 0).unwrap()
    }

    fn limiter(limit: i64) -> RateLimiter {
        RateLimiter::new(
            test_db().into_shared(),
            "analytics",
            RateLimitPolicy {
                limit,
                window_seconds: 3_600,
            },
        )
    }

    #[test]
    fn test_count_matches_recorded_and_blocks_at_limit() {
        let rl = limiter(5);
        for _ in 0..5 {
            assert!(rl.can_proceed_at(1, now()).unwrap());
            rl.record_request_at(1, now()).unwrap();
        }
        assert_eq!(rl.get_current_count_at(now()).unwrap(), 5);
        assert!(!rl.can_proceed_at(1, now()).unwrap());
    }

    #[test]
    fn test_old_buckets_roll_out_of_window() {
        let rl = limiter(5);
        rl.record_request_at(3, now() - Duration::hours(3)).unwrap();
        rl.record_request_at(2, now()).unwrap();
        assert_eq!(rl.get_current_count_at(now()).unwrap(), 2);
    }

    #[test]
    fn test_check_and_record_refuses_over_budget() {
        let rl = limiter(2);
        rl.check_and_record_at(1, now()).unwrap();
        rl.check_and_record_at(1, now()).unwrap();
        let err = rl.check_and_record_at(1, now()).unwrap_err();
        match err {
            SyncError::RateLimited(e) => {
                assert_eq!(e.retry_after, DEFAULT_RETRY_AFTER_SECS);
                assert_eq!(e.integration, "analytics");
            }
            other => panic!("expected rate limit, got {:?}", other),
        }
        // the refused call did not spend anything
        assert_eq!(rl.get_current_count_at(now()).unwrap(), 2);
    }

    #[test]
    fn test_cost_larger_than_remaining() {
        let rl = limiter(10);
        rl.record_request_at(8, now()).unwrap();
        assert!(rl.can_proceed_at(2, now()).unwrap());
        assert!(!rl.can_proceed_at(3, now()).unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_never_overspends() {
        let rl = limiter(5);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rl = rl.clone();
                tokio::spawn(async move { rl.acquire(1).await })
            })
            .collect();

        let mut admitted = 0;
        let mut refused = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => admitted += 1,
                Err(SyncError::RateLimited(_)) => refused += 1,
                Err(other) => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!((admitted, refused), (5, 3));
        assert_eq!(rl.get_current_count().unwrap(), 5);
    }

    #[test]
    fn test_status_reports_remaining() {
        let rl = limiter(10);
        rl.record_request_at(4, now()).unwrap();
        let status = rl.status_at(now()).unwrap();
        assert_eq!(status.used, 4);
        assert_eq!(status.remaining, 6);
        assert_eq!(status.window_seconds, 3_600);
    }

    #[test]
    fn test_hour_floor() {
        assert_eq!(
            hour_floor(now()),
            Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()
        );
    }
}
