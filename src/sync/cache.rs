//! TTL cache for analytics query results, stored in `query_cache`.
//!
//! Keys are the hex SHA-256 of the integration name plus the canonical JSON
//! of the query parameters: object keys are sorted at every depth, so two
//! parameter maps that differ only in key order share one entry.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::client::{AnalyticsClient, AnalyticsQuery};
use super::rate_limiter::RateLimiter;
use crate::db::{DbCacheEntry, DbError, SharedDb};
use crate::error::SyncError;
use crate::util::{parse_ts, ts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: i64,
    pub expired_entries: i64,
    pub total_hits: i64,
}

/// Deterministic cache key for `params` under `integration`.
pub fn cache_key(integration: &str, params: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(integration.as_bytes());
    hasher.update(b":");
    hasher.update(canonical_json(params).as_bytes());
    hex::encode(hasher.finalize())
}

fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&sorted(value)).unwrap_or_default()
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), sorted(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

#[derive(Clone)]
pub struct QueryCache {
    db: SharedDb,
    integration: String,
    ttl_secs: i64,
}

impl QueryCache {
    pub fn new(db: SharedDb, integration: &str, ttl_secs: i64) -> Self {
        Self {
            db,
            integration: integration.to_string(),
            ttl_secs,
        }
    }

    pub fn get<T: DeserializeOwned>(&self, params: &Value) -> Result<Option<T>, DbError> {
        self.get_at(params, Utc::now())
    }

    /// Look up a live entry. Expired or undecodable entries are deleted and
    /// read as a miss; a hit bumps the hit count.
    pub fn get_at<T: DeserializeOwned>(
        &self,
        params: &Value,
        now: DateTime<Utc>,
    ) -> Result<Option<T>, DbError> {
        let key = cache_key(&self.integration, params);
        let db = self.db.lock();
        let Some(entry) = db.get_cache_entry(&key)? else {
            return Ok(None);
        };

        let expired = entry
            .expires_at
            .as_deref()
            .and_then(parse_ts)
            .is_some_and(|exp| exp <= now);
        if expired {
            db.delete_cache_entry(&key)?;
            return Ok(None);
        }

        match serde_json::from_str::<T>(&entry.result) {
            Ok(value) => {
                db.record_cache_hit(&key, &ts(now))?;
                Ok(Some(value))
            }
            Err(e) => {
                log::warn!("Dropping undecodable cache entry {}: {}", key, e);
                db.delete_cache_entry(&key)?;
                Ok(None)
            }
        }
    }

    pub fn set<T: Serialize>(&self, params: &Value, result: &T) -> Result<(), DbError> {
        self.set_at(params, result, Utc::now())
    }

    pub fn set_at<T: Serialize>(
        &self,
        params: &Value,
        result: &T,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.set_with_ttl_at(params, result, self.ttl_secs, now)
    }

    /// Store `result` for `ttl_secs` instead of the cache default.
    pub fn set_with_ttl<T: Serialize>(
        &self,
        params: &Value,
        result: &T,
        ttl_secs: i64,
    ) -> Result<(), DbError> {
        self.set_with_ttl_at(params, result, ttl_secs, Utc::now())
    }

    /// Store `result`, replacing any entry for the same key. A `ttl_secs` of
    /// zero or less never expires.
    pub fn set_with_ttl_at<T: Serialize>(
        &self,
        params: &Value,
        result: &T,
        ttl_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let encoded = match serde_json::to_string(result) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("Not caching {} result: {}", self.integration, e);
                return Ok(());
            }
        };
        let entry = DbCacheEntry {
            cache_key: cache_key(&self.integration, params),
            integration_name: self.integration.clone(),
            result: encoded,
            created_at: ts(now),
            expires_at: (ttl_secs > 0).then(|| ts(now + Duration::seconds(ttl_secs))),
            hit_count: 0,
            last_accessed_at: None,
        };
        self.db.lock().upsert_cache_entry(&entry)
    }

    pub fn invalidate(&self, params: &Value) -> Result<bool, DbError> {
        self.db
            .lock()
            .delete_cache_entry(&cache_key(&self.integration, params))
    }

    pub fn invalidate_integration(&self) -> Result<usize, DbError> {
        self.db.lock().delete_cache_for_integration(&self.integration)
    }

    /// Delete every expired entry, across all integrations.
    pub fn cleanup_expired(&self) -> Result<usize, DbError> {
        self.cleanup_expired_at(Utc::now())
    }

    pub fn cleanup_expired_at(&self, now: DateTime<Utc>) -> Result<usize, DbError> {
        let removed = self.db.lock().delete_expired_cache(&ts(now))?;
        if removed > 0 {
            log::info!("Removed {} expired cache entries", removed);
        }
        Ok(removed)
    }

    pub fn stats(&self) -> Result<CacheStats, DbError> {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> Result<CacheStats, DbError> {
        let (entries, expired_entries, total_hits) =
            self.db.lock().cache_stats(&self.integration, &ts(now))?;
        Ok(CacheStats {
            entries,
            expired_entries,
            total_hits,
        })
    }

    /// Serve `query` from cache, or spend one request from `limiter` and run
    /// it. Only successful results are cached. A failed cache write is logged
    /// and the fresh result is still returned.
    pub async fn get_or_execute(
        &self,
        limiter: &RateLimiter,
        client: &dyn AnalyticsClient,
        query: &AnalyticsQuery,
    ) -> Result<Vec<Value>, SyncError> {
        let signature = query.signature();
        if let Some(rows) = self.get::<Vec<Value>>(&signature)? {
            log::debug!("Cache hit for query {}", query.name);
            return Ok(rows);
        }

        limiter.acquire(1).await?;
        let result = client.execute_query(query).await;
        if !result.success {
            return Err(SyncError::Analytics(format!(
                "query {} failed: {}",
                query.name,
                result.error.as_deref().unwrap_or("unknown error")
            )));
        }

        if let Err(e) = self.set(&signature, &result.data) {
            log::warn!("Could not cache result of query {}: {}", query.name, e);
        }
        Ok(result.data)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::db::test_utils::test_db;
    use crate::sync::client::mock::MockAnalytics;
    use crate::sync::client::QueryResult;
    use crate::sync::RateLimitPolicy;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_key_ignores_object_key_order() {
        let a = json!({"b": 1, "a": {"y": 2, "x": [1, {"q": 1, "p": 2}]}});
        let b = json!({"a": {"x": [1, {"p": 2, "q": 1}], "y": 2}, "b": 1});
        assert_eq!(cache_key("analytics", &a), cache_key("analytics", &b));
        assert_ne!(cache_key("analytics", &a), cache_key("crm", &a));
        assert_eq!(cache_key("analytics", &a).len(), 64);
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let cache = QueryCache::new(test_db().into_shared(), "analytics", 60);
        let params = json!({"q": "usage"});
        cache.set_at(&params, &vec![1, 2, 3], now()).unwrap();

        let hit: Option<Vec<i32>> = cache.get_at(&params, now() + Duration::seconds(59)).unwrap();
        assert_eq!(hit, Some(vec![1, 2, 3]));

        let miss: Option<Vec<i32>> = cache.get_at(&params, now() + Duration::seconds(60)).unwrap();
        assert_eq!(miss, None);
        assert_eq!(cache.stats_at(now()).unwrap().entries, 0);
    }

    #[test]
    fn test_per_call_ttl_overrides_default() {
        let cache = QueryCache::new(test_db().into_shared(), "analytics", 3_600);
        let params = json!({"q": "trial"});
        cache.set_with_ttl_at(&params, &"soon", 1, now()).unwrap();

        let hit: Option<String> = cache.get_at(&params, now()).unwrap();
        assert_eq!(hit.as_deref(), Some("soon"));

        let miss: Option<String> = cache.get_at(&params, now() + Duration::seconds(1)).unwrap();
        assert_eq!(miss, None);
        assert_eq!(cache.stats_at(now()).unwrap().entries, 0);
    }

    #[test]
    fn test_hits_are_counted_and_reset_on_set() {
        let cache = QueryCache::new(test_db().into_shared(), "analytics", 0);
        let params = json!({"q": "seats"});
        cache.set_at(&params, &"x", now()).unwrap();
        for _ in 0..3 {
            let _: Option<String> = cache.get_at(&params, now()).unwrap();
        }
        assert_eq!(cache.stats_at(now()).unwrap().total_hits, 3);

        cache.set_at(&params, &"y", now()).unwrap();
        let stats = cache.stats_at(now()).unwrap();
        assert_eq!(stats.total_hits, 0);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_undecodable_entry_is_a_miss() {
        let cache = QueryCache::new(test_db().into_shared(), "analytics", 0);
        let params = json!({"q": 1});
        cache.set_at(&params, &"text", now()).unwrap();
        let got: Option<Vec<i64>> = cache.get_at(&params, now()).unwrap();
        assert!(got.is_none());
        assert!(!cache.invalidate(&params).unwrap());
    }

    #[test]
    fn test_cleanup_expired_removes_only_stale() {
        let db = test_db().into_shared();
        let short = QueryCache::new(db.clone(), "analytics", 10);
        let forever = QueryCache::new(db, "analytics", 0);
        short.set_at(&json!({"k": 1}), &1, now()).unwrap();
        forever.set_at(&json!({"k": 2}), &2, now()).unwrap();

        let removed = short.cleanup_expired_at(now() + Duration::seconds(11)).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(forever.stats_at(now()).unwrap().entries, 1);
        assert_eq!(forever.invalidate_integration().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_or_execute_uses_cache_on_second_call() {
        let db = test_db().into_shared();
        let cache = QueryCache::new(db.clone(), "analytics", 3_600);
        let limiter = RateLimiter::new(db, "analytics", RateLimitPolicy::analytics_default());
        let client = MockAnalytics::new();
        client.respond("expansion", QueryResult::ok(vec![json!({"account_id": "a"})]));
        let query = AnalyticsQuery::new("expansion", json!({"days": 7}));

        let first = cache.get_or_execute(&limiter, &client, &query).await.unwrap();
        let second = cache.get_or_execute(&limiter, &client, &query).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(client.call_count(), 1);
        assert_eq!(limiter.get_current_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cache_write_failure_still_returns_rows() {
        let db = test_db().into_shared();
        db.lock()
            .conn_ref()
            .execute_batch(
                "CREATE TRIGGER reject_cache_writes BEFORE INSERT ON query_cache
                 BEGIN SELECT RAISE(FAIL, 'disk full'); END;",
            )
            .unwrap();
        let cache = QueryCache::new(db.clone(), "analytics", 3_600);
        let limiter = RateLimiter::new(db, "analytics", RateLimitPolicy::analytics_default());
        let client = MockAnalytics::new();
        client.respond("expansion", QueryResult::ok(vec![json!({"account_id": "a"})]));
        let query = AnalyticsQuery::new("expansion", json!({}));

        let rows = cache.get_or_execute(&limiter, &client, &query).await.unwrap();
        assert_eq!(rows, vec![json!({"account_id": "a"})]);
        assert_eq!(client.call_count(), 1);
        assert_eq!(cache.stats().unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_failed_query_is_not_cached() {
        let db = test_db().into_shared();
        let cache = QueryCache::new(db.clone(), "analytics", 3_600);
        let limiter = RateLimiter::new(db, "analytics", RateLimitPolicy::analytics_default());
        let client = MockAnalytics::new();
        let query = AnalyticsQuery::new("missing", json!({}));

        let err = cache.get_or_execute(&limiter, &client, &query).await.unwrap_err();
        assert!(matches!(err, SyncError::Analytics(_)));
        let _ = cache.get_or_execute(&limiter, &client, &query).await;
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_limiter_blocks_query() {
        let db = test_db().into_shared();
        let cache = QueryCache::new(db.clone(), "analytics", 3_600);
        let limiter = RateLimiter::new(
            db,
            "analytics",
            RateLimitPolicy {
                limit: 0,
                window_seconds: 3_600,
            },
        );
        let client = MockAnalytics::new();
        let query = AnalyticsQuery::new("expansion", json!({}));
        let err = cache.get_or_execute(&limiter, &client, &query).await.unwrap_err();
        assert!(matches!(err, SyncError::RateLimited(_)));
        assert_eq!(client.call_count(), 0);
    }
}
