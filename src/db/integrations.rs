//! Per-integration bookkeeping: rate-limit windows, the analytics query
//! cache, and resumable sync state.

use rusqlite::{params, OptionalExtension, Row};

use super::*;

impl AccountDb {
    // =========================================================================
    // Rate-limit windows
    // =========================================================================

    /// Drop buckets that started before `cutoff`. Returns buckets removed.
    pub fn prune_rate_limit_windows(&self, integration: &str, cutoff: &str) -> Result<usize, DbError> {
        Ok(self.conn.execute(
            "DELETE FROM rate_limit_windows WHERE integration_name = ?1 AND window_start < ?2",
            params![integration, cutoff],
        )?)
    }

    /// Sum of request counts in buckets starting at or after `since`.
    pub fn sum_rate_limit_windows(&self, integration: &str, since: &str) -> Result<i64, DbError> {
        Ok(self.conn.query_row(
            "SELECT COALESCE(SUM(query_count), 0) FROM rate_limit_windows
             WHERE integration_name = ?1 AND window_start >= ?2",
            params![integration, since],
            |row| row.get(0),
        )?)
    }

    /// Add `cost` to the bucket at `window_start`, creating it if needed.
    /// The upsert-and-add is a single statement.
    pub fn increment_rate_limit_window(
        &self,
        integration: &str,
        window_start: &str,
        cost: i64,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO rate_limit_windows (integration_name, window_start, query_count)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(integration_name, window_start) DO UPDATE SET
                 query_count = rate_limit_windows.query_count + excluded.query_count",
            params![integration, window_start, cost],
        )?;
        Ok(())
    }

    // =========================================================================
    // Query cache
    // =========================================================================

    pub fn get_cache_entry(&self, cache_key: &str) -> Result<Option<DbCacheEntry>, DbError> {
        Ok(self
            .conn
            .query_row(
                "SELECT cache_key, integration_name, result, created_at, expires_at, hit_count, last_accessed_at
                 FROM query_cache WHERE cache_key = ?1",
                params![cache_key],
                Self::map_cache_row,
            )
            .optional()?)
    }

    /// Insert or replace a cache entry. Replacing resets `hit_count`.
    pub fn upsert_cache_entry(&self, entry: &DbCacheEntry) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO query_cache
                (cache_key, integration_name, result, created_at, expires_at, hit_count, last_accessed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL)
             ON CONFLICT(cache_key) DO UPDATE SET
                integration_name = excluded.integration_name,
                result = excluded.result,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at,
                hit_count = 0,
                last_accessed_at = NULL",
            params![
                entry.cache_key,
                entry.integration_name,
                entry.result,
                entry.created_at,
                entry.expires_at,
            ],
        )?;
        Ok(())
    }

    pub fn record_cache_hit(&self, cache_key: &str, at: &str) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE query_cache SET hit_count = hit_count + 1, last_accessed_at = ?1
             WHERE cache_key = ?2",
            params![at, cache_key],
        )?;
        Ok(())
    }

    pub fn delete_cache_entry(&self, cache_key: &str) -> Result<bool, DbError> {
        let rows = self
            .conn
            .execute("DELETE FROM query_cache WHERE cache_key = ?1", params![cache_key])?;
        Ok(rows > 0)
    }

    pub fn delete_cache_for_integration(&self, integration: &str) -> Result<usize, DbError> {
        Ok(self.conn.execute(
            "DELETE FROM query_cache WHERE integration_name = ?1",
            params![integration],
        )?)
    }

    /// Delete every entry whose expiry is at or before `now`.
    pub fn delete_expired_cache(&self, now: &str) -> Result<usize, DbError> {
        Ok(self.conn.execute(
            "DELETE FROM query_cache WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now],
        )?)
    }

    /// `(entries, expired_entries, total_hits)` for one integration.
    pub fn cache_stats(&self, integration: &str, now: &str) -> Result<(i64, i64, i64), DbError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN expires_at IS NOT NULL AND expires_at <= ?2 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(hit_count), 0)
             FROM query_cache WHERE integration_name = ?1",
            params![integration, now],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?)
    }

    fn map_cache_row(row: &Row<'_>) -> rusqlite::Result<DbCacheEntry> {
        Ok(DbCacheEntry {
            cache_key: row.get(0)?,
            integration_name: row.get(1)?,
            result: row.get(2)?,
            created_at: row.get(3)?,
            expires_at: row.get(4)?,
            hit_count: row.get(5)?,
            last_accessed_at: row.get(6)?,
        })
    }

    // =========================================================================
    // Sync state
    // =========================================================================

    pub fn get_sync_state(&self, integration: &str) -> Result<Option<DbSyncState>, DbError> {
        Ok(self
            .conn
            .query_row(
                "SELECT integration_name, status, records_processed, records_succeeded, records_failed,
                        cursor_data, error_summary, last_sync_started_at, last_sync_completed_at,
                        last_successful_sync_at, updated_at
                 FROM sync_states WHERE integration_name = ?1",
                params![integration],
                Self::map_sync_state_row,
            )
            .optional()?)
    }

    pub fn upsert_sync_state(&self, state: &DbSyncState) -> Result<(), DbError> {
        let cursor = state
            .cursor_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn.execute(
            "INSERT INTO sync_states
                (integration_name, status, records_processed, records_succeeded, records_failed,
                 cursor_data, error_summary, last_sync_started_at, last_sync_completed_at,
                 last_successful_sync_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(integration_name) DO UPDATE SET
                status = excluded.status,
                records_processed = excluded.records_processed,
                records_succeeded = excluded.records_succeeded,
                records_failed = excluded.records_failed,
                cursor_data = excluded.cursor_data,
                error_summary = excluded.error_summary,
                last_sync_started_at = excluded.last_sync_started_at,
                last_sync_completed_at = excluded.last_sync_completed_at,
                last_successful_sync_at = excluded.last_successful_sync_at,
                updated_at = excluded.updated_at",
            params![
                state.integration_name,
                state.status,
                state.records_processed,
                state.records_succeeded,
                state.records_failed,
                cursor,
                state.error_summary,
                state.last_sync_started_at,
                state.last_sync_completed_at,
                state.last_successful_sync_at,
                state.updated_at,
            ],
        )?;
        Ok(())
    }

    fn map_sync_state_row(row: &Row<'_>) -> rusqlite::Result<DbSyncState> {
        let cursor_json: Option<String> = row.get(5)?;
        let cursor_data = cursor_json
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
            })?;
        Ok(DbSyncState {
            integration_name: row.get(0)?,
            status: row.get(1)?,
            records_processed: row.get(2)?,
            records_succeeded: row.get(3)?,
            records_failed: row.get(4)?,
            cursor_data,
            error_summary: row.get(6)?,
            last_sync_started_at: row.get(7)?,
            last_sync_completed_at: row.get(8)?,
            last_successful_sync_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }
}
