use rusqlite::params;

use super::*;
use crate::util::now_ts;

impl AccountDb {
    // =========================================================================
    // Raw events
    // =========================================================================

    /// Store a raw event. Duplicate IDs are ignored so replays are harmless.
    pub fn insert_event(&self, event: &DbEvent) -> Result<bool, DbError> {
        let rows = self.conn.execute(
            "INSERT OR IGNORE INTO events (id, account_id, user_id, event_type, occurred_at, properties)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id,
                event.account_id,
                event.user_id,
                event.event_type,
                event.occurred_at,
                event.properties,
            ],
        )?;
        Ok(rows > 0)
    }

    /// Count events of the given types in `[from, to)`.
    pub fn count_events_of_types(
        &self,
        account_id: &str,
        event_types: &[&str],
        from: &str,
        to: &str,
    ) -> Result<i64, DbError> {
        if event_types.is_empty() {
            return Ok(0);
        }
        let placeholders: Vec<String> = (0..event_types.len())
            .map(|i| format!("?{}", i + 4))
            .collect();
        let sql = format!(
            "SELECT COUNT(*) FROM events
             WHERE account_id = ?1 AND occurred_at >= ?2 AND occurred_at < ?3
               AND event_type IN ({})",
            placeholders.join(", ")
        );
        let mut values: Vec<&dyn rusqlite::ToSql> = vec![&account_id, &from, &to];
        for t in event_types {
            values.push(t);
        }
        Ok(self
            .conn
            .query_row(&sql, values.as_slice(), |row| row.get(0))?)
    }

    /// Distinct event types whose name starts with `prefix` in `[from, to)`.
    pub fn distinct_event_types_with_prefix(
        &self,
        account_id: &str,
        prefix: &str,
        from: &str,
        to: &str,
    ) -> Result<Vec<String>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT event_type FROM events
             WHERE account_id = ?1 AND occurred_at >= ?2 AND occurred_at < ?3
               AND substr(event_type, 1, length(?4)) = ?4
             ORDER BY event_type",
        )?;
        let rows = stmt.query_map(params![account_id, from, to, prefix], |row| row.get(0))?;
        let mut types = Vec::new();
        for row in rows {
            types.push(row?);
        }
        Ok(types)
    }

    /// The most active user in `[from, to)` with their event count.
    pub fn top_user_by_events(
        &self,
        account_id: &str,
        from: &str,
        to: &str,
    ) -> Result<Option<(String, i64)>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, COUNT(*) AS n FROM events
             WHERE account_id = ?1 AND occurred_at >= ?2 AND occurred_at < ?3
               AND user_id IS NOT NULL
             GROUP BY user_id
             ORDER BY n DESC, user_id
             LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![account_id, from, to], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Metric snapshots
    // =========================================================================

    /// Append snapshot rows inside one transaction. Returns rows written.
    pub fn insert_metric_snapshots(&self, snapshots: &[DbMetricSnapshot]) -> Result<usize, DbError> {
        if snapshots.is_empty() {
            return Ok(0);
        }
        let created_at = now_ts();
        self.with_transaction(|db| {
            let mut stmt = db.conn.prepare_cached(
                "INSERT INTO metric_snapshots (account_id, metric_name, value, date, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for snap in snapshots {
                stmt.execute(params![
                    snap.account_id,
                    snap.metric_name,
                    snap.value,
                    snap.date,
                    created_at,
                ])?;
            }
            Ok(snapshots.len())
        })
    }

    /// Rewrite `metric_name` for each `(account_id, date)` as the number of
    /// distinct users with a stored event that UTC day. Any earlier row for
    /// the same key is replaced, so the metric stays one row per day no
    /// matter how many ingests touched it. Returns rows written.
    pub fn refresh_active_users(
        &self,
        metric_name: &str,
        days: &[(String, String)],
    ) -> Result<usize, DbError> {
        if days.is_empty() {
            return Ok(0);
        }
        let created_at = now_ts();
        self.with_transaction(|db| {
            for (account_id, date) in days {
                let users: i64 = db.conn.query_row(
                    "SELECT COUNT(DISTINCT user_id) FROM events
                     WHERE account_id = ?1 AND substr(occurred_at, 1, 10) = ?2
                       AND user_id IS NOT NULL",
                    params![account_id, date],
                    |row| row.get(0),
                )?;
                db.conn.execute(
                    "DELETE FROM metric_snapshots
                     WHERE account_id = ?1 AND metric_name = ?2 AND date = ?3",
                    params![account_id, metric_name, date],
                )?;
                db.conn.execute(
                    "INSERT INTO metric_snapshots (account_id, metric_name, value, date, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![account_id, metric_name, users as f64, date, created_at],
                )?;
            }
            Ok(days.len())
        })
    }

    /// Sum a metric over the inclusive date range `[from_date, to_date]`.
    pub fn sum_metric(
        &self,
        account_id: &str,
        metric_name: &str,
        from_date: &str,
        to_date: &str,
    ) -> Result<f64, DbError> {
        Ok(self.conn.query_row(
            "SELECT COALESCE(SUM(value), 0.0) FROM metric_snapshots
             WHERE account_id = ?1 AND metric_name = ?2 AND date >= ?3 AND date <= ?4",
            params![account_id, metric_name, from_date, to_date],
            |row| row.get(0),
        )?)
    }

    /// All snapshot rows for an account on one date, by metric name.
    pub fn get_snapshots_for_date(
        &self,
        account_id: &str,
        date: &str,
    ) -> Result<Vec<DbMetricSnapshot>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT account_id, metric_name, value, date FROM metric_snapshots
             WHERE account_id = ?1 AND date = ?2
             ORDER BY metric_name, id",
        )?;
        let rows = stmt.query_map(params![account_id, date], |row| {
            Ok(DbMetricSnapshot {
                account_id: row.get(0)?,
                metric_name: row.get(1)?,
                value: row.get(2)?,
                date: row.get(3)?,
            })
        })?;
        let mut snaps = Vec::new();
        for row in rows {
            snaps.push(row?);
        }
        Ok(snaps)
    }
}
