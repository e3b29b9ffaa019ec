//! Signal rows and detector run bookkeeping.

use rusqlite::{params, Row};

use super::*;

const SIGNAL_COLUMNS: &str =
    "id, account_id, signal_type, category, value, details, source, detected_at";

impl AccountDb {
    // =========================================================================
    // Signals
    // =========================================================================

    /// Persist a new signal. Signals are never updated afterwards.
    pub fn insert_signal(&self, signal: &DbSignal) -> Result<(), DbError> {
        let details = serde_json::to_string(&signal.details)?;
        self.conn.execute(
            "INSERT INTO signals (id, account_id, signal_type, category, value, details, source, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                signal.id,
                signal.account_id,
                signal.signal_type,
                signal.category,
                signal.value,
                details,
                signal.source,
                signal.detected_at,
            ],
        )?;
        Ok(())
    }

    /// Whether a signal of this type exists for the account at or after `since`.
    pub fn has_signal_since(
        &self,
        account_id: &str,
        signal_type: &str,
        since: &str,
    ) -> Result<bool, DbError> {
        let found = self
            .conn
            .prepare_cached(
                "SELECT 1 FROM signals
                 WHERE account_id = ?1 AND signal_type = ?2 AND detected_at >= ?3
                 LIMIT 1",
            )?
            .exists(params![account_id, signal_type, since])?;
        Ok(found)
    }

    /// Signals for an account detected at or after `since`, newest first.
    pub fn get_signals_since(&self, account_id: &str, since: &str) -> Result<Vec<DbSignal>, DbError> {
        let sql = format!(
            "SELECT {} FROM signals
             WHERE account_id = ?1 AND detected_at >= ?2
             ORDER BY detected_at DESC, id",
            SIGNAL_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![account_id, since], Self::map_signal_row)?;
        let mut signals = Vec::new();
        for row in rows {
            signals.push(row?);
        }
        Ok(signals)
    }

    /// Most recent signals for an account, newest first.
    pub fn get_recent_signals(&self, account_id: &str, limit: i64) -> Result<Vec<DbSignal>, DbError> {
        let sql = format!(
            "SELECT {} FROM signals
             WHERE account_id = ?1
             ORDER BY detected_at DESC, id
             LIMIT ?2",
            SIGNAL_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![account_id, limit], Self::map_signal_row)?;
        let mut signals = Vec::new();
        for row in rows {
            signals.push(row?);
        }
        Ok(signals)
    }

    fn map_signal_row(row: &Row<'_>) -> rusqlite::Result<DbSignal> {
        let details_json: String = row.get(5)?;
        let details = serde_json::from_str(&details_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(DbSignal {
            id: row.get(0)?,
            account_id: row.get(1)?,
            signal_type: row.get(2)?,
            category: row.get(3)?,
            value: row.get(4)?,
            details,
            source: row.get(6)?,
            detected_at: row.get(7)?,
        })
    }

    // =========================================================================
    // Detector runs
    // =========================================================================

    /// Record the outcome of one detector run.
    pub fn record_detector_run(
        &self,
        detector_name: &str,
        ran_at: &str,
        signal_count: i64,
        error: Option<&str>,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO detector_runs (detector_name, last_run_at, last_signal_count, last_error)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(detector_name) DO UPDATE SET
                 last_run_at = excluded.last_run_at,
                 last_signal_count = excluded.last_signal_count,
                 last_error = excluded.last_error",
            params![detector_name, ran_at, signal_count, error],
        )?;
        Ok(())
    }

    pub fn get_detector_run(&self, detector_name: &str) -> Result<Option<DbDetectorRun>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT detector_name, last_run_at, last_signal_count, last_error
             FROM detector_runs WHERE detector_name = ?1",
        )?;
        let mut rows = stmt.query_map(params![detector_name], |row| {
            Ok(DbDetectorRun {
                detector_name: row.get(0)?,
                last_run_at: row.get(1)?,
                last_signal_count: row.get(2)?,
                last_error: row.get(3)?,
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;

    fn signal(id: &str, signal_type: &str, at: &str) -> DbSignal {
        let mut details = SignalDetails::new();
        details.insert("pct_change".to_string(), serde_json::json!(62.5));
        DbSignal {
            id: id.to_string(),
            account_id: "acme".to_string(),
            signal_type: signal_type.to_string(),
            category: SignalCategory::Expansion,
            value: 62.5,
            details,
            source: "detector".to_string(),
            detected_at: at.to_string(),
        }
    }

    #[test]
    fn test_insert_and_read_back_details() {
        let db = test_db();
        db.insert_signal(&signal("s1", "usage_spike", "2026-03-01T00:00:00.000000Z")).unwrap();
        let rows = db.get_signals_since("acme", "2026-01-01T00:00:00.000000Z").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].category, SignalCategory::Expansion);
        assert_eq!(rows[0].details.get("pct_change"), Some(&serde_json::json!(62.5)));
    }

    #[test]
    fn test_has_signal_since_window() {
        let db = test_db();
        db.insert_signal(&signal("s1", "usage_spike", "2026-03-01T00:00:00.000000Z")).unwrap();
        assert!(db.has_signal_since("acme", "usage_spike", "2026-02-25T00:00:00.000000Z").unwrap());
        assert!(!db.has_signal_since("acme", "usage_spike", "2026-03-02T00:00:00.000000Z").unwrap());
        assert!(!db.has_signal_since("acme", "usage_drop", "2026-02-01T00:00:00.000000Z").unwrap());
    }

    #[test]
    fn test_recent_signals_newest_first() {
        let db = test_db();
        db.insert_signal(&signal("s1", "usage_spike", "2026-03-01T00:00:00.000000Z")).unwrap();
        db.insert_signal(&signal("s2", "team_growth", "2026-03-03T00:00:00.000000Z")).unwrap();
        let rows = db.get_recent_signals("acme", 1).unwrap();
        assert_eq!(rows[0].id, "s2");
    }

    #[test]
    fn test_detector_run_upsert() {
        let db = test_db();
        db.record_detector_run("usage_spike", "2026-03-01T00:00:00.000000Z", 2, None).unwrap();
        db.record_detector_run("usage_spike", "2026-03-02T00:00:00.000000Z", 0, Some("boom")).unwrap();
        let run = db.get_detector_run("usage_spike").unwrap().unwrap();
        assert_eq!(run.last_signal_count, 0);
        assert_eq!(run.last_error.as_deref(), Some("boom"));
    }
}
