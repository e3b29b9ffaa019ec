use rusqlite::{params, OptionalExtension, Row};

use super::*;

const SCORE_COLUMNS: &str =
    "id, account_id, score_type, value, component_scores, fit_multiplier, calculated_at, valid_until";

impl AccountDb {
    // =========================================================================
    // Heuristic scores
    // =========================================================================

    /// Append a score row. Later runs supersede earlier rows by `calculated_at`.
    pub fn insert_heuristic_score(&self, score: &DbHeuristicScore) -> Result<(), DbError> {
        let components = serde_json::to_string(&score.component_scores)?;
        self.conn.execute(
            "INSERT INTO heuristic_scores
                (id, account_id, score_type, value, component_scores, fit_multiplier, calculated_at, valid_until)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                score.id,
                score.account_id,
                score.score_type,
                score.value,
                components,
                score.fit_multiplier,
                score.calculated_at,
                score.valid_until,
            ],
        )?;
        Ok(())
    }

    /// The newest score of a type for an account.
    pub fn get_latest_score(
        &self,
        account_id: &str,
        score_type: ScoreType,
    ) -> Result<Option<DbHeuristicScore>, DbError> {
        let sql = format!(
            "SELECT {} FROM heuristic_scores
             WHERE account_id = ?1 AND score_type = ?2
             ORDER BY calculated_at DESC, rowid DESC
             LIMIT 1",
            SCORE_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![account_id, score_type], Self::map_score_row)
            .optional()?)
    }

    /// Score history for an account, newest first.
    pub fn get_score_history(
        &self,
        account_id: &str,
        score_type: ScoreType,
        limit: i64,
    ) -> Result<Vec<DbHeuristicScore>, DbError> {
        let sql = format!(
            "SELECT {} FROM heuristic_scores
             WHERE account_id = ?1 AND score_type = ?2
             ORDER BY calculated_at DESC, rowid DESC
             LIMIT ?3",
            SCORE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![account_id, score_type, limit], Self::map_score_row)?;
        let mut scores = Vec::new();
        for row in rows {
            scores.push(row?);
        }
        Ok(scores)
    }

    fn map_score_row(row: &Row<'_>) -> rusqlite::Result<DbHeuristicScore> {
        let components_json: String = row.get(4)?;
        let component_scores = serde_json::from_str(&components_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(DbHeuristicScore {
            id: row.get(0)?,
            account_id: row.get(1)?,
            score_type: row.get(2)?,
            value: row.get(3)?,
            component_scores,
            fit_multiplier: row.get(5)?,
            calculated_at: row.get(6)?,
            valid_until: row.get(7)?,
        })
    }

    // =========================================================================
    // Opportunities
    // =========================================================================

    pub fn insert_opportunity(&self, opp: &DbOpportunity) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO opportunities (id, account_id, opportunity_type, stage, value, score, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                opp.id,
                opp.account_id,
                opp.opportunity_type,
                opp.stage,
                opp.value,
                opp.score,
                opp.created_at,
            ],
        )?;
        Ok(())
    }

    /// Whether any opportunity exists for the account at or after `since`.
    pub fn has_opportunity_since(&self, account_id: &str, since: &str) -> Result<bool, DbError> {
        let found = self
            .conn
            .prepare_cached(
                "SELECT 1 FROM opportunities WHERE account_id = ?1 AND created_at >= ?2 LIMIT 1",
            )?
            .exists(params![account_id, since])?;
        Ok(found)
    }

    pub fn get_opportunities_for_account(&self, account_id: &str) -> Result<Vec<DbOpportunity>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, account_id, opportunity_type, stage, value, score, created_at
             FROM opportunities WHERE account_id = ?1
             ORDER BY created_at DESC, id",
        )?;
        let rows = stmt.query_map(params![account_id], |row| {
            Ok(DbOpportunity {
                id: row.get(0)?,
                account_id: row.get(1)?,
                opportunity_type: row.get(2)?,
                stage: row.get(3)?,
                value: row.get(4)?,
                score: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;
        let mut opps = Vec::new();
        for row in rows {
            opps.push(row?);
        }
        Ok(opps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;

    fn score(id: &str, value: f64, at: &str) -> DbHeuristicScore {
        let mut components = ComponentScores::new();
        components.insert("usage_spike".to_string(), 12.0);
        DbHeuristicScore {
            id: id.to_string(),
            account_id: "acme".to_string(),
            score_type: ScoreType::Health,
            value,
            component_scores: components,
            fit_multiplier: 1.0,
            calculated_at: at.to_string(),
            valid_until: at.to_string(),
        }
    }

    #[test]
    fn test_latest_score_wins_by_time() {
        let db = test_db();
        db.insert_heuristic_score(&score("h1", 40.0, "2026-03-01T00:00:00.000000Z")).unwrap();
        db.insert_heuristic_score(&score("h2", 55.0, "2026-03-02T00:00:00.000000Z")).unwrap();

        let latest = db.get_latest_score("acme", ScoreType::Health).unwrap().unwrap();
        assert_eq!(latest.id, "h2");
        assert_eq!(latest.component_scores.get("usage_spike"), Some(&12.0));
        assert!(db.get_latest_score("acme", ScoreType::Expansion).unwrap().is_none());
        assert_eq!(db.get_score_history("acme", ScoreType::Health, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_opportunity_since() {
        let db = test_db();
        db.insert_opportunity(&DbOpportunity {
            id: "o1".to_string(),
            account_id: "acme".to_string(),
            opportunity_type: ScoreType::Expansion,
            stage: "identified".to_string(),
            value: 20_000.0,
            score: 80.0,
            created_at: "2026-03-01T00:00:00.000000Z".to_string(),
        })
        .unwrap();
        assert!(db.has_opportunity_since("acme", "2026-02-01T00:00:00.000000Z").unwrap());
        assert!(!db.has_opportunity_since("acme", "2026-03-05T00:00:00.000000Z").unwrap());
        assert_eq!(
            db.get_opportunities_for_account("acme").unwrap()[0].opportunity_type,
            ScoreType::Expansion
        );
    }
}
