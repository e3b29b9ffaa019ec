use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::*;
use crate::util::ts;

const ACCOUNT_COLUMNS: &str = "id, name, domain, plan, status, industry, region, employee_count,
     arr, seats_purchased, trial_ends_at, renewal_date, health_score, fit_score,
     last_activity_at, created_at, updated_at";

const USER_COLUMNS: &str =
    "id, account_id, email, name, title, status, last_seen_at, created_at, deactivated_at";

impl AccountDb {
    // =========================================================================
    // Accounts
    // =========================================================================

    /// Insert or update an account.
    ///
    /// Scores are left alone on update; they belong to the fit scorer and the
    /// heuristics engine.
    pub fn upsert_account(&self, account: &DbAccount) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO accounts (
                id, name, domain, plan, status, industry, region, employee_count,
                arr, seats_purchased, trial_ends_at, renewal_date, health_score, fit_score,
                last_activity_at, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                domain = excluded.domain,
                plan = excluded.plan,
                status = excluded.status,
                industry = excluded.industry,
                region = excluded.region,
                employee_count = excluded.employee_count,
                arr = excluded.arr,
                seats_purchased = excluded.seats_purchased,
                trial_ends_at = excluded.trial_ends_at,
                renewal_date = excluded.renewal_date,
                last_activity_at = COALESCE(excluded.last_activity_at, accounts.last_activity_at),
                updated_at = excluded.updated_at",
            params![
                account.id,
                account.name,
                account.domain,
                account.plan,
                account.status,
                account.industry,
                account.region,
                account.employee_count,
                account.arr,
                account.seats_purchased,
                account.trial_ends_at,
                account.renewal_date,
                account.health_score,
                account.fit_score,
                account.last_activity_at,
                account.created_at,
                account.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Get an account by ID.
    pub fn get_account(&self, id: &str) -> Result<Option<DbAccount>, DbError> {
        let sql = format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![id], Self::map_account_row)
            .optional()?)
    }

    /// Get an account by ID, failing if it doesn't exist.
    pub fn require_account(&self, id: &str) -> Result<DbAccount, DbError> {
        self.get_account(id)?
            .ok_or_else(|| DbError::AccountNotFound(id.to_string()))
    }

    /// Look up an account by its (case-insensitive) web domain.
    pub fn find_account_by_domain(&self, domain: &str) -> Result<Option<DbAccount>, DbError> {
        let sql = format!(
            "SELECT {} FROM accounts WHERE LOWER(domain) = LOWER(?1) LIMIT 1",
            ACCOUNT_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![domain.trim()], Self::map_account_row)
            .optional()?)
    }

    /// IDs of every account, oldest first.
    pub fn list_account_ids(&self) -> Result<Vec<String>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM accounts ORDER BY created_at, id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Write the denormalized health score back onto the account.
    pub fn update_account_health_score(
        &self,
        account_id: &str,
        score: f64,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let rows = self.conn.execute(
            "UPDATE accounts SET health_score = ?1, updated_at = ?2 WHERE id = ?3",
            params![score, ts(now), account_id],
        )?;
        if rows == 0 {
            return Err(DbError::AccountNotFound(account_id.to_string()));
        }
        Ok(())
    }

    /// Persist a freshly computed ICP fit score.
    pub fn update_account_fit_score(
        &self,
        account_id: &str,
        score: f64,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let rows = self.conn.execute(
            "UPDATE accounts SET fit_score = ?1, updated_at = ?2 WHERE id = ?3",
            params![score, ts(now), account_id],
        )?;
        if rows == 0 {
            return Err(DbError::AccountNotFound(account_id.to_string()));
        }
        Ok(())
    }

    /// Advance `last_activity_at`. Older timestamps never move it backwards.
    pub fn touch_account_activity(&self, account_id: &str, at: &str) -> Result<bool, DbError> {
        let rows = self.conn.execute(
            "UPDATE accounts SET last_activity_at = ?1
             WHERE id = ?2 AND (last_activity_at IS NULL OR last_activity_at < ?1)",
            params![at, account_id],
        )?;
        Ok(rows > 0)
    }

    fn map_account_row(row: &Row<'_>) -> rusqlite::Result<DbAccount> {
        Ok(DbAccount {
            id: row.get(0)?,
            name: row.get(1)?,
            domain: row.get(2)?,
            plan: row.get(3)?,
            status: row.get(4)?,
            industry: row.get(5)?,
            region: row.get(6)?,
            employee_count: row.get(7)?,
            arr: row.get(8)?,
            seats_purchased: row.get(9)?,
            trial_ends_at: row.get(10)?,
            renewal_date: row.get(11)?,
            health_score: row.get(12)?,
            fit_score: row.get(13)?,
            last_activity_at: row.get(14)?,
            created_at: row.get(15)?,
            updated_at: row.get(16)?,
        })
    }

    // =========================================================================
    // Users
    // =========================================================================

    /// Insert or update a user.
    pub fn upsert_user(&self, user: &DbUser) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO users (id, account_id, email, name, title, status, last_seen_at,
                                created_at, deactivated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                account_id = excluded.account_id,
                email = excluded.email,
                name = excluded.name,
                title = excluded.title,
                status = excluded.status,
                last_seen_at = COALESCE(excluded.last_seen_at, users.last_seen_at),
                deactivated_at = excluded.deactivated_at",
            params![
                user.id,
                user.account_id,
                user.email,
                user.name,
                user.title,
                user.status,
                user.last_seen_at,
                user.created_at,
                user.deactivated_at,
            ],
        )?;
        Ok(())
    }

    /// All users on an account, active and deactivated.
    pub fn get_users_for_account(&self, account_id: &str) -> Result<Vec<DbUser>, DbError> {
        let sql = format!(
            "SELECT {} FROM users WHERE account_id = ?1 ORDER BY created_at, id",
            USER_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![account_id], Self::map_user_row)?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    /// Advance a user's `last_seen_at`. Never moves it backwards.
    pub fn touch_user_last_seen(&self, user_id: &str, at: &str) -> Result<bool, DbError> {
        let rows = self.conn.execute(
            "UPDATE users SET last_seen_at = ?1
             WHERE id = ?2 AND (last_seen_at IS NULL OR last_seen_at < ?1)",
            params![at, user_id],
        )?;
        Ok(rows > 0)
    }

    /// Active users seen on or after `since`.
    pub fn count_active_users_since(&self, account_id: &str, since: &str) -> Result<i64, DbError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM users
             WHERE account_id = ?1 AND status = 'active' AND last_seen_at >= ?2",
            params![account_id, since],
            |row| row.get(0),
        )?)
    }

    /// Users created in `[from, to)`.
    pub fn count_users_created_between(
        &self,
        account_id: &str,
        from: &str,
        to: &str,
    ) -> Result<i64, DbError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM users
             WHERE account_id = ?1 AND created_at >= ?2 AND created_at < ?3",
            params![account_id, from, to],
            |row| row.get(0),
        )?)
    }

    fn map_user_row(row: &Row<'_>) -> rusqlite::Result<DbUser> {
        Ok(DbUser {
            id: row.get(0)?,
            account_id: row.get(1)?,
            email: row.get(2)?,
            name: row.get(3)?,
            title: row.get(4)?,
            status: row.get(5)?,
            last_seen_at: row.get(6)?,
            created_at: row.get(7)?,
            deactivated_at: row.get(8)?,
        })
    }
}
