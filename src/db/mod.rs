//! SQLite working store for accounts, activity, signals, scores, and
//! integration state.
//!
//! The database lives at `~/.accountpulse/accountpulse.db` by default. Every
//! logical operation (a detector's signal write, a score write, a rate-limit
//! increment) commits on its own; nothing assumes cross-entity transactions
//! beyond what `with_transaction` scopes explicitly.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

pub mod accounts;
pub mod events;
pub mod integrations;
pub mod scores;
pub mod signals;
pub mod types;
pub use types::*;

/// Database handle shared between async sync workers.
///
/// `parking_lot::Mutex` does not poison, so a panicking worker can't wedge
/// every other writer.
pub type SharedDb = Arc<Mutex<AccountDb>>;

pub struct AccountDb {
    conn: Connection,
}

impl AccountDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Wrap this handle for sharing across tasks.
    pub fn into_shared(self) -> SharedDb {
        Arc::new(Mutex::new(self))
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    ///
    /// `BEGIN IMMEDIATE` takes the write lock up front, so a read-then-write
    /// inside the closure can't interleave with another connection's write.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Self) -> Result<T, DbError>,
    {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(val) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the database at the default location and apply the schema.
    pub fn open() -> Result<Self, DbError> {
        let path = Self::db_path()?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // WAL keeps readers unblocked while the sync pipeline writes
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self { conn })
    }

    /// Resolve the default database path: `~/.accountpulse/accountpulse.db`.
    pub fn db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".accountpulse").join("accountpulse.db"))
    }
}

// =============================================================================
// Shared test utilities
// =============================================================================


// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_open_creates_tables() {
        let db = test_db();
        let count: i32 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))
            .expect("accounts table should exist");
        assert_eq!(count, 0);
    }

    #[test]
    fn test_with_transaction_rolls_back_on_err() {
        let db = test_db();
        let result: Result<(), DbError> = db.with_transaction(|tx| {
            tx.conn_ref().execute(
                "INSERT INTO detector_runs (detector_name, last_run_at) VALUES ('d1', '2026-01-01')",
                [],
            )?;
            Err(DbError::AccountNotFound("forced".into()))
        });
        assert!(result.is_err());
        let count: i32 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM detector_runs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0, "insert should have been rolled back");
    }

    #[test]
    fn test_with_transaction_commits_on_ok() {
        let db = test_db();
        db.with_transaction(|tx| {
            tx.conn_ref().execute(
                "INSERT INTO detector_runs (detector_name, last_run_at) VALUES ('d1', '2026-01-01')",
                [],
            )?;
            Ok(())
        })
        .expect("commit");
        let count: i32 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM detector_runs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
