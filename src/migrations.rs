//! Schema migration framework.
//!
//! Numbered SQL migrations are embedded at compile time via `include_str!`.
//! Each migration runs exactly once, tracked by the `schema_version` table.

use rusqlite::Connection;

struct Migration {
    version: i32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("migrations/001_baseline.sql"),
}];

/// Create the `schema_version` table if it doesn't exist.
fn ensure_schema_version_table(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("Failed to create schema_version table: {}", e))
}

/// Return the highest applied migration version, or 0 if none.
fn current_version(conn: &Connection) -> Result<i32, String> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(|e| format!("Failed to read schema version: {}", e))
}

/// Back up the database before applying migrations.
///
/// Uses SQLite's online backup API to create a hot copy at
/// `<db_path>.pre-migration.bak`. Skipped for fresh databases (version 0)
/// since there is nothing to protect yet.
fn backup_before_migration(conn: &Connection, current: i32) -> Result<(), String> {
    if current == 0 {
        return Ok(());
    }

    let db_path: String = conn
        .query_row("PRAGMA database_list", [], |row| row.get(2))
        .map_err(|e| format!("Failed to get database path: {}", e))?;

    if db_path.is_empty() || db_path == ":memory:" {
        return Ok(());
    }

    let backup_path = format!("{}.pre-migration.bak", db_path);
    let mut backup_conn = Connection::open(&backup_path)
        .map_err(|e| format!("Failed to open backup file: {}", e))?;

    let backup = rusqlite::backup::Backup::new(conn, &mut backup_conn)
        .map_err(|e| format!("Failed to initialize pre-migration backup: {}", e))?;

    backup
        .step(-1)
        .map_err(|e| format!("Pre-migration backup failed: {}", e))?;

    log::info!("Pre-migration backup created at {}", backup_path);
    Ok(())
}

/// Run all pending migrations.
///
/// Returns the number of migrations applied (0 if already up-to-date).
/// Refuses to touch a database whose version is newer than the newest
/// migration this build knows about.
pub fn run_migrations(conn: &Connection) -> Result<usize, String> {
    ensure_schema_version_table(conn)?;

    let current = current_version(conn)?;
    let max_known = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);

    if current > max_known {
        return Err(format!(
            "Database schema version ({}) is newer than this build supports ({}). \
             Upgrade accountpulse before opening this database.",
            current, max_known
        ));
    }

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        return Ok(0);
    }

    backup_before_migration(conn, current)?;

    for migration in &pending {
        conn.execute_batch(migration.sql)
            .map_err(|e| format!("Migration v{} failed: {}", migration.version, e))?;

        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [migration.version],
        )
        .map_err(|e| format!("Failed to record migration v{}: {}", migration.version, e))?;

        log::info!("Applied migration v{}", migration.version);
    }

    Ok(pending.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_db() -> Connection {
        Connection::open_in_memory().expect("in-memory db")
    }

    #[test]
    fn test_fresh_db_applies_baseline() {
        let conn = mem_db();
        let applied = run_migrations(&conn).expect("migrations should succeed");
        assert_eq!(applied, 1, "should apply exactly 1 migration (baseline)");
        assert_eq!(current_version(&conn).expect("version query"), 1);

        for table in [
            "accounts",
            "users",
            "events",
            "metric_snapshots",
            "signals",
            "detector_runs",
            "heuristic_scores",
            "opportunities",
            "rate_limit_windows",
            "query_cache",
            "sync_states",
        ] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
                .unwrap_or_else(|e| panic!("{} should exist: {}", table, e));
            assert_eq!(count, 0);
        }
    }

    #[test]
    fn test_second_run_is_noop() {
        let conn = mem_db();
        run_migrations(&conn).expect("first run");
        let applied = run_migrations(&conn).expect("second run");
        assert_eq!(applied, 0);
    }

    #[test]
    fn test_score_type_is_constrained() {
        let conn = mem_db();
        run_migrations(&conn).expect("migrations");
        let bad = conn.execute(
            "INSERT INTO heuristic_scores (id, account_id, score_type, value, calculated_at, valid_until)
             VALUES ('s1', 'a1', 'bogus', 50, '2026-01-01', '2026-01-02')",
            [],
        );
        assert!(bad.is_err(), "unknown score_type should be rejected");
    }

    #[test]
    fn test_forward_compat_guard() {
        let conn = mem_db();
        run_migrations(&conn).expect("migrations");
        conn.execute("INSERT INTO schema_version (version) VALUES (99)", [])
            .expect("seed future version");
        let err = run_migrations(&conn).expect_err("newer schema should be refused");
        assert!(err.contains("newer than this build"));
    }

    #[test]
    fn test_versioned_db_is_backed_up_before_upgrade() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("accountpulse.db");
        let conn = Connection::open(&path).expect("file db");
        run_migrations(&conn).expect("baseline");
        conn.execute(
            "INSERT INTO accounts (id, name, created_at, updated_at)
             VALUES ('acme', 'Acme', '2026-01-01', '2026-01-01')",
            [],
        )
        .expect("seed account");

        let backup_path = dir.path().join("accountpulse.db.pre-migration.bak");
        assert!(!backup_path.exists(), "fresh db must not be backed up");

        backup_before_migration(&conn, 1).expect("backup");
        let copy = Connection::open(&backup_path).expect("open backup");
        let name: String = copy
            .query_row("SELECT name FROM accounts WHERE id = 'acme'", [], |row| row.get(0))
            .expect("account in backup");
        assert_eq!(name, "Acme");
        assert_eq!(current_version(&copy).expect("backup version"), 1);
    }
}
