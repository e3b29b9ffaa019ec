//! Persisted run state per integration: `idle -> in_progress -> {success | partial | failed}`.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::writer::{BatchResult, BatchStatus};
use crate::db::{DbError, DbSyncState, SharedDb, SyncStatus};
use crate::util::ts;

#[derive(Clone)]
pub struct SyncStateTracker {
    db: SharedDb,
    integration: String,
}

impl SyncStateTracker {
    pub fn new(db: SharedDb, integration: &str) -> Self {
        Self {
            db,
            integration: integration.to_string(),
        }
    }

    pub fn integration(&self) -> &str {
        &self.integration
    }

    /// Current state; an integration that never synced reads as idle.
    pub fn get(&self) -> Result<DbSyncState, DbError> {
        Ok(self
            .db
            .lock()
            .get_sync_state(&self.integration)?
            .unwrap_or_else(|| self.idle_state(ts(Utc::now()))))
    }

    /// Reset counters and mark the run started. The resumption cursor is
    /// kept so an interrupted run can pick up where it stopped.
    pub fn start_sync(&self) -> Result<DbSyncState, DbError> {
        self.start_sync_at(Utc::now())
    }

    pub fn start_sync_at(&self, now: DateTime<Utc>) -> Result<DbSyncState, DbError> {
        self.mutate(now, |state| {
            state.status = SyncStatus::InProgress;
            state.records_processed = 0;
            state.records_succeeded = 0;
            state.records_failed = 0;
            state.error_summary = None;
            state.last_sync_started_at = Some(ts(now));
        })
    }

    /// Record mid-run counters. `cursor` replaces the stored cursor when given.
    pub fn update_progress(
        &self,
        processed: i64,
        succeeded: i64,
        failed: i64,
        cursor: Option<Value>,
    ) -> Result<DbSyncState, DbError> {
        self.update_progress_at(processed, succeeded, failed, cursor, Utc::now())
    }

    pub fn update_progress_at(
        &self,
        processed: i64,
        succeeded: i64,
        failed: i64,
        cursor: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<DbSyncState, DbError> {
        self.mutate(now, |state| {
            state.records_processed = processed;
            state.records_succeeded = succeeded;
            state.records_failed = failed;
            if cursor.is_some() {
                state.cursor_data = cursor;
            }
        })
    }

    /// Close the run with the writer's final result.
    pub fn complete_sync(&self, result: &BatchResult) -> Result<DbSyncState, DbError> {
        self.complete_sync_at(result, Utc::now())
    }

    pub fn complete_sync_at(
        &self,
        result: &BatchResult,
        now: DateTime<Utc>,
    ) -> Result<DbSyncState, DbError> {
        let status = result.status();
        let state = self.mutate(now, |state| {
            state.status = match status {
                BatchStatus::Success => SyncStatus::Success,
                BatchStatus::Partial => SyncStatus::Partial,
                BatchStatus::Failed => SyncStatus::Failed,
            };
            state.records_processed = result.total as i64;
            state.records_succeeded = result.succeeded as i64;
            state.records_failed = result.failed as i64;
            state.error_summary = error_summary(result);
            state.cursor_data = None;
            state.last_sync_completed_at = Some(ts(now));
            if status == BatchStatus::Success {
                state.last_successful_sync_at = Some(ts(now));
            }
        })?;
        log::info!(
            "Sync {} finished: {} ({}/{} succeeded)",
            self.integration,
            state.status,
            state.records_succeeded,
            state.records_processed
        );
        Ok(state)
    }

    /// Mark the run failed outright. Counters and cursor are left as they
    /// were so the next run can resume.
    pub fn fail_sync(&self, message: &str) -> Result<DbSyncState, DbError> {
        self.fail_sync_at(message, Utc::now())
    }

    pub fn fail_sync_at(&self, message: &str, now: DateTime<Utc>) -> Result<DbSyncState, DbError> {
        log::error!("Sync {} failed: {}", self.integration, message);
        self.mutate(now, |state| {
            state.status = SyncStatus::Failed;
            state.error_summary = Some(message.to_string());
            state.last_sync_completed_at = Some(ts(now));
        })
    }

    fn mutate<F>(&self, now: DateTime<Utc>, f: F) -> Result<DbSyncState, DbError>
    where
        F: FnOnce(&mut DbSyncState),
    {
        let db = self.db.lock();
        db.with_transaction(|tx| {
            let mut state = tx
                .get_sync_state(&self.integration)?
                .unwrap_or_else(|| self.idle_state(ts(now)));
            f(&mut state);
            state.updated_at = ts(now);
            tx.upsert_sync_state(&state)?;
            Ok(state)
        })
    }

    fn idle_state(&self, updated_at: String) -> DbSyncState {
        DbSyncState {
            integration_name: self.integration.clone(),
            status: SyncStatus::Idle,
            records_processed: 0,
            records_succeeded: 0,
            records_failed: 0,
            cursor_data: None,
            error_summary: None,
            last_sync_started_at: None,
            last_sync_completed_at: None,
            last_successful_sync_at: None,
            updated_at,
        }
    }
}

/// `"auth: 1, validation: 3"`, or `None` when nothing failed.
fn error_summary(result: &BatchResult) -> Option<String> {
    if result.error_counts.is_empty() {
        return None;
    }
    Some(
        result
            .error_counts
            .iter()
            .map(|(category, count)| format!("{}: {}", category, count))
            .collect::<Vec<_>>()
            .join(", "),
    )
}
