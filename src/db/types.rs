use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Account not found: {0}")]
    AccountNotFound(String),
}

/// A stored text value that doesn't name a known enum variant.
#[derive(Debug, Clone, Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Text-backed enum stored as a plain string column.
macro_rules! text_enum {
    ($name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: UnknownVariant| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

/// Which score family a signal feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalCategory {
    Expansion,
    ChurnRisk,
    Health,
}

text_enum!(SignalCategory, "signal category" {
    Expansion => "expansion",
    ChurnRisk => "churn_risk",
    Health => "health",
});

/// The three scores computed per account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreType {
    Health,
    Expansion,
    ChurnRisk,
}

text_enum!(ScoreType, "score type" {
    Health => "health",
    Expansion => "expansion",
    ChurnRisk => "churn_risk",
});

impl ScoreType {
    pub const ALL: [ScoreType; 3] = [ScoreType::Health, ScoreType::Expansion, ScoreType::ChurnRisk];

    /// Category filter applied when aggregating. `None` means every signal counts.
    pub fn category_filter(&self) -> Option<SignalCategory> {
        match self {
            ScoreType::Health => None,
            ScoreType::Expansion => Some(SignalCategory::Expansion),
            ScoreType::ChurnRisk => Some(SignalCategory::ChurnRisk),
        }
    }
}

/// Lifecycle of an integration's most recent sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    InProgress,
    Success,
    Partial,
    Failed,
}

text_enum!(SyncStatus, "sync status" {
    Idle => "idle",
    InProgress => "in_progress",
    Success => "success",
    Partial => "partial",
    Failed => "failed",
});

/// Structured payload attached to a signal.
pub type SignalDetails = BTreeMap<String, serde_json::Value>;

/// Per-signal-type contribution to a score.
pub type ComponentScores = BTreeMap<String, f64>;

/// A row from the `accounts` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbAccount {
    pub id: String,
    pub name: String,
    pub domain: Option<String>,
    pub plan: String,
    pub status: String,
    pub industry: Option<String>,
    pub region: Option<String>,
    pub employee_count: Option<i64>,
    pub arr: Option<f64>,
    pub seats_purchased: Option<i64>,
    pub trial_ends_at: Option<String>,
    pub renewal_date: Option<String>,
    pub health_score: Option<f64>,
    pub fit_score: Option<f64>,
    pub last_activity_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A row from the `users` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbUser {
    pub id: String,
    pub account_id: String,
    pub email: String,
    pub name: Option<String>,
    pub title: Option<String>,
    pub status: String,
    pub last_seen_at: Option<String>,
    pub created_at: String,
    pub deactivated_at: Option<String>,
}

/// A raw product or billing event as stored in `events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbEvent {
    pub id: String,
    pub account_id: String,
    pub user_id: Option<String>,
    pub event_type: String,
    pub occurred_at: String,
    pub properties: Option<String>,
}

/// A daily aggregated metric row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbMetricSnapshot {
    pub account_id: String,
    pub metric_name: String,
    pub value: f64,
    pub date: String,
}

/// A row from the `signals` table. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbSignal {
    pub id: String,
    pub account_id: String,
    pub signal_type: String,
    pub category: SignalCategory,
    pub value: f64,
    pub details: SignalDetails,
    pub source: String,
    pub detected_at: String,
}

/// Observability record for the last run of one detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbDetectorRun {
    pub detector_name: String,
    pub last_run_at: String,
    pub last_signal_count: i64,
    pub last_error: Option<String>,
}

/// A row from the `heuristic_scores` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbHeuristicScore {
    pub id: String,
    pub account_id: String,
    pub score_type: ScoreType,
    pub value: f64,
    pub component_scores: ComponentScores,
    pub fit_multiplier: f64,
    pub calculated_at: String,
    pub valid_until: String,
}

/// A row from the `opportunities` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbOpportunity {
    pub id: String,
    pub account_id: String,
    pub opportunity_type: ScoreType,
    pub stage: String,
    pub value: f64,
    pub score: f64,
    pub created_at: String,
}

/// A cached analytics result from `query_cache`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbCacheEntry {
    pub cache_key: String,
    pub integration_name: String,
    pub result: String,
    pub created_at: String,
    pub expires_at: Option<String>,
    pub hit_count: i64,
    pub last_accessed_at: Option<String>,
}

/// A row from the `sync_states` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbSyncState {
    pub integration_name: String,
    pub status: SyncStatus,
    pub records_processed: i64,
    pub records_succeeded: i64,
    pub records_failed: i64,
    pub cursor_data: Option<serde_json::Value>,
    pub error_summary: Option<String>,
    pub last_sync_started_at: Option<String>,
    pub last_sync_completed_at: Option<String>,
    pub last_successful_sync_at: Option<String>,
    pub updated_at: String,
}
