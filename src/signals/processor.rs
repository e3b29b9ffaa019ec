//! Signal processor: raw events in, metric snapshots and signals out.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::detector::DetectorRegistry;
use super::detectors::default_registry;
use crate::db::{AccountDb, DbError, DbEvent, DbMetricSnapshot, DbSignal};
use crate::presets::HeuristicsConfig;
use crate::util::{parse_ts, ts};

/// Snapshot rows written per transaction.
pub const SNAPSHOT_BATCH_SIZE: usize = 500;

/// Aggregate metric names written alongside the per-event-type counts.
pub const METRIC_TOTAL_EVENTS: &str = "total_events";
pub const METRIC_ACTIVE_USERS: &str = "active_users";

/// An inbound product or billing event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    #[serde(default)]
    pub id: Option<String>,
    pub account_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub event_type: String,
    pub occurred_at: String,
    #[serde(default)]
    pub properties: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    pub events_stored: usize,
    pub events_skipped: usize,
    pub snapshots_written: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingSummary {
    pub accounts_processed: usize,
    pub accounts_failed: usize,
    pub signals_detected: usize,
    pub detector_failures: usize,
}

/// Signals from one account plus the number of detectors that errored.
struct AccountRun {
    signals: Vec<DbSignal>,
    detector_failures: usize,
}

pub struct SignalProcessor {
    registry: DetectorRegistry,
}

impl SignalProcessor {
    /// Build a processor with every enabled detector from `config`.
    pub fn new(config: &HeuristicsConfig) -> Self {
        Self {
            registry: default_registry(config),
        }
    }

    pub fn with_registry(registry: DetectorRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &DetectorRegistry {
        &self.registry
    }

    /// Group events by account and UTC day into snapshot rows.
    ///
    /// Per group: one row per event type (count), `total_events`, and
    /// `active_users` (distinct non-null user ids). Unparseable timestamps
    /// are skipped.
    pub fn build_snapshots(events: &[RawEvent]) -> Vec<DbMetricSnapshot> {
        #[derive(Default)]
        struct DayBucket {
            by_type: BTreeMap<String, u64>,
            users: BTreeSet<String>,
            total: u64,
        }

        let mut buckets: BTreeMap<(String, String), DayBucket> = BTreeMap::new();
        for event in events {
            let Some(at) = parse_ts(&event.occurred_at) else {
                continue;
            };
            let key = (event.account_id.clone(), at.date_naive().to_string());
            let bucket = buckets.entry(key).or_default();
            *bucket.by_type.entry(event.event_type.clone()).or_insert(0) += 1;
            bucket.total += 1;
            if let Some(user) = &event.user_id {
                bucket.users.insert(user.clone());
            }
        }

        let mut snapshots = Vec::new();
        for ((account_id, date), bucket) in buckets {
            for (event_type, count) in bucket.by_type {
                snapshots.push(DbMetricSnapshot {
                    account_id: account_id.clone(),
                    metric_name: event_type,
                    value: count as f64,
                    date: date.clone(),
                });
            }
            snapshots.push(DbMetricSnapshot {
                account_id: account_id.clone(),
                metric_name: METRIC_TOTAL_EVENTS.to_string(),
                value: bucket.total as f64,
                date: date.clone(),
            });
            snapshots.push(DbMetricSnapshot {
                account_id,
                metric_name: METRIC_ACTIVE_USERS.to_string(),
                value: bucket.users.len() as f64,
                date,
            });
        }
        snapshots
    }

    /// Store raw events, advance activity timestamps, and write snapshots.
    ///
    /// Replayed events (same id) are stored once and do not count twice in
    /// snapshots.
    pub fn ingest_events(&self, db: &AccountDb, events: &[RawEvent]) -> Result<IngestSummary, DbError> {
        let mut summary = IngestSummary::default();

        let stored: Vec<RawEvent> = db.with_transaction(|tx| {
            let mut stored = Vec::new();
            for event in events {
                let Some(at) = parse_ts(&event.occurred_at) else {
                    log::warn!(
                        "Skipping event for {} with bad timestamp {:?}",
                        event.account_id,
                        event.occurred_at
                    );
                    continue;
                };
                let row = DbEvent {
                    id: event
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("evt-{}", Uuid::new_v4())),
                    account_id: event.account_id.clone(),
                    user_id: event.user_id.clone(),
                    event_type: event.event_type.clone(),
                    occurred_at: ts(at),
                    properties: event.properties.as_ref().map(|p| p.to_string()),
                };
                if tx.insert_event(&row)? {
                    let mut kept = event.clone();
                    kept.occurred_at = row.occurred_at;
                    stored.push(kept);
                }
            }
            Ok(stored)
        })?;
        summary.events_stored = stored.len();
        summary.events_skipped = events.len() - stored.len();

        let mut newest_account: HashMap<&str, &str> = HashMap::new();
        let mut newest_user: HashMap<&str, &str> = HashMap::new();
        for event in &stored {
            let at = event.occurred_at.as_str();
            let slot = newest_account.entry(event.account_id.as_str()).or_insert(at);
            if at > *slot {
                *slot = at;
            }
            if let Some(user) = event.user_id.as_deref() {
                let slot = newest_user.entry(user).or_insert(at);
                if at > *slot {
                    *slot = at;
                }
            }
        }
        for (account_id, at) in newest_account {
            db.touch_account_activity(account_id, at)?;
        }
        for (user_id, at) in newest_user {
            db.touch_user_last_seen(user_id, at)?;
        }

        // Counts add up across ingests; distinct users do not, so that row
        // is recomputed from the stored events instead of appended.
        let (active_users, counts): (Vec<_>, Vec<_>) = Self::build_snapshots(&stored)
            .into_iter()
            .partition(|s| s.metric_name == METRIC_ACTIVE_USERS);
        for chunk in counts.chunks(SNAPSHOT_BATCH_SIZE) {
            summary.snapshots_written += db.insert_metric_snapshots(chunk)?;
        }
        let days: Vec<(String, String)> = active_users
            .into_iter()
            .map(|s| (s.account_id, s.date))
            .collect();
        for chunk in days.chunks(SNAPSHOT_BATCH_SIZE) {
            summary.snapshots_written += db.refresh_active_users(METRIC_ACTIVE_USERS, chunk)?;
        }

        log::info!(
            "Ingested {} events ({} skipped), {} snapshot rows",
            summary.events_stored,
            summary.events_skipped,
            summary.snapshots_written
        );
        Ok(summary)
    }

    /// Run every registered detector for one account.
    pub fn process_account(&self, db: &AccountDb, account_id: &str) -> Result<Vec<DbSignal>, DbError> {
        self.process_account_at(db, account_id, Utc::now())
    }

    pub fn process_account_at(
        &self,
        db: &AccountDb,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<DbSignal>, DbError> {
        Ok(self.run_detectors(db, account_id, now)?.signals)
    }

    /// Detector failures are logged and recorded, never propagated.
    fn run_detectors(&self, db: &AccountDb, account_id: &str, now: DateTime<Utc>) -> Result<AccountRun, DbError> {
        db.require_account(account_id)?;

        let ran_at = ts(now);
        let mut run = AccountRun {
            signals: Vec::new(),
            detector_failures: 0,
        };

        for detector in self.registry.iter() {
            let name = detector.signal_type();
            let (count, error) = match detector.detect_at(db, account_id, now) {
                Ok(Some(signal)) => {
                    log::debug!("{} fired for {} (value {:.2})", name, account_id, signal.value);
                    run.signals.push(signal);
                    (1, None)
                }
                Ok(None) => (0, None),
                Err(e) => {
                    log::warn!("Detector {} failed for account {}: {}", name, account_id, e);
                    run.detector_failures += 1;
                    (0, Some(e.to_string()))
                }
            };
            if let Err(e) = db.record_detector_run(name, &ran_at, count, error.as_deref()) {
                log::warn!("Failed to record run state for {}: {}", name, e);
            }
        }

        Ok(run)
    }

    /// Run detectors for every account. One account failing does not stop the rest.
    pub fn process_all_accounts(&self, db: &AccountDb) -> Result<ProcessingSummary, DbError> {
        self.process_all_accounts_at(db, Utc::now())
    }

    pub fn process_all_accounts_at(&self, db: &AccountDb, now: DateTime<Utc>) -> Result<ProcessingSummary, DbError> {
        let mut summary = ProcessingSummary::default();
        for account_id in db.list_account_ids()? {
            match self.run_detectors(db, &account_id, now) {
                Ok(run) => {
                    summary.accounts_processed += 1;
                    summary.signals_detected += run.signals.len();
                    summary.detector_failures += run.detector_failures;
                }
                Err(e) => {
                    log::warn!("Signal processing failed for account {}: {}", account_id, e);
                    summary.accounts_failed += 1;
                }
            }
        }
        log::info!(
            "Processed {} accounts ({} failed): {} signals, {} detector failures",
            summary.accounts_processed,
            summary.accounts_failed,
            summary.signals_detected,
            summary.detector_failures
        );
        Ok(summary)
    }
}
