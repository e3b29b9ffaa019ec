//! End-to-end analytics -> CRM sync run.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::cache::QueryCache;
use super::client::{AnalyticsClient, AnalyticsQuery, AttributeSpec, CrmClient};
use super::rate_limiter::RateLimiter;
use super::state::SyncStateTracker;
use super::writer::{BatchProgress, BatchResult, BatchStatus, BatchSyncWriter, SyncRecord, WriterSettings};
use super::{IntegrationContext, SyncConfig, ANALYTICS_INTEGRATION, CRM_INTEGRATION};
use crate::db::{AccountDb, DbAccount, DbError, DbSignal, SharedDb, SignalCategory, SyncStatus};
use crate::error::SyncError;
use crate::scoring::composite::{CompositeScorer, CompositeSignal, ExternalSignal};
use crate::util::ts;

/// Cursor key holding the record keys the CRM has already accepted.
pub const CURSOR_WRITTEN_KEYS: &str = "writtenKeys";

/// A persisted analytics signal is skipped if the same type landed this recently.
const ANALYTICS_SIGNAL_DEDUP_HOURS: i64 = 24;

/// Attributes every synced CRM record carries.
pub fn required_attributes() -> Vec<AttributeSpec> {
    vec![
        AttributeSpec::new("signal_score", "Signal Score", "number"),
        AttributeSpec::new("signal_types", "Signal Types", "text"),
        AttributeSpec::new("last_signal_at", "Last Signal At", "timestamp"),
    ]
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunReport {
    pub queries_run: usize,
    pub queries_failed: usize,
    pub rows_skipped: usize,
    pub accounts_scored: usize,
    pub accounts_routed: usize,
    pub signals_persisted: usize,
    /// Routed records skipped because an interrupted run already wrote them.
    pub resumed_skipped: usize,
    pub status: BatchStatus,
    pub result: BatchResult,
}

pub struct SyncPipeline {
    db: SharedDb,
    crm: Arc<dyn CrmClient>,
    analytics: Arc<dyn AnalyticsClient>,
    context: IntegrationContext,
    config: SyncConfig,
}

impl SyncPipeline {
    pub fn new(
        db: SharedDb,
        crm: Arc<dyn CrmClient>,
        analytics: Arc<dyn AnalyticsClient>,
        context: IntegrationContext,
        config: SyncConfig,
    ) -> Self {
        Self {
            db,
            crm,
            analytics,
            context,
            config,
        }
    }

    pub fn tracker(&self) -> SyncStateTracker {
        SyncStateTracker::new(self.db.clone(), CRM_INTEGRATION)
    }

    /// Run one sync. `progress` is called after every written sub-batch.
    ///
    /// Configuration, database and analytics rate-limit failures mark the
    /// run failed and are returned. Individual query failures are counted
    /// and skipped; individual record failures end up in the batch result.
    pub async fn run<F>(&self, queries: &[AnalyticsQuery], progress: F) -> Result<SyncRunReport, SyncError>
    where
        F: FnMut(&BatchProgress),
    {
        let tracker = self.tracker();
        match self.run_inner(&tracker, queries, progress).await {
            Ok(report) => Ok(report),
            Err(e) => {
                if let Err(db_err) = tracker.fail_sync(&e.to_string()) {
                    log::error!("Could not record failed sync: {}", db_err);
                }
                Err(e)
            }
        }
    }

    async fn run_inner<F>(
        &self,
        tracker: &SyncStateTracker,
        queries: &[AnalyticsQuery],
        mut progress: F,
    ) -> Result<SyncRunReport, SyncError>
    where
        F: FnMut(&BatchProgress),
    {
        self.context.require_analytics_key()?;
        self.context.require_crm_key()?;

        let already_written = resume_point(&tracker.get()?);
        if !already_written.is_empty() {
            log::info!("Resuming sync; {} records were already written", already_written.len());
        }
        tracker.start_sync()?;

        // Analytics queries, cache first
        let cache = QueryCache::new(self.db.clone(), ANALYTICS_INTEGRATION, self.config.cache_ttl_secs);
        let analytics_limiter =
            RateLimiter::new(self.db.clone(), ANALYTICS_INTEGRATION, self.config.analytics_limit);
        let mut signals = Vec::new();
        let mut queries_failed = 0;
        let mut rows_skipped = 0;
        for query in queries {
            match cache
                .get_or_execute(&analytics_limiter, self.analytics.as_ref(), query)
                .await
            {
                Ok(rows) => {
                    for row in &rows {
                        match ExternalSignal::from_row(row) {
                            Some(signal) => signals.push(signal),
                            None => rows_skipped += 1,
                        }
                    }
                }
                Err(SyncError::Analytics(msg)) => {
                    log::warn!("Skipping analytics query {}: {}", query.name, msg);
                    queries_failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        // Composite scoring and routing
        let scorer = CompositeScorer::new(self.config.routing_threshold);
        let composites = scorer.score(signals);
        let accounts_scored = composites.len();
        let routed = scorer.route(composites);
        log::info!(
            "{} of {} accounts cleared the routing threshold {}",
            routed.len(),
            accounts_scored,
            scorer.routing_threshold()
        );

        let now = Utc::now();
        let (mut records, signals_persisted) = {
            let db = self.db.lock();
            db.with_transaction(|tx| self.prepare_records(tx, &routed, now))?
        };
        let prepared = records.len();
        records.retain(|r| !already_written.contains(&r.key));
        let resumed_skipped = prepared - records.len();

        // CRM write
        if !records.is_empty() {
            self.crm
                .ensure_attributes(&self.config.crm_object, &required_attributes())
                .await?;
        }

        let crm_limiter = Arc::new(RateLimiter::new(
            self.db.clone(),
            CRM_INTEGRATION,
            self.config.crm_limit,
        ));
        let writer = BatchSyncWriter::new(self.crm.clone(), WriterSettings::from(&self.config))
            .with_rate_limiter(crm_limiter);

        let mut written = already_written;
        let result = writer
            .write_in_batches(records, |p, batch| {
                written.extend(
                    batch
                        .outcomes
                        .iter()
                        .filter(|o| o.succeeded())
                        .map(|o| o.key.clone()),
                );
                if let Err(e) = tracker.update_progress(
                    p.records_processed as i64,
                    p.succeeded as i64,
                    p.failed as i64,
                    Some(cursor(&written)),
                ) {
                    log::warn!("Could not record sync progress: {}", e);
                }
                progress(p);
            })
            .await;

        tracker.complete_sync(&result)?;

        Ok(SyncRunReport {
            queries_run: queries.len(),
            queries_failed,
            rows_skipped,
            accounts_scored,
            accounts_routed: routed.len(),
            signals_persisted,
            resumed_skipped,
            status: result.status(),
            result,
        })
    }

    /// Persist routed signals against known accounts and build CRM records.
    fn prepare_records(
        &self,
        db: &AccountDb,
        routed: &[CompositeSignal],
        now: DateTime<Utc>,
    ) -> Result<(Vec<SyncRecord>, usize), DbError> {
        let mut records = Vec::with_capacity(routed.len());
        let mut persisted = 0;

        for composite in routed {
            let account = match db.get_account(&composite.account_id)? {
                Some(a) => Some(a),
                None => db.find_account_by_domain(&composite.account_id)?,
            };

            if let Some(account) = &account {
                persisted += persist_signals(db, account, composite, now)?;
            }

            let Some(matching_value) = matching_value(account.as_ref(), composite) else {
                log::warn!("No CRM match value for {}; not syncing", composite.account_id);
                continue;
            };

            let mut values = Map::new();
            values.insert(self.config.crm_matching_attribute.clone(), Value::String(matching_value));
            values.insert("signal_score".into(), json!(composite.score));
            values.insert("signal_types".into(), json!(composite.signal_types.join(", ")));
            values.insert("last_signal_at".into(), json!(ts(now)));
            records.push(SyncRecord::new(composite.account_id.clone(), values));
        }

        Ok((records, persisted))
    }
}

fn persist_signals(
    db: &AccountDb,
    account: &DbAccount,
    composite: &CompositeSignal,
    now: DateTime<Utc>,
) -> Result<usize, DbError> {
    let since = ts(now - Duration::hours(ANALYTICS_SIGNAL_DEDUP_HOURS));
    let mut written = 0;
    for signal in &composite.signals {
        if db.has_signal_since(&account.id, &signal.signal_type, &since)? {
            continue;
        }
        db.insert_signal(&DbSignal {
            id: format!("sig-{}", Uuid::new_v4()),
            account_id: account.id.clone(),
            signal_type: signal.signal_type.clone(),
            category: SignalCategory::Expansion,
            value: signal.score,
            details: signal.details.clone(),
            source: ANALYTICS_INTEGRATION.to_string(),
            detected_at: ts(now),
        })?;
        written += 1;
    }
    Ok(written)
}

/// Known account domain, then a `domain` detail on any signal, then the raw id.
fn matching_value(account: Option<&DbAccount>, composite: &CompositeSignal) -> Option<String> {
    if let Some(domain) = account.and_then(|a| a.domain.as_deref()) {
        if !domain.trim().is_empty() {
            return Some(domain.trim().to_string());
        }
    }
    composite
        .signals
        .iter()
        .find_map(|s| s.details.get("domain").and_then(Value::as_str))
        .map(str::to_string)
        .or_else(|| (!composite.account_id.trim().is_empty()).then(|| composite.account_id.clone()))
}

fn cursor(written: &BTreeSet<String>) -> Value {
    let mut map = Map::new();
    map.insert(CURSOR_WRITTEN_KEYS.to_string(), json!(written));
    Value::Object(map)
}

/// Record keys to skip. Only an interrupted or failed run leaves a usable
/// cursor; the routed set is rebuilt every run, so skipping is by key.
fn resume_point(state: &crate::db::DbSyncState) -> BTreeSet<String> {
    if !matches!(state.status, SyncStatus::InProgress | SyncStatus::Failed) {
        return BTreeSet::new();
    }
    state
        .cursor_data
        .as_ref()
        .and_then(|c| c.get(CURSOR_WRITTEN_KEYS))
        .and_then(Value::as_array)
        .map(|keys| {
            keys.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::db::test_utils::{sample_account, test_db};
    use crate::error::CrmError;
    use crate::sync::client::mock::{MockAnalytics, MockCrm};
    use crate::sync::client::QueryResult;
    use crate::sync::RateLimitPolicy;

    fn config() -> SyncConfig {
        SyncConfig {
            batch_size: 2,
            retry_base_delay_ms: 1,
            max_rate_limit_wait_secs: 0,
            ..SyncConfig::default()
        }
    }

    fn context() -> IntegrationContext {
        IntegrationContext::new(Some("crm-key".into()), Some("analytics-key".into()))
    }

    fn seeded_db() -> SharedDb {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let db = test_db();
        db.upsert_account(&sample_account("acme", now)).unwrap();
        db.upsert_account(&sample_account("globex", now)).unwrap();
        db.into_shared()
    }

    fn analytics() -> Arc<MockAnalytics> {
        let client = MockAnalytics::new();
        client.respond(
            "expansion",
            QueryResult::ok(vec![
                json!({"account_id": "acme", "signal_type": "usage_spike", "score": 40}),
                json!({"account_id": "acme", "signal_type": "pricing_page_interest", "score": 25}),
                json!({"account_id": "globex", "signal_type": "usage_spike", "score": 70}),
                json!({"account_id": "initech", "signal_type": "usage_spike", "score": 10}),
                json!({"bogus": true}),
            ]),
        );
        Arc::new(client)
    }

    #[tokio::test]
    async fn test_full_run_routes_and_writes() {
        let db = seeded_db();
        let crm = Arc::new(MockCrm::new());
        crm.always_fail("globex.example.com", CrmError::Validation("bad".into()));
        let pipeline = SyncPipeline::new(db.clone(), crm.clone(), analytics(), context(), config());

        let mut progress_calls = 0;
        let report = pipeline
            .run(
                &[
                    AnalyticsQuery::new("expansion", json!({"days": 7})),
                    AnalyticsQuery::new("unknown", json!({})),
                ],
                |_| progress_calls += 1,
            )
            .await
            .unwrap();

        assert_eq!(report.queries_failed, 1);
        assert_eq!(report.rows_skipped, 1);
        assert_eq!(report.accounts_scored, 3);
        // acme: 65 + 10 bonus, globex: 70 + 5; initech: 15
        assert_eq!(report.accounts_routed, 2);
        assert_eq!(report.signals_persisted, 3);
        assert_eq!(report.status, BatchStatus::Partial);
        assert_eq!(progress_calls, 1);
        assert_eq!(crm.attribute_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        let state = pipeline.tracker().get().unwrap();
        assert_eq!(state.status, SyncStatus::Partial);
        assert_eq!(state.error_summary.as_deref(), Some("validation: 1"));

        let stored = db.lock().get_recent_signals("acme", 10).unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|s| s.source == ANALYTICS_INTEGRATION));
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_the_run() {
        let db = seeded_db();
        let pipeline = SyncPipeline::new(
            db,
            Arc::new(MockCrm::new()),
            analytics(),
            IntegrationContext::new(None, Some("analytics-key".into())),
            config(),
        );
        let err = pipeline.run(&[], |_| {}).await.unwrap_err();
        assert!(err.requires_configuration());
        assert_eq!(pipeline.tracker().get().unwrap().status, SyncStatus::Failed);
    }

    #[tokio::test]
    async fn test_analytics_rate_limit_fails_the_run() {
        let db = seeded_db();
        let client = analytics();
        let pipeline = SyncPipeline::new(
            db,
            Arc::new(MockCrm::new()),
            client.clone(),
            context(),
            SyncConfig {
                analytics_limit: RateLimitPolicy {
                    limit: 0,
                    window_seconds: 3_600,
                },
                ..config()
            },
        );
        let err = pipeline
            .run(&[AnalyticsQuery::new("expansion", json!({}))], |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RateLimited(_)));
        assert_eq!(client.call_count(), 0);
        assert_eq!(pipeline.tracker().get().unwrap().status, SyncStatus::Failed);
    }

    fn keys(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn test_resume_skips_written_keys_when_routing_changes() {
        let db = seeded_db();
        let tracker = SyncStateTracker::new(db.clone(), CRM_INTEGRATION);
        tracker.start_sync().unwrap();
        tracker
            .update_progress(1, 1, 0, Some(cursor(&keys(&["acme"]))))
            .unwrap();
        tracker.fail_sync("process killed").unwrap();

        // zeta is new since the interrupted run and sorts ahead of acme
        let client = MockAnalytics::new();
        client.respond(
            "expansion",
            QueryResult::ok(vec![
                json!({"account_id": "zeta", "signal_type": "usage_spike", "score": 85}),
                json!({"account_id": "acme", "signal_type": "usage_spike", "score": 70}),
            ]),
        );

        let crm = Arc::new(MockCrm::new());
        let pipeline = SyncPipeline::new(db, crm.clone(), Arc::new(client), context(), SyncConfig {
            batch_size: 1,
            ..config()
        });
        let progress_tracker = pipeline.tracker();
        let mut cursors = Vec::new();
        let report = pipeline
            .run(&[AnalyticsQuery::new("expansion", json!({}))], |_| {
                cursors.push(progress_tracker.get().unwrap().cursor_data);
            })
            .await
            .unwrap();

        assert_eq!(report.accounts_routed, 2);
        assert_eq!(report.resumed_skipped, 1);
        let written: Vec<_> = report.result.outcomes.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(written, vec!["zeta"]);
        assert_eq!(crm.call_count(), 1);
        // a second crash here would still know about both records
        assert_eq!(cursors, vec![Some(cursor(&keys(&["acme", "zeta"])))]);

        let state = pipeline.tracker().get().unwrap();
        assert_eq!(state.status, SyncStatus::Success);
        assert_eq!(state.cursor_data, None);
    }

    #[test]
    fn test_resume_point_ignores_completed_runs() {
        let mut state = SyncStateTracker::new(test_db().into_shared(), "crm").get().unwrap();
        state.cursor_data = Some(cursor(&keys(&["acme", "globex"])));
        state.status = SyncStatus::Success;
        assert!(resume_point(&state).is_empty());
        state.status = SyncStatus::InProgress;
        assert_eq!(resume_point(&state), keys(&["acme", "globex"]));
        state.cursor_data = Some(json!({"batchesCompleted": 3}));
        assert!(resume_point(&state).is_empty());
    }
}
