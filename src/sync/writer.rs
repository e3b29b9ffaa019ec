//! Bounded-concurrency CRM upserts with per-record retry.
//!
//! Each record runs in its own task behind a semaphore. A record's retries
//! stay inside its task; results are collected by the caller after every
//! task has finished, in submission order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;

use super::client::CrmClient;
use super::rate_limiter::RateLimiter;
use super::SyncConfig;
use crate::error::{CrmError, SyncError};

/// One record bound for the CRM. `key` identifies it in results.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub key: String,
    pub values: Map<String, Value>,
}

impl SyncRecord {
    pub fn new(key: impl Into<String>, values: Map<String, Value>) -> Self {
        Self {
            key: key.into(),
            values,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome {
    pub key: String,
    pub record_id: Option<String>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub attempts: u32,
}

impl RecordOutcome {
    pub fn succeeded(&self) -> bool {
        self.record_id.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub outcomes: Vec<RecordOutcome>,
    /// Failure count per error category (`auth`, `validation`, ...).
    pub error_counts: BTreeMap<String, usize>,
}

impl BatchResult {
    fn from_outcomes(outcomes: Vec<RecordOutcome>) -> Self {
        let mut result = BatchResult {
            total: outcomes.len(),
            ..Default::default()
        };
        for outcome in &outcomes {
            if outcome.succeeded() {
                result.succeeded += 1;
            } else {
                result.failed += 1;
                let category = outcome.error_type.clone().unwrap_or_else(|| "unexpected".into());
                *result.error_counts.entry(category).or_insert(0) += 1;
            }
        }
        result.outcomes = outcomes;
        result
    }

    /// An empty batch counts as a success.
    pub fn status(&self) -> BatchStatus {
        if self.failed == 0 {
            BatchStatus::Success
        } else if self.succeeded == 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::Partial
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.succeeded as f64 / self.total as f64 * 100.0
    }

    pub fn merge(&mut self, other: BatchResult) {
        self.total += other.total;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.outcomes.extend(other.outcomes);
        for (category, count) in other.error_counts {
            *self.error_counts.entry(category).or_insert(0) += count;
        }
    }
}

/// Reported after each sub-batch of `write_in_batches`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    /// Zero-based index of the sub-batch that just finished.
    pub batch_index: usize,
    pub total_batches: usize,
    pub records_processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct WriterSettings {
    pub object_type: String,
    pub matching_attribute: String,
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub max_rate_limit_wait: Duration,
}

impl From<&SyncConfig> for WriterSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            object_type: config.crm_object.clone(),
            matching_attribute: config.crm_matching_attribute.clone(),
            batch_size: config.batch_size.max(1),
            max_concurrency: config.max_concurrency.max(1),
            max_retries: config.max_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_rate_limit_wait: Duration::from_secs(config.max_rate_limit_wait_secs),
        }
    }
}

#[derive(Clone)]
pub struct BatchSyncWriter {
    client: Arc<dyn CrmClient>,
    limiter: Option<Arc<RateLimiter>>,
    settings: WriterSettings,
}

impl BatchSyncWriter {
    pub fn new(client: Arc<dyn CrmClient>, settings: WriterSettings) -> Self {
        Self {
            client,
            limiter: None,
            settings,
        }
    }

    /// Spend one unit of `limiter` before every upsert attempt.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn settings(&self) -> &WriterSettings {
        &self.settings
    }

    /// Write one batch with at most `max_concurrency` upserts in flight.
    pub async fn write_batch(&self, records: Vec<SyncRecord>) -> BatchResult {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrency));
        let mut handles = Vec::with_capacity(records.len());

        for record in records {
            let key = record.key.clone();
            let writer = self.clone();
            let semaphore = semaphore.clone();
            let handle = tokio::spawn(async move {
                // Closed only if the semaphore is dropped, which can't happen here.
                let _permit = semaphore.acquire_owned().await.ok();
                writer.write_record(record).await
            });
            handles.push((key, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (key, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::error!("Sync task for {} did not complete: {}", key, e);
                    RecordOutcome {
                        key,
                        record_id: None,
                        error: Some(e.to_string()),
                        error_type: Some("unexpected".to_string()),
                        attempts: 0,
                    }
                }
            };
            outcomes.push(outcome);
        }

        BatchResult::from_outcomes(outcomes)
    }

    /// Chunk `records` into `batch_size` sub-batches and write them in order.
    /// `progress` gets the running totals and the sub-batch that just finished.
    pub async fn write_in_batches<F>(&self, records: Vec<SyncRecord>, mut progress: F) -> BatchResult
    where
        F: FnMut(&BatchProgress, &BatchResult),
    {
        let batch_size = self.settings.batch_size.max(1);
        let total_batches = records.len().div_ceil(batch_size);
        let mut aggregate = BatchResult::default();
        let mut chunks: Vec<Vec<SyncRecord>> = Vec::with_capacity(total_batches);
        let mut iter = records.into_iter().peekable();
        while iter.peek().is_some() {
            chunks.push(iter.by_ref().take(batch_size).collect());
        }

        for (batch_index, chunk) in chunks.into_iter().enumerate() {
            let result = self.write_batch(chunk).await;
            log::info!(
                "Sync batch {}/{}: {} succeeded, {} failed",
                batch_index + 1,
                total_batches,
                result.succeeded,
                result.failed
            );
            let report = BatchProgress {
                batch_index,
                total_batches,
                records_processed: aggregate.total + result.total,
                succeeded: aggregate.succeeded + result.succeeded,
                failed: aggregate.failed + result.failed,
            };
            progress(&report, &result);
            aggregate.merge(result);
        }

        aggregate
    }

    async fn write_record(&self, record: SyncRecord) -> RecordOutcome {
        let max_attempts = self.settings.max_retries + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.attempt_upsert(&record).await {
                Ok(record_id) => {
                    return RecordOutcome {
                        key: record.key,
                        record_id: Some(record_id),
                        error: None,
                        error_type: None,
                        attempts: attempt,
                    }
                }
                Err(e) => e,
            };

            if !err.is_retryable() || attempt >= max_attempts {
                if err.is_retryable() {
                    log::warn!(
                        "Giving up on {} after {} attempts: {}",
                        record.key,
                        attempt,
                        err
                    );
                } else {
                    log::warn!("Not retrying {}: {}", record.key, err);
                }
                return RecordOutcome {
                    key: record.key,
                    record_id: None,
                    error: Some(err.to_string()),
                    error_type: Some(err.category().to_string()),
                    attempts: attempt,
                };
            }

            let delay = self.retry_delay(&err, attempt);
            log::warn!(
                "CRM upsert for {} failed ({}), retry {}/{} (sleep {:?})",
                record.key,
                err,
                attempt,
                self.settings.max_retries,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt_upsert(&self, record: &SyncRecord) -> Result<String, CrmError> {
        if let Some(limiter) = &self.limiter {
            match limiter.acquire(1).await {
                Ok(()) => {}
                Err(SyncError::RateLimited(e)) => {
                    return Err(CrmError::RateLimited {
                        retry_after: e.retry_after,
                    })
                }
                Err(e) => return Err(CrmError::Unexpected(e.to_string())),
            }
        }
        self.client
            .upsert_record(
                &self.settings.object_type,
                &record.values,
                &self.settings.matching_attribute,
            )
            .await
    }

    /// Rate limits wait out the hint (capped); everything else backs off
    /// exponentially from the base delay.
    fn retry_delay(&self, err: &CrmError, attempt: u32) -> Duration {
        match err {
            CrmError::RateLimited { retry_after } => {
                Duration::from_secs(*retry_after).min(self.settings.max_rate_limit_wait)
            }
            _ => {
                let exp = attempt.saturating_sub(1).min(16);
                self.settings.retry_base_delay.saturating_mul(1u32 << exp)
            }
        }
    }
}
