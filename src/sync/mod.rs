//! CRM sync pipeline.
//!
//! Analytics queries run through a rate limiter and a TTL cache, their rows
//! are combined into composite scores, and qualifying accounts are upserted
//! into the CRM by a bounded-concurrency batch writer. Progress and outcome
//! land in a persisted sync-state row per integration.

pub mod cache;
pub mod client;
pub mod http;
pub mod pipeline;
pub mod rate_limiter;
pub mod state;
pub mod writer;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

pub use cache::{CacheStats, QueryCache};
pub use client::{AnalyticsClient, AnalyticsQuery, AttributeSpec, CrmClient, QueryResult};
pub use pipeline::{SyncPipeline, SyncRunReport};
pub use rate_limiter::{RateLimitStatus, RateLimiter};
pub use state::SyncStateTracker;
pub use writer::{BatchProgress, BatchResult, BatchStatus, BatchSyncWriter, SyncRecord};

/// Integration name used for analytics rate limits, cache entries and sync state.
pub const ANALYTICS_INTEGRATION: &str = "analytics";
/// Integration name used for CRM rate limits and sync state.
pub const CRM_INTEGRATION: &str = "crm";

/// Request budget over a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPolicy {
    pub limit: i64,
    pub window_seconds: i64,
}

impl RateLimitPolicy {
    pub fn analytics_default() -> Self {
        Self {
            limit: 1_000,
            window_seconds: 3_600,
        }
    }

    pub fn crm_default() -> Self {
        Self {
            limit: 10_000,
            window_seconds: 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Upper bound on a rate-limit sleep, whatever the provider asks for.
    pub max_rate_limit_wait_secs: u64,
    pub routing_threshold: f64,
    /// Analytics cache TTL; zero or negative disables expiry.
    pub cache_ttl_secs: i64,
    pub crm_object: String,
    pub crm_matching_attribute: String,
    pub analytics_limit: RateLimitPolicy,
    pub crm_limit: RateLimitPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_concurrency: 5,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            max_rate_limit_wait_secs: 60,
            routing_threshold: crate::scoring::composite::DEFAULT_ROUTING_THRESHOLD,
            cache_ttl_secs: 3_600,
            crm_object: "companies".to_string(),
            crm_matching_attribute: "domain".to_string(),
            analytics_limit: RateLimitPolicy::analytics_default(),
            crm_limit: RateLimitPolicy::crm_default(),
        }
    }
}

/// Credentials for the external collaborators, passed in explicitly.
#[derive(Clone, Default)]
pub struct IntegrationContext {
    crm_api_key: Option<String>,
    analytics_api_key: Option<String>,
}

impl std::fmt::Debug for IntegrationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationContext")
            .field("crm_api_key", &self.crm_api_key.as_ref().map(|_| "<redacted>"))
            .field("analytics_api_key", &self.analytics_api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl IntegrationContext {
    pub fn new(crm_api_key: Option<String>, analytics_api_key: Option<String>) -> Self {
        Self {
            crm_api_key,
            analytics_api_key,
        }
    }

    pub fn require_crm_key(&self) -> Result<&str, SyncError> {
        require_key(self.crm_api_key.as_deref(), "CRM")
    }

    pub fn require_analytics_key(&self) -> Result<&str, SyncError> {
        require_key(self.analytics_api_key.as_deref(), "analytics")
    }
}

fn require_key<'a>(key: Option<&'a str>, label: &str) -> Result<&'a str, SyncError> {
    match key.map(str::trim) {
        Some(k) if !k.is_empty() => Ok(k),
        _ => Err(SyncError::Configuration(format!("{} API key is not configured", label))),
    }
}
