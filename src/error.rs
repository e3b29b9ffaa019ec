//! Error types for the sync pipeline and its collaborators
//!
//! Errors are classified by recoverability:
//! - Retryable: rate limits, provider outages, transport failures
//! - NonRetryable: auth and validation rejections, database failures
//! - RequiresConfiguration: missing or blank credentials

use thiserror::Error;

use crate::db::DbError;

/// Raised by the rate limiter when an integration's budget is spent.
///
/// Callers should pause or defer; this is not a fatal condition.
#[derive(Debug, Clone, Error)]
#[error("Rate limit exceeded for {integration}; retry after {retry_after}s")]
pub struct RateLimitExceeded {
    pub integration: String,
    pub retry_after: u64,
}

/// Typed failures surfaced by a CRM client.
#[derive(Debug, Clone, Error)]
pub enum CrmError {
    #[error("CRM authentication failed: {0}")]
    Auth(String),

    #[error("CRM rejected record: {0}")]
    Validation(String),

    #[error("CRM rate limited; retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("CRM provider error: {0}")]
    Provider(String),

    #[error("Unexpected CRM failure: {0}")]
    Unexpected(String),
}

impl CrmError {
    /// Stable label used as the key in batch error histograms.
    pub fn category(&self) -> &'static str {
        match self {
            CrmError::Auth(_) => "auth",
            CrmError::Validation(_) => "validation",
            CrmError::RateLimited { .. } => "rate_limit",
            CrmError::Provider(_) => "provider",
            CrmError::Unexpected(_) => "unexpected",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, CrmError::Auth(_) | CrmError::Validation(_))
    }
}

/// Errors that can end or degrade a sync run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),

    #[error(transparent)]
    Crm(#[from] CrmError),

    #[error("Analytics query failed: {0}")]
    Analytics(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// Returns true if the same run could succeed if tried again later
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::RateLimited(_) | SyncError::Analytics(_) => true,
            SyncError::Crm(e) => e.is_retryable(),
            SyncError::Configuration(_) | SyncError::Database(_) | SyncError::Task(_) => false,
        }
    }

    /// Returns true if credentials or settings must change before retrying
    pub fn requires_configuration(&self) -> bool {
        matches!(
            self,
            SyncError::Configuration(_) | SyncError::Crm(CrmError::Auth(_))
        )
    }

    /// Get a user-friendly recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            SyncError::Configuration(_) => "Add the missing API key to the integration settings.",
            SyncError::Database(_) => "Check disk space and permissions on ~/.accountpulse.",
            SyncError::RateLimited(_) => "The request budget is spent. Wait for the window to roll over.",
            SyncError::Crm(CrmError::Auth(_)) => "Reconnect the CRM; the API key was rejected.",
            SyncError::Crm(CrmError::Validation(_)) => {
                "Check that the CRM object has the expected attributes."
            }
            SyncError::Crm(_) => "The CRM is having trouble. Try the sync again shortly.",
            SyncError::Analytics(_) => "Check the analytics query and try again.",
            SyncError::Task(_) => "Something went wrong internally. Check the logs.",
        }
    }
}

/// Serializable error representation for callers that surface failures
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncErrorReport {
    pub message: String,
    pub error_type: ErrorType,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorType {
    Retryable,
    NonRetryable,
    RequiresConfiguration,
}

impl From<&SyncError> for SyncErrorReport {
    fn from(err: &SyncError) -> Self {
        let error_type = if err.requires_configuration() {
            ErrorType::RequiresConfiguration
        } else if err.is_retryable() {
            ErrorType::Retryable
        } else {
            ErrorType::NonRetryable
        };

        SyncErrorReport {
            message: err.to_string(),
            error_type,
            can_retry: err.is_retryable(),
            recovery_suggestion: err.recovery_suggestion().to_string(),
        }
    }
}
