//! Detector contract and registry.
//!
//! A detector owns one `(signal_type, category)` pair. Before evaluating it
//! checks its dedup window, and on a positive evaluation it persists exactly
//! one `Signal` row. Detectors never read each other's output from the same
//! run, so registry order does not matter.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::db::{AccountDb, DbAccount, DbError, DbSignal, SignalCategory, SignalDetails};
use crate::presets::SignalConfig;
use crate::util::ts;

/// `source` recorded on signals produced by detectors.
pub const DETECTOR_SOURCE: &str = "detector";

/// The outcome of a positive rule evaluation, before it becomes a row.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub value: f64,
    pub details: SignalDetails,
}

impl Detection {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            details: SignalDetails::new(),
        }
    }

    /// Attach a detail entry. Values that fail to serialize are dropped.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.insert(key.to_string(), v);
        }
        self
    }
}

/// What a rule sees: the clock and its own configured threshold/window.
pub struct RuleContext<'a> {
    pub now: DateTime<Utc>,
    pub config: &'a SignalConfig,
}

impl RuleContext<'_> {
    pub fn threshold(&self) -> f64 {
        self.config.threshold
    }

    pub fn window_days(&self) -> i64 {
        self.config.time_window_days
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        self.now - Duration::days(self.config.time_window_days)
    }
}

pub trait SignalDetector: Send + Sync {
    fn signal_type(&self) -> &str;

    fn category(&self) -> SignalCategory;

    fn config(&self) -> &SignalConfig;

    /// Pure rule evaluation. Must not write.
    fn evaluate(
        &self,
        db: &AccountDb,
        account: &DbAccount,
        now: DateTime<Utc>,
    ) -> Result<Option<Detection>, DbError>;

    /// Dedup-check, evaluate, and persist at a fixed instant.
    ///
    /// The check and the insert share one transaction, so two calls inside
    /// the dedup window persist at most one signal.
    fn detect_at(
        &self,
        db: &AccountDb,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DbSignal>, DbError> {
        db.with_transaction(|tx| {
            let since = ts(now - Duration::days(self.config().dedup_window_days()));
            if tx.has_signal_since(account_id, self.signal_type(), &since)? {
                return Ok(None);
            }

            let account = tx.require_account(account_id)?;
            let Some(detection) = self.evaluate(tx, &account, now)? else {
                return Ok(None);
            };

            let signal = DbSignal {
                id: format!("sig-{}", Uuid::new_v4()),
                account_id: account_id.to_string(),
                signal_type: self.signal_type().to_string(),
                category: self.category(),
                value: detection.value,
                details: detection.details,
                source: DETECTOR_SOURCE.to_string(),
                detected_at: ts(now),
            };
            tx.insert_signal(&signal)?;
            Ok(Some(signal))
        })
    }

    fn detect(&self, db: &AccountDb, account_id: &str) -> Result<Option<DbSignal>, DbError> {
        self.detect_at(db, account_id, Utc::now())
    }
}

/// Function signature for a detector rule.
pub type RuleFn = fn(&AccountDb, &DbAccount, &RuleContext<'_>) -> Result<Option<Detection>, DbError>;

/// A detector backed by a plain rule function and its configuration entry.
pub struct RuleDetector {
    signal_type: String,
    category: SignalCategory,
    config: SignalConfig,
    rule: RuleFn,
}

impl RuleDetector {
    pub fn new(signal_type: &str, category: SignalCategory, config: SignalConfig, rule: RuleFn) -> Self {
        Self {
            signal_type: signal_type.to_string(),
            category,
            config,
            rule,
        }
    }
}

impl SignalDetector for RuleDetector {
    fn signal_type(&self) -> &str {
        &self.signal_type
    }

    fn category(&self) -> SignalCategory {
        self.category
    }

    fn config(&self) -> &SignalConfig {
        &self.config
    }

    fn evaluate(
        &self,
        db: &AccountDb,
        account: &DbAccount,
        now: DateTime<Utc>,
    ) -> Result<Option<Detection>, DbError> {
        let ctx = RuleContext {
            now,
            config: &self.config,
        };
        (self.rule)(db, account, &ctx)
    }
}

/// Ordered set of detectors run against every account.
#[derive(Default)]
pub struct DetectorRegistry {
    detectors: Vec<Box<dyn SignalDetector>>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, detector: Box<dyn SignalDetector>) {
        self.detectors.push(detector);
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn SignalDetector> {
        self.detectors.iter().map(|d| d.as_ref())
    }

    pub fn signal_types(&self) -> Vec<&str> {
        self.detectors.iter().map(|d| d.signal_type()).collect()
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }
}
