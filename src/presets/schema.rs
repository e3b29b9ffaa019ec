use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::db::SignalCategory;

/// A heuristics preset: per-signal weights and thresholds plus the global
/// knobs for decay, normalization, fit scoring and opportunity creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeuristicsConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Keyed by signal type (`usage_spike`, `inactivity`, ...).
    pub signals: BTreeMap<String, SignalConfig>,
    /// Half-life, in days, of a signal's contribution.
    pub recency_decay_days: f64,
    /// Signals older than this are ignored entirely.
    pub max_signal_age_days: i64,
    #[serde(default)]
    pub scale: ScoreScale,
    pub fit_multipliers: FitMultipliers,
    pub fit_scoring: FitScoringConfig,
    pub thresholds: ScoreThresholds,
    pub opportunity_generation: OpportunityGeneration,
    #[serde(default = "default_recalculation_hours")]
    pub recalculation_frequency_hours: i64,
}

fn default_recalculation_hours() -> i64 {
    24
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalConfig {
    /// Churn signals carry negative weights so they pull health down.
    pub weight: f64,
    pub category: SignalCategory,
    pub threshold: f64,
    pub time_window_days: i64,
    /// Dedup window; falls back to `time_window_days`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_days: Option<i64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl SignalConfig {
    pub fn dedup_window_days(&self) -> i64 {
        self.dedup_days.unwrap_or(self.time_window_days)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreScale {
    pub min: f64,
    pub max: f64,
}

impl Default for ScoreScale {
    fn default() -> Self {
        Self { min: 0.0, max: 100.0 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FitMultipliers {
    pub icp_match: f64,
    pub near_icp: f64,
    pub poor_fit: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FitScoringConfig {
    #[serde(default)]
    pub target_industries: Vec<String>,
    pub employee_range: ValueRange,
    pub revenue_range: ValueRange,
    #[serde(default)]
    pub target_regions: Vec<String>,
    pub weights: FitWeights,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FitWeights {
    pub industry: f64,
    pub employees: f64,
    pub revenue: f64,
    pub region: f64,
}

impl FitWeights {
    pub fn total(&self) -> f64 {
        self.industry + self.employees + self.revenue + self.region
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreThresholds {
    pub expansion: f64,
    pub churn_risk: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityGeneration {
    pub enabled: bool,
    pub cooldown_days: i64,
    pub expansion_value_multiplier: f64,
    pub churn_risk_value_multiplier: f64,
}
