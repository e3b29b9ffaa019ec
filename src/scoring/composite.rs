//! Composite scoring for signals sourced from the analytics service.
//!
//! Signals are grouped per account. Base scores add up to `BASE_SCORE_CAP`;
//! each distinct signal type adds `DIVERSITY_BONUS_PER_TYPE` up to
//! `DIVERSITY_BONUS_CAP`. Only composites at or above the routing threshold
//! go on to the CRM.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::SignalDetails;

pub const BASE_SCORE_CAP: f64 = 80.0;
pub const DIVERSITY_BONUS_PER_TYPE: f64 = 5.0;
pub const DIVERSITY_BONUS_CAP: f64 = 20.0;
pub const MAX_COMPOSITE_SCORE: f64 = 100.0;
pub const DEFAULT_ROUTING_THRESHOLD: f64 = 60.0;

/// One signal row returned by an analytics query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSignal {
    pub account_id: String,
    pub signal_type: String,
    pub score: f64,
    #[serde(default)]
    pub details: SignalDetails,
}

impl ExternalSignal {
    /// Parse a result row. Accepts snake_case or camelCase keys; any other
    /// keys are kept as details. Rows without an account, type or numeric
    /// score are rejected.
    pub fn from_row(row: &Value) -> Option<Self> {
        let obj = row.as_object()?;
        let field = |snake: &str, camel: &str| obj.get(snake).or_else(|| obj.get(camel));

        let account_id = field("account_id", "accountId")?.as_str()?.to_string();
        let signal_type = field("signal_type", "signalType")?.as_str()?.to_string();
        let score = obj.get("score")?.as_f64()?;

        let known = ["account_id", "accountId", "signal_type", "signalType", "score"];
        let details = obj
            .iter()
            .filter(|(k, _)| !known.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Some(Self {
            account_id,
            signal_type,
            score,
            details,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeSignal {
    pub account_id: String,
    pub score: f64,
    pub base_score: f64,
    pub diversity_bonus: f64,
    pub signal_types: Vec<String>,
    pub signals: Vec<ExternalSignal>,
}

#[derive(Debug, Clone, Copy)]
pub struct CompositeScorer {
    routing_threshold: f64,
}

impl Default for CompositeScorer {
    fn default() -> Self {
        Self::new(DEFAULT_ROUTING_THRESHOLD)
    }
}

impl CompositeScorer {
    pub fn new(routing_threshold: f64) -> Self {
        Self { routing_threshold }
    }

    pub fn routing_threshold(&self) -> f64 {
        self.routing_threshold
    }

    /// Combine signals per account, highest score first.
    pub fn score(&self, signals: Vec<ExternalSignal>) -> Vec<CompositeSignal> {
        let mut by_account: BTreeMap<String, Vec<ExternalSignal>> = BTreeMap::new();
        for signal in signals {
            by_account.entry(signal.account_id.clone()).or_default().push(signal);
        }

        let mut composites: Vec<CompositeSignal> = by_account
            .into_iter()
            .map(|(account_id, signals)| {
                let base_score = signals
                    .iter()
                    .map(|s| s.score)
                    .sum::<f64>()
                    .clamp(0.0, BASE_SCORE_CAP);
                let types: BTreeSet<String> = signals.iter().map(|s| s.signal_type.clone()).collect();
                let diversity_bonus =
                    (types.len() as f64 * DIVERSITY_BONUS_PER_TYPE).min(DIVERSITY_BONUS_CAP);
                CompositeSignal {
                    account_id,
                    score: (base_score + diversity_bonus).min(MAX_COMPOSITE_SCORE),
                    base_score,
                    diversity_bonus,
                    signal_types: types.into_iter().collect(),
                    signals,
                }
            })
            .collect();

        composites.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.account_id.cmp(&b.account_id)));
        composites
    }

    /// Keep composites eligible for CRM sync.
    pub fn route(&self, composites: Vec<CompositeSignal>) -> Vec<CompositeSignal> {
        composites
            .into_iter()
            .filter(|c| c.score >= self.routing_threshold)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn ext(account: &str, signal_type: &str, score: f64) -> ExternalSignal {
        ExternalSignal {
            account_id: account.to_string(),
            signal_type: signal_type.to_string(),
            score,
            details: SignalDetails::new(),
        }
    }

    #[test]
    fn test_caps_hold() {
        let scorer = CompositeScorer::default();
        let signals: Vec<_> = (0..10)
            .map(|i| ext("acme", &format!("type_{}", i), 30.0))
            .collect();
        let out = scorer.score(signals);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].base_score, BASE_SCORE_CAP);
        assert_eq!(out[0].diversity_bonus, DIVERSITY_BONUS_CAP);
        assert_eq!(out[0].score, MAX_COMPOSITE_SCORE);
    }

    #[test]
    fn test_diversity_bonus_counts_distinct_types() {
        let scorer = CompositeScorer::default();
        let out = scorer.score(vec![
            ext("acme", "usage_spike", 20.0),
            ext("acme", "usage_spike", 15.0),
            ext("acme", "pricing_page_interest", 10.0),
        ]);
        assert_eq!(out[0].base_score, 45.0);
        assert_eq!(out[0].diversity_bonus, 10.0);
        assert_eq!(out[0].score, 55.0);
    }

    #[test]
    fn test_route_filters_and_orders() {
        let scorer = CompositeScorer::new(60.0);
        let out = scorer.score(vec![
            ext("low", "usage_spike", 10.0),
            ext("high", "usage_spike", 70.0),
            ext("mid", "usage_spike", 55.0),
        ]);
        assert_eq!(out[0].account_id, "high");
        let routed = scorer.route(out);
        let ids: Vec<_> = routed.iter().map(|c| c.account_id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid"]);
    }

    #[test]
    fn test_from_row_accepts_both_casings() {
        let a = ExternalSignal::from_row(&json!({"account_id": "acme", "signal_type": "x", "score": 12, "seats": 40}))
            .unwrap();
        assert_eq!(a.score, 12.0);
        assert_eq!(a.details.get("seats"), Some(&json!(40)));

        let b = ExternalSignal::from_row(&json!({"accountId": "acme", "signalType": "x", "score": 3.5})).unwrap();
        assert_eq!(b.account_id, "acme");

        assert!(ExternalSignal::from_row(&json!({"account_id": "acme", "score": 1})).is_none());
        assert!(ExternalSignal::from_row(&json!("not an object")).is_none());
    }
}
