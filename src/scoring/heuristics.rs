//! Heuristics engine: decayed, fit-adjusted signal aggregation into health,
//! expansion and churn-risk scores, plus cooldown-gated opportunity creation.
//!
//! Per score type:
//! 1. take signals newer than `maxSignalAgeDays`, filtered by category
//!    (health takes every category)
//! 2. contribution = weight × half-life decay (absolute weight for churn risk)
//! 3. multiply the sum by the account's fit multiplier
//! 4. map into the scale with `mid + range/2 × tanh(sum / 100)`, clamped

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::fit::FitScorer;
use crate::db::{
    AccountDb, ComponentScores, DbAccount, DbError, DbHeuristicScore, DbOpportunity, DbSignal, ScoreType,
};
use crate::presets::HeuristicsConfig;
use crate::signals::decay::{age_days_at, recency_decay};
use crate::util::{parse_ts, ts};

/// Stage given to newly created opportunities.
pub const OPPORTUNITY_STAGE_IDENTIFIED: &str = "identified";

/// One computed score before it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreResult {
    pub score_type: ScoreType,
    pub value: f64,
    pub raw_sum: f64,
    pub adjusted_sum: f64,
    pub fit_multiplier: f64,
    /// Fit-adjusted contribution per signal type; sums to `adjusted_sum`.
    pub component_scores: ComponentScores,
    pub signal_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountScores {
    pub account_id: String,
    pub scores: Vec<DbHeuristicScore>,
    pub opportunities: Vec<DbOpportunity>,
}

impl AccountScores {
    pub fn get(&self, score_type: ScoreType) -> Option<&DbHeuristicScore> {
        self.scores.iter().find(|s| s.score_type == score_type)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringSummary {
    pub accounts_scored: usize,
    pub accounts_failed: usize,
    pub opportunities_created: usize,
}

pub struct HeuristicsEngine {
    config: HeuristicsConfig,
    fit: FitScorer,
}

impl HeuristicsEngine {
    /// The config is resolved once here; the engine never re-reads it.
    pub fn new(config: HeuristicsConfig) -> Self {
        let fit = FitScorer::new(&config);
        Self { config, fit }
    }

    pub fn config(&self) -> &HeuristicsConfig {
        &self.config
    }

    pub fn fit_scorer(&self) -> &FitScorer {
        &self.fit
    }

    /// Saturating map of an adjusted sum into `[scale.min, scale.max]`.
    /// Monotonically non-decreasing; a zero sum lands on the midpoint.
    pub fn normalize(&self, adjusted_sum: f64) -> f64 {
        let (min, max) = (self.config.scale.min, self.config.scale.max);
        let mid = (min + max) / 2.0;
        let half_range = (max - min) / 2.0;
        (mid + half_range * (adjusted_sum / 100.0).tanh()).clamp(min, max)
    }

    /// Fit multiplier from the stored fit score, computing it if absent.
    pub fn fit_multiplier_for(&self, account: &DbAccount) -> f64 {
        let fit_score = match account.fit_score {
            Some(score) => score,
            None => self.fit.score_account(account).total,
        };
        self.fit.get_fit_multiplier(fit_score)
    }

    /// Aggregate signals into one score type. Pure; nothing is persisted.
    pub fn compute_score(
        &self,
        signals: &[DbSignal],
        score_type: ScoreType,
        fit_multiplier: f64,
        now: DateTime<Utc>,
    ) -> ScoreResult {
        let filter = score_type.category_filter();
        let max_age = self.config.max_signal_age_days as f64;

        let mut raw_sum = 0.0;
        let mut signal_count = 0;
        let mut components = ComponentScores::new();

        for signal in signals {
            if filter.is_some_and(|cat| cat != signal.category) {
                continue;
            }
            let Some(signal_cfg) = self.config.signals.get(&signal.signal_type) else {
                log::debug!("No weight configured for {}; ignoring", signal.signal_type);
                continue;
            };
            let age = age_days_at(&signal.detected_at, now);
            if age > max_age {
                continue;
            }

            let weight = match score_type {
                ScoreType::ChurnRisk => signal_cfg.weight.abs(),
                _ => signal_cfg.weight,
            };
            let contribution = weight * recency_decay(age, self.config.recency_decay_days);
            raw_sum += contribution;
            signal_count += 1;
            *components.entry(signal.signal_type.clone()).or_insert(0.0) += contribution * fit_multiplier;
        }

        let adjusted_sum = raw_sum * fit_multiplier;
        ScoreResult {
            score_type,
            value: self.normalize(adjusted_sum),
            raw_sum,
            adjusted_sum,
            fit_multiplier,
            component_scores: components,
            signal_count,
        }
    }

    /// Score one account, persist the three scores, and create any
    /// opportunity the thresholds call for.
    pub fn score_account(&self, db: &AccountDb, account_id: &str) -> Result<AccountScores, DbError> {
        self.score_account_at(db, account_id, Utc::now())
    }

    pub fn score_account_at(
        &self,
        db: &AccountDb,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AccountScores, DbError> {
        let account = db.require_account(account_id)?;
        let fit_multiplier = self.fit_multiplier_for(&account);
        let since = ts(now - Duration::days(self.config.max_signal_age_days));
        let signals = db.get_signals_since(account_id, &since)?;

        let calculated_at = ts(now);
        let valid_until = ts(now + Duration::hours(self.config.recalculation_frequency_hours));

        let mut scores = Vec::with_capacity(ScoreType::ALL.len());
        for score_type in ScoreType::ALL {
            let result = self.compute_score(&signals, score_type, fit_multiplier, now);
            let row = DbHeuristicScore {
                id: format!("hs-{}", Uuid::new_v4()),
                account_id: account_id.to_string(),
                score_type,
                value: result.value,
                component_scores: result.component_scores,
                fit_multiplier,
                calculated_at: calculated_at.clone(),
                valid_until: valid_until.clone(),
            };
            db.insert_heuristic_score(&row)?;
            if score_type == ScoreType::Health {
                db.update_account_health_score(account_id, row.value, now)?;
            }
            scores.push(row);
        }

        let mut opportunities = Vec::new();
        for score in &scores {
            if let Some(opp) = self.maybe_create_opportunity(db, &account, score.score_type, score.value, now)? {
                opportunities.push(opp);
            }
        }

        Ok(AccountScores {
            account_id: account_id.to_string(),
            scores,
            opportunities,
        })
    }

    /// Create an opportunity if `value` crosses its threshold and the
    /// account has had none inside the cooldown window.
    fn maybe_create_opportunity(
        &self,
        db: &AccountDb,
        account: &DbAccount,
        score_type: ScoreType,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<DbOpportunity>, DbError> {
        let gen = &self.config.opportunity_generation;
        if !gen.enabled {
            return Ok(None);
        }
        let (threshold, multiplier) = match score_type {
            ScoreType::Expansion => (self.config.thresholds.expansion, gen.expansion_value_multiplier),
            ScoreType::ChurnRisk => (self.config.thresholds.churn_risk, gen.churn_risk_value_multiplier),
            ScoreType::Health => return Ok(None),
        };
        if value < threshold {
            return Ok(None);
        }

        let cooldown_start = ts(now - Duration::days(gen.cooldown_days));
        if db.has_opportunity_since(&account.id, &cooldown_start)? {
            log::debug!(
                "{} crossed {} threshold but is inside the {}d cooldown",
                account.id,
                score_type,
                gen.cooldown_days
            );
            return Ok(None);
        }

        let opp = DbOpportunity {
            id: format!("opp-{}", Uuid::new_v4()),
            account_id: account.id.clone(),
            opportunity_type: score_type,
            stage: OPPORTUNITY_STAGE_IDENTIFIED.to_string(),
            value: account.arr.unwrap_or(0.0) * multiplier,
            score: value,
            created_at: ts(now),
        };
        db.insert_opportunity(&opp)?;
        log::info!(
            "Created {} opportunity for {} (score {:.1}, value {:.0})",
            score_type,
            account.id,
            value,
            opp.value
        );
        Ok(Some(opp))
    }

    pub fn latest_score(
        &self,
        db: &AccountDb,
        account_id: &str,
        score_type: ScoreType,
    ) -> Result<Option<DbHeuristicScore>, DbError> {
        db.get_latest_score(account_id, score_type)
    }

    pub fn score_history(
        &self,
        db: &AccountDb,
        account_id: &str,
        score_type: ScoreType,
        limit: i64,
    ) -> Result<Vec<DbHeuristicScore>, DbError> {
        db.get_score_history(account_id, score_type, limit)
    }

    /// Score every account. One account failing does not stop the rest.
    pub fn run_all_accounts(&self, db: &AccountDb) -> Result<ScoringSummary, DbError> {
        self.run_all_accounts_at(db, Utc::now())
    }

    pub fn run_all_accounts_at(&self, db: &AccountDb, now: DateTime<Utc>) -> Result<ScoringSummary, DbError> {
        let mut summary = ScoringSummary::default();
        for account_id in db.list_account_ids()? {
            match self.score_account_at(db, &account_id, now) {
                Ok(scores) => {
                    summary.accounts_scored += 1;
                    summary.opportunities_created += scores.opportunities.len();
                }
                Err(e) => {
                    log::warn!("Scoring failed for account {}: {}", account_id, e);
                    summary.accounts_failed += 1;
                }
            }
        }
        log::info!(
            "Scored {} accounts ({} failed), {} opportunities created",
            summary.accounts_scored,
            summary.accounts_failed,
            summary.opportunities_created
        );
        Ok(summary)
    }
}

/// Whether a stored score is still inside its validity window.
pub fn is_score_fresh(score: &DbHeuristicScore, now: DateTime<Utc>) -> bool {
    parse_ts(&score.valid_until).is_some_and(|until| until > now)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::db::test_utils::{sample_account, test_db};
    use crate::db::{SignalCategory, SignalDetails};
    use crate::presets::{load_default_preset, SignalConfig};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap()
    }

    fn signal(id: &str, signal_type: &str, category: SignalCategory, age_days: i64) -> DbSignal {
        DbSignal {
            id: id.to_string(),
            account_id: "acme".to_string(),
            signal_type: signal_type.to_string(),
            category,
            value: 1.0,
            details: SignalDetails::new(),
            source: "detector".to_string(),
            detected_at: ts(now() - Duration::days(age_days)),
        }
    }

    /// Default preset with three flat-weight expansion signals.
    fn engine() -> HeuristicsEngine {
        let mut config = load_default_preset().unwrap();
        for name in ["usage_spike", "team_growth", "feature_adoption"] {
            config.signals.insert(
                name.to_string(),
                SignalConfig {
                    weight: 10.0,
                    category: SignalCategory::Expansion,
                    threshold: 1.0,
                    time_window_days: 7,
                    dedup_days: None,
                    enabled: true,
                },
            );
        }
        HeuristicsEngine::new(config)
    }

    fn seed(db: &AccountDb) {
        let mut acct = sample_account("acme", now());
        acct.fit_score = Some(0.9);
        db.upsert_account(&acct).unwrap();
        db.update_account_fit_score("acme", 0.9, now()).unwrap();
        for (i, name) in ["usage_spike", "team_growth", "feature_adoption"].iter().enumerate() {
            db.insert_signal(&signal(&format!("s{}", i), name, SignalCategory::Expansion, 0))
                .unwrap();
        }
    }

    #[test]
    fn test_normalize_bounded_and_monotonic() {
        let e = engine();
        let mut prev = f64::MIN;
        for i in -200..=200 {
            let s = i as f64 * 25.0;
            let v = e.normalize(s);
            assert!((0.0..=100.0).contains(&v), "normalize({}) = {}", s, v);
            assert!(v >= prev, "normalize must not decrease at {}", s);
            prev = v;
        }
        assert_eq!(e.normalize(0.0), 50.0);
        assert_eq!(e.normalize(1e9), 100.0);
        assert_eq!(e.normalize(-1e9), 0.0);
    }

    #[test]
    fn test_end_to_end_expansion_score() {
        let db = test_db();
        seed(&db);
        let e = engine();

        let scores = e.score_account_at(&db, "acme", now()).unwrap();
        let expansion = scores.get(ScoreType::Expansion).unwrap();

        let expected = 50.0 + 50.0 * (45.0_f64 / 100.0).tanh();
        assert!((expansion.value - expected).abs() < 1e-9, "got {}", expansion.value);
        assert!((expansion.value - 71.095).abs() < 0.01);
        assert_eq!(expansion.fit_multiplier, 1.5);

        let component_total: f64 = expansion.component_scores.values().sum();
        assert!((component_total - 45.0).abs() < 1e-9);
        assert_eq!(expansion.component_scores.len(), 3);

        // no churn signals: churn risk sits on the midpoint
        assert_eq!(scores.get(ScoreType::ChurnRisk).unwrap().value, 50.0);

        let health = db.require_account("acme").unwrap().health_score.unwrap();
        assert!((health - scores.get(ScoreType::Health).unwrap().value).abs() < 1e-9);
    }

    #[test]
    fn test_expansion_opportunity_and_cooldown() {
        let db = test_db();
        seed(&db);
        let e = engine();

        let first = e.score_account_at(&db, "acme", now()).unwrap();
        assert_eq!(first.opportunities.len(), 1);
        let opp = &first.opportunities[0];
        assert_eq!(opp.opportunity_type, ScoreType::Expansion);
        assert!((opp.value - 20_000.0).abs() < 1e-6);

        let second = e.score_account_at(&db, "acme", now() + Duration::days(2)).unwrap();
        assert!(second.opportunities.is_empty());
        assert_eq!(db.get_opportunities_for_account("acme").unwrap().len(), 1);

        let later = e.score_account_at(&db, "acme", now() + Duration::days(31)).unwrap();
        // signals are a month old by then and decayed below the threshold
        assert!(later.opportunities.is_empty());
    }

    fn seed_churn(db: &AccountDb) {
        for (i, name) in ["inactivity", "payment_failure", "champion_departure"].iter().enumerate() {
            db.insert_signal(&signal(&format!("c{}", i), name, SignalCategory::ChurnRisk, 0))
                .unwrap();
        }
    }

    #[test]
    fn test_churn_risk_opportunity_value() {
        let db = test_db();
        let mut acct = sample_account("acme", now());
        acct.fit_score = Some(0.9);
        db.upsert_account(&acct).unwrap();
        seed_churn(&db);
        let e = engine();

        let scores = e.score_account_at(&db, "acme", now()).unwrap();
        // 66 raw x 1.5 fit = 99
        let churn = scores.get(ScoreType::ChurnRisk).unwrap();
        let expected = 50.0 + 50.0 * (99.0_f64 / 100.0).tanh();
        assert!((churn.value - expected).abs() < 1e-9, "got {}", churn.value);
        assert!(churn.value >= e.config().thresholds.churn_risk);

        assert_eq!(scores.opportunities.len(), 1);
        let opp = &scores.opportunities[0];
        assert_eq!(opp.opportunity_type, ScoreType::ChurnRisk);
        let multiplier = e.config().opportunity_generation.churn_risk_value_multiplier;
        assert!((opp.value - 100_000.0 * multiplier).abs() < 1e-6);
        assert!((opp.score - churn.value).abs() < 1e-9);
    }

    #[test]
    fn test_cooldown_spans_opportunity_types() {
        let db = test_db();
        seed(&db);
        seed_churn(&db);
        let e = engine();

        // both thresholds cross; expansion is scored first and claims the cooldown
        let first = e.score_account_at(&db, "acme", now()).unwrap();
        assert!(first.get(ScoreType::Expansion).unwrap().value >= e.config().thresholds.expansion);
        assert!(first.get(ScoreType::ChurnRisk).unwrap().value >= e.config().thresholds.churn_risk);
        assert_eq!(first.opportunities.len(), 1);
        assert_eq!(first.opportunities[0].opportunity_type, ScoreType::Expansion);

        let second = e.score_account_at(&db, "acme", now() + Duration::hours(1)).unwrap();
        assert!(second.get(ScoreType::ChurnRisk).unwrap().value >= e.config().thresholds.churn_risk);
        assert!(second.opportunities.is_empty());
        assert_eq!(db.get_opportunities_for_account("acme").unwrap().len(), 1);
    }

    #[test]
    fn test_category_filter_and_churn_abs_weight() {
        let e = engine();
        let signals = vec![
            signal("a", "usage_spike", SignalCategory::Expansion, 0),
            signal("b", "inactivity", SignalCategory::ChurnRisk, 0),
        ];
        let churn = e.compute_score(&signals, ScoreType::ChurnRisk, 1.0, now());
        assert_eq!(churn.signal_count, 1);
        assert_eq!(churn.raw_sum, 20.0);

        let health = e.compute_score(&signals, ScoreType::Health, 1.0, now());
        assert_eq!(health.signal_count, 2);
        assert_eq!(health.raw_sum, 10.0 - 20.0);
        assert!(health.value < 50.0);
    }

    #[test]
    fn test_old_and_unknown_signals_ignored() {
        let e = engine();
        let signals = vec![
            signal("a", "usage_spike", SignalCategory::Expansion, 120),
            signal("b", "mystery", SignalCategory::Expansion, 0),
        ];
        let result = e.compute_score(&signals, ScoreType::Expansion, 1.0, now());
        assert_eq!(result.signal_count, 0);
        assert!(result.component_scores.is_empty());
    }

    #[test]
    fn test_decay_reduces_contribution() {
        let e = engine();
        let half_life = e.config().recency_decay_days as i64;
        let signals = vec![signal("a", "usage_spike", SignalCategory::Expansion, half_life)];
        let result = e.compute_score(&signals, ScoreType::Expansion, 1.0, now());
        assert!((result.raw_sum - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_fit_score_computed_on_the_fly() {
        let e = engine();
        let mut acct = sample_account("acme", now());
        acct.fit_score = None;
        acct.industry = Some("Retail".into());
        acct.region = Some("APAC".into());
        acct.employee_count = Some(5);
        // 0.0 + 0.05 + 0.25 + 0.06 = 0.36
        assert_eq!(e.fit_multiplier_for(&acct), 0.6);
    }

    #[test]
    fn test_freshness_and_run_all() {
        let db = test_db();
        seed(&db);
        db.upsert_account(&sample_account("globex", now())).unwrap();
        let e = engine();

        let summary = e.run_all_accounts_at(&db, now()).unwrap();
        assert_eq!(summary.accounts_scored, 2);
        assert_eq!(summary.accounts_failed, 0);

        let latest = e.latest_score(&db, "acme", ScoreType::Health).unwrap().unwrap();
        assert!(is_score_fresh(&latest, now() + Duration::hours(1)));
        assert!(!is_score_fresh(&latest, now() + Duration::hours(25)));
        assert_eq!(e.score_history(&db, "acme", ScoreType::Health, 5).unwrap().len(), 1);
    }
}
