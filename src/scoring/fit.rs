//! ICP fit scoring from firmographic attributes.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::{AccountDb, DbAccount, DbError};
use crate::presets::schema::{FitMultipliers, FitScoringConfig, HeuristicsConfig, ValueRange};
use crate::util::normalize_key;

/// Sub-score given to a factor the account has no data for.
const UNKNOWN_SCORE: f64 = 0.5;
/// Lowest score an out-of-band employee count or revenue can fall to.
const BAND_FLOOR: f64 = 0.2;
/// Region sub-score when the account is outside every target region.
const REGION_MISS_SCORE: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FitBand {
    IcpMatch,
    NearIcp,
    PoorFit,
}

impl FitBand {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            FitBand::IcpMatch
        } else if score >= 0.5 {
            FitBand::NearIcp
        } else {
            FitBand::PoorFit
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FitBreakdown {
    pub industry: f64,
    pub employees: f64,
    pub revenue: f64,
    pub region: f64,
    pub total: f64,
    pub band: FitBand,
}

#[derive(Debug, Clone)]
pub struct FitScorer {
    config: FitScoringConfig,
    multipliers: FitMultipliers,
}

impl FitScorer {
    pub fn new(config: &HeuristicsConfig) -> Self {
        Self {
            config: config.fit_scoring.clone(),
            multipliers: config.fit_multipliers,
        }
    }

    /// 1.0 when the industry contains a target, 0.0 when it doesn't, 0.5 if unknown.
    /// An empty target list matches everything.
    pub fn industry_score(&self, industry: Option<&str>) -> f64 {
        let Some(industry) = industry.map(normalize_key).filter(|s| !s.is_empty()) else {
            return UNKNOWN_SCORE;
        };
        if self.config.target_industries.is_empty() {
            return 1.0;
        }
        let hit = self
            .config
            .target_industries
            .iter()
            .map(|t| normalize_key(t))
            .any(|t| !t.is_empty() && industry.contains(&t));
        if hit {
            1.0
        } else {
            0.0
        }
    }

    /// 1.0 on a target region, 0.3 elsewhere, 0.5 if unknown.
    pub fn region_score(&self, region: Option<&str>) -> f64 {
        let Some(region) = region.map(normalize_key).filter(|s| !s.is_empty()) else {
            return UNKNOWN_SCORE;
        };
        if self.config.target_regions.is_empty() {
            return 1.0;
        }
        let hit = self
            .config
            .target_regions
            .iter()
            .any(|t| normalize_key(t) == region);
        if hit {
            1.0
        } else {
            REGION_MISS_SCORE
        }
    }

    pub fn score_account(&self, account: &DbAccount) -> FitBreakdown {
        let industry = self.industry_score(account.industry.as_deref());
        let employees = band_score(
            account.employee_count.map(|n| n as f64),
            &self.config.employee_range,
        );
        let revenue = band_score(account.arr, &self.config.revenue_range);
        let region = self.region_score(account.region.as_deref());

        let w = &self.config.weights;
        let total = (industry * w.industry
            + employees * w.employees
            + revenue * w.revenue
            + region * w.region)
            .clamp(0.0, 1.0);

        FitBreakdown {
            industry,
            employees,
            revenue,
            region,
            total,
            band: FitBand::from_score(total),
        }
    }

    /// Multiplier applied to aggregated signal sums for a fit score.
    pub fn get_fit_multiplier(&self, fit_score: f64) -> f64 {
        match FitBand::from_score(fit_score) {
            FitBand::IcpMatch => self.multipliers.icp_match,
            FitBand::NearIcp => self.multipliers.near_icp,
            FitBand::PoorFit => self.multipliers.poor_fit,
        }
    }

    /// Recompute and persist an account's fit score.
    pub fn update_account_fit(&self, db: &AccountDb, account_id: &str) -> Result<FitBreakdown, DbError> {
        self.update_account_fit_at(db, account_id, Utc::now())
    }

    pub fn update_account_fit_at(
        &self,
        db: &AccountDb,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<FitBreakdown, DbError> {
        let account = db.require_account(account_id)?;
        let breakdown = self.score_account(&account);
        db.update_account_fit_score(account_id, breakdown.total, now)?;
        Ok(breakdown)
    }
}

/// 1.0 inside `[min, max]`; ratio-scaled towards `BAND_FLOOR` outside it.
fn band_score(value: Option<f64>, range: &ValueRange) -> f64 {
    let Some(value) = value else {
        return UNKNOWN_SCORE;
    };
    if value >= range.min && value <= range.max {
        return 1.0;
    }
    if value <= 0.0 {
        return BAND_FLOOR;
    }
    let scaled = if value < range.min {
        value / range.min
    } else {
        range.max / value
    };
    scaled.max(BAND_FLOOR)
}
