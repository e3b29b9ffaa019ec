//! The detector catalogue.
//!
//! Each rule is a plain function that queries account, user, event and
//! score history and returns a `Detection` when its condition holds. Rules
//! only read; persistence and dedup live in `SignalDetector::detect_at`.

use std::sync::OnceLock;

use chrono::Duration;
use regex::Regex;

use super::detector::{Detection, DetectorRegistry, RuleContext, RuleDetector, RuleFn};
use crate::db::{AccountDb, DbAccount, DbError, ScoreType, SignalCategory};
use crate::presets::HeuristicsConfig;
use crate::util::{age_days, parse_date, parse_ts, ts};

/// Every known detector: `(signal_type, category, rule)`.
pub const CATALOGUE: &[(&str, SignalCategory, RuleFn)] = &[
    // Expansion
    ("usage_spike", SignalCategory::Expansion, usage_spike),
    ("seat_utilization_high", SignalCategory::Expansion, seat_utilization_high),
    ("team_growth", SignalCategory::Expansion, team_growth),
    ("decision_maker_engaged", SignalCategory::Expansion, decision_maker_engaged),
    ("feature_adoption", SignalCategory::Expansion, feature_adoption),
    ("power_user", SignalCategory::Expansion, power_user),
    ("pricing_page_interest", SignalCategory::Expansion, pricing_page_interest),
    ("upgrade_intent", SignalCategory::Expansion, upgrade_intent),
    ("integration_adoption", SignalCategory::Expansion, integration_adoption),
    ("trial_conversion_ready", SignalCategory::Expansion, trial_conversion_ready),
    // Churn risk
    ("usage_drop", SignalCategory::ChurnRisk, usage_drop),
    ("inactivity", SignalCategory::ChurnRisk, inactivity),
    ("seat_utilization_low", SignalCategory::ChurnRisk, seat_utilization_low),
    ("renewal_at_risk", SignalCategory::ChurnRisk, renewal_at_risk),
    ("payment_failure", SignalCategory::ChurnRisk, payment_failure),
    ("health_decline", SignalCategory::ChurnRisk, health_decline),
    ("champion_departure", SignalCategory::ChurnRisk, champion_departure),
    ("support_escalation", SignalCategory::ChurnRisk, support_escalation),
    ("downgrade_intent", SignalCategory::ChurnRisk, downgrade_intent),
    ("trial_expiring_unengaged", SignalCategory::ChurnRisk, trial_expiring_unengaged),
];

/// Build the registry for a config. Signal types that are missing from the
/// config or disabled are not registered.
pub fn default_registry(config: &HeuristicsConfig) -> DetectorRegistry {
    let mut registry = DetectorRegistry::new();
    for (signal_type, category, rule) in CATALOGUE {
        let Some(signal_cfg) = config.signals.get(*signal_type) else {
            log::debug!("No config for detector {}; skipping", signal_type);
            continue;
        };
        if !signal_cfg.enabled {
            continue;
        }
        if signal_cfg.category != *category {
            log::warn!(
                "Detector {} is {} but preset says {}; using {}",
                signal_type,
                category,
                signal_cfg.category,
                category
            );
        }
        registry.register(Box::new(RuleDetector::new(
            signal_type,
            *category,
            signal_cfg.clone(),
            *rule,
        )));
    }
    registry
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Senior buyer titles. Matched case-insensitively against `users.title`.
fn decision_maker_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(chief|c[etfoi]o|vp|vice president|head of|director|founder|owner|president)\b").ok()
    })
    .as_ref()
}

fn is_decision_maker(title: Option<&str>) -> bool {
    match (title, decision_maker_re()) {
        (Some(t), Some(re)) => re.is_match(t),
        _ => false,
    }
}

/// Count events of the given types in `[window_start, now]`.
fn events_in_window(
    db: &AccountDb,
    account_id: &str,
    ctx: &RuleContext<'_>,
    event_types: &[&str],
) -> Result<i64, DbError> {
    db.count_events_of_types(
        account_id,
        event_types,
        &ts(ctx.window_start()),
        &ts(ctx.now + Duration::microseconds(1)),
    )
}

/// Total events in the current and the preceding window, from snapshots.
fn usage_windows(db: &AccountDb, account_id: &str, ctx: &RuleContext<'_>) -> Result<(f64, f64), DbError> {
    let today = ctx.now.date_naive();
    let w = ctx.window_days().max(1);
    let day = |offset: i64| (today - Duration::days(offset)).to_string();

    let current = db.sum_metric(account_id, "total_events", &day(w - 1), &day(0))?;
    let previous = db.sum_metric(account_id, "total_events", &day(2 * w - 1), &day(w))?;
    Ok((current, previous))
}

fn active_seat_ratio(
    db: &AccountDb,
    account: &DbAccount,
    ctx: &RuleContext<'_>,
) -> Result<Option<(f64, i64, i64)>, DbError> {
    let seats = match account.seats_purchased {
        Some(s) if s > 0 => s,
        _ => return Ok(None),
    };
    let active = db.count_active_users_since(&account.id, &ts(ctx.window_start()))?;
    Ok(Some((active as f64 / seats as f64, active, seats)))
}

/// Days until a trial ends, if the account is on a trial ending inside the window.
fn trial_days_left(account: &DbAccount, ctx: &RuleContext<'_>) -> Option<i64> {
    if account.plan != "trial" {
        return None;
    }
    let ends = account.trial_ends_at.as_deref().and_then(parse_date)?;
    let left = (ends - ctx.now.date_naive()).num_days();
    (0..=ctx.window_days()).contains(&left).then_some(left)
}

fn event_count_rule(
    db: &AccountDb,
    account: &DbAccount,
    ctx: &RuleContext<'_>,
    event_types: &[&str],
) -> Result<Option<Detection>, DbError> {
    let count = events_in_window(db, &account.id, ctx, event_types)?;
    if count > 0 && count as f64 >= ctx.threshold() {
        return Ok(Some(
            Detection::new(count as f64)
                .with("event_count", count)
                .with("event_types", event_types)
                .with("window_days", ctx.window_days()),
        ));
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Expansion
// ---------------------------------------------------------------------------

/// Total usage up at least `threshold` percent on the previous window.
pub fn usage_spike(db: &AccountDb, account: &DbAccount, ctx: &RuleContext<'_>) -> Result<Option<Detection>, DbError> {
    let (current, previous) = usage_windows(db, &account.id, ctx)?;
    if previous <= 0.0 {
        return Ok(None);
    }
    let pct = (current - previous) / previous * 100.0;
    if pct >= ctx.threshold() {
        return Ok(Some(
            Detection::new(pct)
                .with("current_events", current)
                .with("previous_events", previous)
                .with("pct_change", pct),
        ));
    }
    Ok(None)
}

/// Active users fill at least `threshold` of purchased seats.
pub fn seat_utilization_high(
    db: &AccountDb,
    account: &DbAccount,
    ctx: &RuleContext<'_>,
) -> Result<Option<Detection>, DbError> {
    let Some((ratio, active, seats)) = active_seat_ratio(db, account, ctx)? else {
        return Ok(None);
    };
    if ratio >= ctx.threshold() {
        return Ok(Some(
            Detection::new(ratio)
                .with("active_users", active)
                .with("seats_purchased", seats)
                .with("utilization", ratio),
        ));
    }
    Ok(None)
}

/// At least `threshold` users added inside the window.
pub fn team_growth(db: &AccountDb, account: &DbAccount, ctx: &RuleContext<'_>) -> Result<Option<Detection>, DbError> {
    let added = db.count_users_created_between(
        &account.id,
        &ts(ctx.window_start()),
        &ts(ctx.now + Duration::microseconds(1)),
    )?;
    if added > 0 && added as f64 >= ctx.threshold() {
        return Ok(Some(Detection::new(added as f64).with("users_added", added)));
    }
    Ok(None)
}

/// Senior buyers active inside the window.
pub fn decision_maker_engaged(
    db: &AccountDb,
    account: &DbAccount,
    ctx: &RuleContext<'_>,
) -> Result<Option<Detection>, DbError> {
    let since = ts(ctx.window_start());
    let engaged: Vec<_> = db
        .get_users_for_account(&account.id)?
        .into_iter()
        .filter(|u| u.status == "active")
        .filter(|u| u.last_seen_at.as_deref().is_some_and(|seen| seen >= since.as_str()))
        .filter(|u| is_decision_maker(u.title.as_deref()))
        .collect();

    if !engaged.is_empty() && engaged.len() as f64 >= ctx.threshold() {
        let titles: Vec<String> = engaged.iter().filter_map(|u| u.title.clone()).collect();
        return Ok(Some(
            Detection::new(engaged.len() as f64)
                .with("decision_makers", engaged.len())
                .with("titles", titles),
        ));
    }
    Ok(None)
}

/// Breadth of `feature:*` events used inside the window.
pub fn feature_adoption(
    db: &AccountDb,
    account: &DbAccount,
    ctx: &RuleContext<'_>,
) -> Result<Option<Detection>, DbError> {
    let features = db.distinct_event_types_with_prefix(
        &account.id,
        "feature:",
        &ts(ctx.window_start()),
        &ts(ctx.now + Duration::microseconds(1)),
    )?;
    if !features.is_empty() && features.len() as f64 >= ctx.threshold() {
        return Ok(Some(
            Detection::new(features.len() as f64)
                .with("features_used", features.len())
                .with("features", features),
        ));
    }
    Ok(None)
}

/// One user generating at least `threshold` events inside the window.
pub fn power_user(db: &AccountDb, account: &DbAccount, ctx: &RuleContext<'_>) -> Result<Option<Detection>, DbError> {
    let top = db.top_user_by_events(
        &account.id,
        &ts(ctx.window_start()),
        &ts(ctx.now + Duration::microseconds(1)),
    )?;
    match top {
        Some((user_id, count)) if count as f64 >= ctx.threshold() => Ok(Some(
            Detection::new(count as f64)
                .with("user_id", user_id)
                .with("event_count", count),
        )),
        _ => Ok(None),
    }
}

pub fn pricing_page_interest(
    db: &AccountDb,
    account: &DbAccount,
    ctx: &RuleContext<'_>,
) -> Result<Option<Detection>, DbError> {
    event_count_rule(db, account, ctx, &["pricing_page_view"])
}

pub fn upgrade_intent(db: &AccountDb, account: &DbAccount, ctx: &RuleContext<'_>) -> Result<Option<Detection>, DbError> {
    event_count_rule(
        db,
        account,
        ctx,
        &["upgrade_clicked", "plan_limit_reached", "contact_sales_submitted"],
    )
}

pub fn integration_adoption(
    db: &AccountDb,
    account: &DbAccount,
    ctx: &RuleContext<'_>,
) -> Result<Option<Detection>, DbError> {
    event_count_rule(db, account, ctx, &["integration_connected"])
}

/// Trial ending soon with at least `threshold` events in the window.
pub fn trial_conversion_ready(
    db: &AccountDb,
    account: &DbAccount,
    ctx: &RuleContext<'_>,
) -> Result<Option<Detection>, DbError> {
    let Some(days_left) = trial_days_left(account, ctx) else {
        return Ok(None);
    };
    let (current, _) = usage_windows(db, &account.id, ctx)?;
    if current >= ctx.threshold() {
        return Ok(Some(
            Detection::new(current)
                .with("trial_days_left", days_left)
                .with("recent_events", current),
        ));
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Churn risk
// ---------------------------------------------------------------------------

/// Total usage down at least `threshold` percent on the previous window.
pub fn usage_drop(db: &AccountDb, account: &DbAccount, ctx: &RuleContext<'_>) -> Result<Option<Detection>, DbError> {
    let (current, previous) = usage_windows(db, &account.id, ctx)?;
    if previous <= 0.0 {
        return Ok(None);
    }
    let drop_pct = (previous - current) / previous * 100.0;
    if drop_pct >= ctx.threshold() {
        return Ok(Some(
            Detection::new(drop_pct)
                .with("current_events", current)
                .with("previous_events", previous)
                .with("pct_change", -drop_pct),
        ));
    }
    Ok(None)
}

/// No activity for at least `threshold` days.
pub fn inactivity(_db: &AccountDb, account: &DbAccount, ctx: &RuleContext<'_>) -> Result<Option<Detection>, DbError> {
    if account.status == "churned" {
        return Ok(None);
    }
    let last = account
        .last_activity_at
        .as_deref()
        .or(Some(account.created_at.as_str()))
        .and_then(parse_ts);
    let Some(last) = last else {
        return Ok(None);
    };
    let idle_days = age_days(last, ctx.now);
    if idle_days >= ctx.threshold() {
        return Ok(Some(
            Detection::new(idle_days.floor())
                .with("days_inactive", idle_days.floor() as i64)
                .with("last_activity_at", ts(last)),
        ));
    }
    Ok(None)
}

/// Active users fill no more than `threshold` of purchased seats.
pub fn seat_utilization_low(
    db: &AccountDb,
    account: &DbAccount,
    ctx: &RuleContext<'_>,
) -> Result<Option<Detection>, DbError> {
    let Some((ratio, active, seats)) = active_seat_ratio(db, account, ctx)? else {
        return Ok(None);
    };
    if ratio <= ctx.threshold() {
        return Ok(Some(
            Detection::new(ratio)
                .with("active_users", active)
                .with("seats_purchased", seats)
                .with("utilization", ratio),
        ));
    }
    Ok(None)
}

/// Renewal inside the window while health sits below `threshold`.
pub fn renewal_at_risk(
    _db: &AccountDb,
    account: &DbAccount,
    ctx: &RuleContext<'_>,
) -> Result<Option<Detection>, DbError> {
    let (Some(renewal), Some(health)) = (
        account.renewal_date.as_deref().and_then(parse_date),
        account.health_score,
    ) else {
        return Ok(None);
    };
    let days_until = (renewal - ctx.now.date_naive()).num_days();
    if (0..=ctx.window_days()).contains(&days_until) && health < ctx.threshold() {
        return Ok(Some(
            Detection::new(days_until as f64)
                .with("days_until_renewal", days_until)
                .with("renewal_date", renewal.to_string())
                .with("health_score", health),
        ));
    }
    Ok(None)
}

pub fn payment_failure(db: &AccountDb, account: &DbAccount, ctx: &RuleContext<'_>) -> Result<Option<Detection>, DbError> {
    event_count_rule(db, account, ctx, &["payment_failed", "invoice_payment_failed"])
}

/// Health dropped at least `threshold` points from its peak inside the window.
pub fn health_decline(db: &AccountDb, account: &DbAccount, ctx: &RuleContext<'_>) -> Result<Option<Detection>, DbError> {
    let since = ts(ctx.window_start());
    let history: Vec<_> = db
        .get_score_history(&account.id, ScoreType::Health, 100)?
        .into_iter()
        .filter(|s| s.calculated_at >= since)
        .collect();
    let Some(latest) = history.first() else {
        return Ok(None);
    };
    let peak = history.iter().map(|s| s.value).fold(f64::MIN, f64::max);
    let decline = peak - latest.value;
    if decline > 0.0 && decline >= ctx.threshold() {
        return Ok(Some(
            Detection::new(decline)
                .with("peak_score", peak)
                .with("current_score", latest.value)
                .with("decline", decline),
        ));
    }
    Ok(None)
}

/// Senior users deactivated inside the window.
pub fn champion_departure(
    db: &AccountDb,
    account: &DbAccount,
    ctx: &RuleContext<'_>,
) -> Result<Option<Detection>, DbError> {
    let since = ts(ctx.window_start());
    let departed: Vec<_> = db
        .get_users_for_account(&account.id)?
        .into_iter()
        .filter(|u| u.deactivated_at.as_deref().is_some_and(|at| at >= since.as_str()))
        .filter(|u| is_decision_maker(u.title.as_deref()))
        .collect();

    if !departed.is_empty() && departed.len() as f64 >= ctx.threshold() {
        let ids: Vec<String> = departed.iter().map(|u| u.id.clone()).collect();
        return Ok(Some(
            Detection::new(departed.len() as f64)
                .with("departed_users", ids)
                .with("count", departed.len()),
        ));
    }
    Ok(None)
}

pub fn support_escalation(
    db: &AccountDb,
    account: &DbAccount,
    ctx: &RuleContext<'_>,
) -> Result<Option<Detection>, DbError> {
    event_count_rule(db, account, ctx, &["support_ticket_escalated"])
}

pub fn downgrade_intent(db: &AccountDb, account: &DbAccount, ctx: &RuleContext<'_>) -> Result<Option<Detection>, DbError> {
    event_count_rule(
        db,
        account,
        ctx,
        &["downgrade_clicked", "cancellation_page_view", "plan_downgraded"],
    )
}

/// Trial ending soon with fewer than `threshold` events in the window.
pub fn trial_expiring_unengaged(
    db: &AccountDb,
    account: &DbAccount,
    ctx: &RuleContext<'_>,
) -> Result<Option<Detection>, DbError> {
    let Some(days_left) = trial_days_left(account, ctx) else {
        return Ok(None);
    };
    let (current, _) = usage_windows(db, &account.id, ctx)?;
    if current < ctx.threshold() {
        return Ok(Some(
            Detection::new(days_left as f64)
                .with("trial_days_left", days_left)
                .with("recent_events", current),
        ));
    }
    Ok(None)
}
