//! Account signal detection, heuristic scoring, and rate-limited CRM sync.
//!
//! Detectors turn raw product activity into typed signals; the heuristics
//! engine decays and weights those signals into expansion, churn-risk and
//! health scores; the sync pipeline pushes analytics-sourced composites into
//! an external CRM under per-integration request budgets.

pub mod db;
pub mod error;
pub mod migrations;
pub mod presets;
pub mod scoring;
pub mod signals;
pub mod sync;
pub mod util;
