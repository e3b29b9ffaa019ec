//! Account scoring: ICP fit, decayed heuristic scores, and composite
//! routing scores for externally sourced signals.

pub mod composite;
pub mod fit;
pub mod heuristics;

pub use composite::{CompositeScorer, CompositeSignal, ExternalSignal};
pub use fit::{FitBand, FitBreakdown, FitScorer};
pub use heuristics::{is_score_fresh, HeuristicsEngine, ScoreResult};
