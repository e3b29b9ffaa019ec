//! Signal detection.
//!
//! Raw events become daily metric snapshots; a registry of independent
//! detectors inspects each account and persists typed, immutable signals
//! that the heuristics engine later decays and aggregates.

pub mod decay;
pub mod detector;
pub mod detectors;
pub mod processor;

pub use detector::{Detection, DetectorRegistry, SignalDetector};
pub use processor::{ProcessingSummary, RawEvent, SignalProcessor};
