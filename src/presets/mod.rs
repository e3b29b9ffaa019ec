//! Heuristics presets: the weights, thresholds and global scoring knobs.
//!
//! Presets ship embedded in the binary as JSON. A custom preset file can be
//! loaded instead; either way the result is validated before an engine uses it.

pub mod embedded;
pub mod loader;
pub mod schema;

pub use loader::{available_presets, load_custom_preset, load_default_preset, load_preset, validate_config};
pub use schema::{HeuristicsConfig, SignalConfig};
