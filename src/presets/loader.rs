use super::embedded;
use super::schema::HeuristicsConfig;

/// Load an embedded preset by ID.
pub fn load_preset(id: &str) -> Result<HeuristicsConfig, String> {
    if let Some(json) = embedded::get_embedded(id) {
        return serde_json::from_str(json)
            .map_err(|e| format!("Failed to parse embedded preset '{}': {}", id, e));
    }
    Err(format!("Unknown heuristics preset: {}", id))
}

/// Load the default embedded preset.
pub fn load_default_preset() -> Result<HeuristicsConfig, String> {
    load_preset(embedded::DEFAULT_PRESET)
}

/// Load a custom preset from a file path.
pub fn load_custom_preset(path: &std::path::Path) -> Result<HeuristicsConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read preset file: {}", e))?;
    let config: HeuristicsConfig =
        serde_json::from_str(&content).map_err(|e| format!("Failed to parse preset: {}", e))?;
    validate_config(&config)?;
    Ok(config)
}

/// Validate a config has sane ranges before an engine is built from it.
pub fn validate_config(config: &HeuristicsConfig) -> Result<(), String> {
    if config.id.is_empty() {
        return Err("Preset id is required".into());
    }
    if config.scale.min >= config.scale.max {
        return Err(format!(
            "Scale min ({}) must be below max ({})",
            config.scale.min, config.scale.max
        ));
    }
    if config.recency_decay_days <= 0.0 {
        return Err("recencyDecayDays must be positive".into());
    }
    if config.max_signal_age_days <= 0 {
        return Err("maxSignalAgeDays must be positive".into());
    }

    let m = &config.fit_multipliers;
    if m.icp_match <= 0.0 || m.near_icp <= 0.0 || m.poor_fit <= 0.0 {
        return Err("Fit multipliers must be positive".into());
    }

    let w = &config.fit_scoring.weights;
    if [w.industry, w.employees, w.revenue, w.region].iter().any(|v| *v < 0.0) {
        return Err("Fit weights must not be negative".into());
    }
    if w.total() <= 0.0 {
        return Err("At least one fit weight must be non-zero".into());
    }

    for (signal_type, signal) in &config.signals {
        if signal.time_window_days <= 0 {
            return Err(format!("Signal '{}' needs a positive timeWindowDays", signal_type));
        }
        if signal.dedup_window_days() < 0 {
            return Err(format!("Signal '{}' has a negative dedupDays", signal_type));
        }
    }
    Ok(())
}

/// List all available embedded presets as (id, name, description).
pub fn available_presets() -> Vec<(String, String, String)> {
    embedded::list_embedded()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_preset_default() {
        let preset = load_default_preset().expect("should load default preset");
        assert_eq!(preset.id, "b2b-saas");
    }

    #[test]
    fn test_load_preset_unknown() {
        let result = load_preset("nonexistent");
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("Unknown heuristics preset"));
    }

    #[test]
    fn test_validate_rejects_inverted_scale() {
        let mut preset = load_default_preset().unwrap();
        preset.scale.min = 100.0;
        preset.scale.max = 0.0;
        assert!(validate_config(&preset).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_half_life() {
        let mut preset = load_default_preset().unwrap();
        preset.recency_decay_days = 0.0;
        assert!(validate_config(&preset).is_err());
    }

    #[test]
    fn test_validate_rejects_all_zero_fit_weights() {
        let mut preset = load_default_preset().unwrap();
        preset.fit_scoring.weights.industry = 0.0;
        preset.fit_scoring.weights.employees = 0.0;
        preset.fit_scoring.weights.revenue = 0.0;
        preset.fit_scoring.weights.region = 0.0;
        assert!(validate_config(&preset).is_err());
    }

    #[test]
    fn test_custom_preset_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.json");
        let mut preset = load_default_preset().unwrap();
        preset.id = "custom".to_string();
        std::fs::write(&path, serde_json::to_string(&preset).unwrap()).unwrap();

        let loaded = load_custom_preset(&path).expect("custom preset loads");
        assert_eq!(loaded.id, "custom");
        assert_eq!(loaded.signals.len(), preset.signals.len());
    }

    #[test]
    fn test_all_presets_load_and_validate() {
        let presets = available_presets();
        assert_eq!(presets.len(), 2);
        for (id, name, desc) in presets {
            let preset = load_preset(&id).unwrap_or_else(|e| panic!("Failed to load '{}': {}", id, e));
            validate_config(&preset).unwrap_or_else(|e| panic!("Validation failed for '{}': {}", id, e));
            assert!(!name.is_empty(), "preset '{}' should have a name", id);
            assert!(!desc.is_empty(), "preset '{}' should have a description", id);
            assert_eq!(preset.signals.len(), 20, "preset '{}' should cover every detector", id);
        }
    }
}
