const B2B_SAAS_PRESET: &str = include_str!("../../presets/b2b-saas.json");
const PRODUCT_LED_PRESET: &str = include_str!("../../presets/product-led.json");

/// ID of the preset used when none is configured.
pub const DEFAULT_PRESET: &str = "b2b-saas";

/// All embedded presets in display order.
const ALL_PRESETS: &[(&str, &str)] = &[
    ("b2b-saas", B2B_SAAS_PRESET),
    ("product-led", PRODUCT_LED_PRESET),
];

/// Look up an embedded preset by ID.
pub fn get_embedded(id: &str) -> Option<&'static str> {
    ALL_PRESETS
        .iter()
        .find(|(preset_id, _)| *preset_id == id)
        .map(|(_, json)| *json)
}

/// List all embedded presets as (id, name, description).
pub fn list_embedded() -> Vec<(String, String, String)> {
    let mut result = Vec::new();
    for (id, json) in ALL_PRESETS {
        if let Ok(preset) = serde_json::from_str::<super::schema::HeuristicsConfig>(json) {
            result.push((preset.id, preset.name, preset.description));
        } else {
            result.push((id.to_string(), id.to_string(), String::new()));
        }
    }
    result
}
