//! Localisation seam for user-facing labels

/// Translates message keys; implementations return `fallback` for unknown keys
pub trait Localiser: Send + Sync {
    fn localise(&self, key: &str, fallback: &str) -> String;
}

/// Returns every fallback unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLocaliser;

impl Localiser for NoopLocaliser {
    fn localise(&self, _key: &str, fallback: &str) -> String {
        fallback.to_string()
    }
}

/// Key for a feature type label
pub fn type_key(datasource: &str, feature_type: &str) -> String {
    format!("{}.{}", datasource, feature_type)
}

/// Key for a field label
pub fn field_key(datasource: &str, feature_type: &str, field: &str) -> String {
    format!("{}.{}.{}", datasource, feature_type, field)
}
