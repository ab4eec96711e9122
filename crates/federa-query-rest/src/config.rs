use serde::{Deserialize, Serialize};

/// Backend options of a REST datasource (`options` in the connection config)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestConfig {
    /// Delta (versioned working copy) to read and write in from the start
    #[serde(default)]
    pub delta: Option<String>,
    /// Limit applied to feature queries that do not set one
    #[serde(default)]
    pub default_limit: Option<usize>,
    /// Feature types offered by point and box selection; empty means all
    #[serde(default)]
    pub selectable_types: Vec<String>,
}
