use serde::{Deserialize, Serialize};

pub const DEFAULT_REQUEST_LIMIT: usize = 1000;

/// How requests to the service are authenticated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EsriAuth {
    #[default]
    None,
    /// Token from `generateToken`, sent as the `token` parameter
    Token,
    /// Credentials handled below the service (web tier basic auth, cookies)
    Transparent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceKind {
    MapServer,
    FeatureServer,
}

impl ServiceKind {
    /// Kind named by the last segment of a service URL
    pub fn from_url(url: &str) -> Option<Self> {
        let last = url.trim_end_matches('/').rsplit('/').next()?;
        if last.eq_ignore_ascii_case("MapServer") {
            Some(ServiceKind::MapServer)
        } else if last.eq_ignore_ascii_case("FeatureServer") {
            Some(ServiceKind::FeatureServer)
        } else {
            None
        }
    }
}

/// Backend options of an ArcGIS REST datasource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EsriConfig {
    #[serde(default)]
    pub auth: EsriAuth,
    /// `generateToken` endpoint; derived from the service URL when absent
    #[serde(default)]
    pub token_url: Option<String>,
    /// Token lifetime requested from the server, in minutes
    #[serde(default = "default_token_expiration")]
    pub token_expiration: u32,
    /// Maximum features requested per page
    #[serde(default = "default_request_limit")]
    pub request_limit: usize,
    /// Overrides detection from the URL
    #[serde(default)]
    pub service_kind: Option<ServiceKind>,
    /// Layer ids to expose; empty exposes every layer of the service
    #[serde(default)]
    pub layers: Vec<u32>,
}

fn default_request_limit() -> usize {
    DEFAULT_REQUEST_LIMIT
}

fn default_token_expiration() -> u32 {
    60
}

impl Default for EsriConfig {
    fn default() -> Self {
        Self {
            auth: EsriAuth::None,
            token_url: None,
            token_expiration: default_token_expiration(),
            request_limit: DEFAULT_REQUEST_LIMIT,
            service_kind: None,
            layers: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_service_kind_from_url() {
        assert_eq!(
            ServiceKind::from_url("https://gis.example.com/arcgis/rest/services/Network/MapServer/"),
            Some(ServiceKind::MapServer)
        );
        assert_eq!(
            ServiceKind::from_url("https://gis.example.com/arcgis/rest/services/Network/featureserver"),
            Some(ServiceKind::FeatureServer)
        );
        assert_eq!(ServiceKind::from_url("https://gis.example.com/arcgis"), None);
    }

    #[test]
    fn test_defaults_apply_to_partial_options() {
        let config: EsriConfig = serde_json::from_value(json!({"auth": "token"})).unwrap();
        assert_eq!(config.auth, EsriAuth::Token);
        assert_eq!(config.request_limit, 1000);
        assert_eq!(config.token_expiration, 60);
    }
}
