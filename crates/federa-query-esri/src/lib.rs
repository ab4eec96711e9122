//! ArcGIS REST backend for federa-query
//!
//! Serves the layers and tables of a MapServer or FeatureServer as feature
//! types. Layer info is read lazily; queries are paged by the service's
//! record limit, multi geometry filters are split into one request per
//! part, and token authentication is renewed once on expiry.

mod client;
mod config;
mod geometry;
mod metadata;
mod response;
mod source;
mod sql;

use federa_query::{ConnectionConfig, DatasourceFactory, FeatureSource, Result};
use std::sync::Arc;

pub use client::{EsriPage, EsriQueryClient, Params};
pub use config::{EsriAuth, EsriConfig, ServiceKind, DEFAULT_REQUEST_LIMIT};
pub use geometry::{from_esri, to_esri};
pub use metadata::{descriptor_from_layer, feature_type_name, LayerEntry};
pub use response::{EsriError, LayerInfo, ServiceInfo};
pub use source::EsriSource;
pub use sql::where_clause;

/// Factory for the `esri` backend
#[derive(Debug, Default, Clone, Copy)]
pub struct EsriSourceFactory;

impl DatasourceFactory for EsriSourceFactory {
    fn backend_type(&self) -> &'static str {
        "esri"
    }

    fn create_source(&self, config: &ConnectionConfig) -> Result<Arc<dyn FeatureSource>> {
        Ok(Arc::new(EsriSource::new(config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use federa_query::{DataError, DatasourceRegistry, RegistryContext};
    use serde_json::json;

    #[tokio::test]
    async fn test_factory_registration() {
        let registry = DatasourceRegistry::new(RegistryContext::default());
        registry.register_factory(Arc::new(EsriSourceFactory)).await;

        let ds = registry
            .create_datasource(ConnectionConfig::new(
                "assets",
                "esri",
                "https://gis.example.com/arcgis/rest/services/Assets/FeatureServer/",
            ))
            .await
            .unwrap();
        let source = ds.source_as::<EsriSource>().unwrap();
        assert_eq!(source.service_kind(), ServiceKind::FeatureServer);
        assert!(!source.client().uses_token());
    }

    #[test]
    fn test_token_auth_needs_token_url() {
        let config = ConnectionConfig::new("assets", "esri", "https://gis.example.com/services/Assets")
            .with_credentials("gis", "secret")
            .with_options(json!({"auth": "token"}));
        assert!(matches!(
            EsriSourceFactory.create_source(&config),
            Err(DataError::InvalidConfiguration(_))
        ));
    }
}
