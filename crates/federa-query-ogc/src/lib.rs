//! OGC WFS / WMS backend for federa-query
//!
//! Features are read with WFS `GetFeature` as GeoJSON, in any of the WFS
//! versions 1.0.0, 1.1.0 and 2.0.0. Clauses become OGC Filter Encoding XML.
//! WMS is used for map tiles and legends only.

mod config;
mod filter;
mod metadata;
mod source;
mod wms;
mod xml;

use federa_query::{ConnectionConfig, DatasourceFactory, FeatureSource, Result};
use std::sync::Arc;

pub use config::{OgcConfig, WfsVersion};
pub use filter::{clause_xml, search_filter, spatial_filter_params};
pub use metadata::{descriptor_from_schema, FEATURE_ID_FIELD};
pub use source::{OgcSource, DEFAULT_TIMEOUT_MS};
pub use wms::{tile_bounds, GetMapRequest, WmsService};
pub use xml::{parse_hits, parse_schema, probe_authenticated, SchemaProperty};

/// Factory for the `ogc` backend
#[derive(Debug, Default, Clone, Copy)]
pub struct OgcSourceFactory;

impl DatasourceFactory for OgcSourceFactory {
    fn backend_type(&self) -> &'static str {
        "ogc"
    }

    fn create_source(&self, config: &ConnectionConfig) -> Result<Arc<dyn FeatureSource>> {
        Ok(Arc::new(OgcSource::new(config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use federa_query::{DatasourceRegistry, RegistryContext};
    use serde_json::json;

    #[tokio::test]
    async fn test_factory_registration() {
        let registry = DatasourceRegistry::new(RegistryContext::default());
        registry.register_factory(Arc::new(OgcSourceFactory)).await;

        let ds = registry
            .create_datasource(
                ConnectionConfig::new("maps", "ogc", "https://maps.example.com/geoserver/ows")
                    .with_options(json!({"version": "2.0.0"})),
            )
            .await
            .unwrap();
        let source = ds.source_as::<OgcSource>().unwrap();
        assert_eq!(source.config().version, WfsVersion::V2_0_0);
        assert_eq!(source.wfs_url(), "https://maps.example.com/geoserver/ows");
    }

    #[test]
    fn test_unknown_version_rejected() {
        let config = ConnectionConfig::new("maps", "ogc", "https://maps.example.com/ows")
            .with_options(json!({"version": "3.0"}));
        assert!(OgcSourceFactory.create_source(&config).is_err());
    }
}
