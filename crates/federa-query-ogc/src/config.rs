use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub const DEFAULT_OUTPUT_FORMAT: &str = "application/json";
pub const DEFAULT_SRS: &str = "EPSG:4326";

/// WFS protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WfsVersion {
    #[serde(rename = "1.0.0")]
    V1_0_0,
    #[default]
    #[serde(rename = "1.1.0")]
    V1_1_0,
    #[serde(rename = "2.0.0")]
    V2_0_0,
}

impl WfsVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            WfsVersion::V1_0_0 => "1.0.0",
            WfsVersion::V1_1_0 => "1.1.0",
            WfsVersion::V2_0_0 => "2.0.0",
        }
    }

    /// Parameter limiting the number of returned features
    pub fn count_param(&self) -> &'static str {
        match self {
            WfsVersion::V2_0_0 => "count",
            _ => "maxFeatures",
        }
    }

    pub fn type_param(&self) -> &'static str {
        match self {
            WfsVersion::V2_0_0 => "typeNames",
            _ => "typeName",
        }
    }

    pub fn id_param(&self) -> &'static str {
        match self {
            WfsVersion::V2_0_0 => "resourceId",
            _ => "featureID",
        }
    }

    /// `startIndex` paging exists from 1.1.0 upwards
    pub fn supports_paging(&self) -> bool {
        !matches!(self, WfsVersion::V1_0_0)
    }

    /// A `<BBOX>` can be combined with other filter predicates
    pub fn supports_bbox_filter(&self) -> bool {
        !matches!(self, WfsVersion::V1_0_0)
    }

    pub fn filter_prefix(&self) -> &'static str {
        match self {
            WfsVersion::V2_0_0 => "fes",
            _ => "ogc",
        }
    }

    pub fn filter_namespace(&self) -> &'static str {
        match self {
            WfsVersion::V2_0_0 => "http://www.opengis.net/fes/2.0",
            _ => "http://www.opengis.net/ogc",
        }
    }

    /// Element naming the property a predicate applies to
    pub fn property_element(&self) -> &'static str {
        match self {
            WfsVersion::V2_0_0 => "fes:ValueReference",
            _ => "ogc:PropertyName",
        }
    }

    /// Attribute of a `resultType=hits` response carrying the count
    pub fn hits_attribute(&self) -> &'static str {
        match self {
            WfsVersion::V2_0_0 => "numberMatched",
            _ => "numberOfFeatures",
        }
    }

    pub fn sort_suffix(&self, descending: bool) -> &'static str {
        match (self, descending) {
            (WfsVersion::V2_0_0, false) => "ASC",
            (WfsVersion::V2_0_0, true) => "DESC",
            (_, false) => "A",
            (_, true) => "D",
        }
    }
}

impl fmt::Display for WfsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend options of an OGC datasource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OgcConfig {
    /// WFS endpoint; the connection URL when absent
    pub wfs_url: Option<String>,
    /// WMS endpoint; no WMS when absent
    pub wms_url: Option<String>,
    pub version: WfsVersion,
    pub wms_version: String,
    pub output_format: String,
    pub srs: String,
    /// Feature types served; read from GetCapabilities when empty
    pub feature_types: Vec<String>,
    /// Property holding the feature key; the WFS feature id when absent
    pub key_field: Option<String>,
    /// Geometry property used in `<BBOX>` filters when the schema has none
    pub geometry_field: Option<String>,
    /// Properties matched by free text search, per feature type
    pub search_fields: HashMap<String, Vec<String>>,
    /// WMS layer per feature type; the type name when absent
    pub wms_layers: HashMap<String, String>,
    pub default_limit: Option<usize>,
}

impl Default for OgcConfig {
    fn default() -> Self {
        Self {
            wfs_url: None,
            wms_url: None,
            version: WfsVersion::default(),
            wms_version: "1.3.0".to_string(),
            output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
            srs: DEFAULT_SRS.to_string(),
            feature_types: Vec::new(),
            key_field: None,
            geometry_field: None,
            search_fields: HashMap::new(),
            wms_layers: HashMap::new(),
            default_limit: None,
        }
    }
}
