use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use crate::error::{DataError, Result};
use crate::geometry::{Bounds, Geometry, Position};
use crate::parser::QueryClause;

/// Feature attribute values keyed by field name
pub type Properties = serde_json::Map<String, Value>;

/// Capabilities an adapter can advertise
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Attribute and spatial queries
    Query,
    /// Point and box selection
    Selection,
    /// Free-text search
    Search,
    /// Insert, update and delete
    Edit,
    /// Multi-feature transactions and bulk updates
    Transaction,
    /// Versioned working copies (deltas)
    Versioning,
    /// Network trace and shortest path
    Trace,
    /// Map tile and legend images
    Tiles,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Query => write!(f, "query"),
            Capability::Selection => write!(f, "selection"),
            Capability::Search => write!(f, "search"),
            Capability::Edit => write!(f, "edit"),
            Capability::Transaction => write!(f, "transaction"),
            Capability::Versioning => write!(f, "versioning"),
            Capability::Trace => write!(f, "trace"),
            Capability::Tiles => write!(f, "tiles"),
        }
    }
}

/// Reference to a feature by type and id (`type/id` urn)
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct FeatureRef {
    pub feature_type: String,
    pub id: String,
}

impl FeatureRef {
    pub fn new(feature_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            feature_type: feature_type.into(),
            id: id.into(),
        }
    }

    /// Parse `type/id`; ids may themselves contain `/`
    pub fn parse_urn(urn: &str) -> Option<Self> {
        let (feature_type, id) = urn.split_once('/')?;
        if feature_type.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(feature_type, id))
    }

    pub fn urn(&self) -> String {
        format!("{}/{}", self.feature_type, self.id)
    }
}

impl fmt::Display for FeatureRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.feature_type, self.id)
    }
}

/// Protocol-neutral feature produced by every adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub feature_type: String,
    pub id: String,
    pub properties: Properties,
    pub geometry: Option<Geometry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secondary_geometries: BTreeMap<String, Geometry>,
}

#[derive(Debug, Deserialize)]
struct RawGeoJsonFeature {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    feature_type: Option<String>,
    #[serde(default)]
    properties: Option<Properties>,
    #[serde(default)]
    geometry: Option<Value>,
    #[serde(default)]
    secondary_geometries: Option<BTreeMap<String, Value>>,
}

/// Render a JSON id as a string (`12` rather than `12.0` for integers)
pub fn id_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(
            n.as_i64()
                .map(|i| i.to_string())
                .unwrap_or_else(|| n.to_string()),
        ),
        _ => None,
    }
}

fn parse_geometry(value: Value) -> Option<Geometry> {
    if value.is_null() {
        return None;
    }
    match serde_json::from_value::<Geometry>(value) {
        Ok(geometry) => Some(geometry),
        Err(e) => {
            debug!("Ignoring unsupported geometry: {}", e);
            None
        }
    }
}

impl FeatureRecord {
    pub fn new(feature_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            feature_type: feature_type.into(),
            id: id.into(),
            properties: Properties::new(),
            geometry: None,
            secondary_geometries: BTreeMap::new(),
        }
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    /// Build a record from a GeoJSON feature object.
    ///
    /// The feature type comes from a `feature_type` member when present,
    /// otherwise from `default_type`. The id falls back to the `key_field`
    /// property when the feature has no top-level id.
    pub fn from_geojson(
        value: Value,
        default_type: Option<&str>,
        key_field: Option<&str>,
    ) -> Result<Self> {
        let raw: RawGeoJsonFeature = serde_json::from_value(value)?;
        let properties = raw.properties.unwrap_or_default();

        let feature_type = raw
            .feature_type
            .or_else(|| default_type.map(str::to_string))
            .ok_or_else(|| DataError::protocol("Feature has no feature type"))?;

        let id = raw
            .id
            .as_ref()
            .and_then(id_to_string)
            .or_else(|| {
                key_field
                    .and_then(|key| properties.get(key))
                    .and_then(id_to_string)
            })
            .ok_or_else(|| {
                DataError::protocol(format!("Feature of type {} has no id", feature_type))
            })?;

        let secondary_geometries = raw
            .secondary_geometries
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(name, geom)| parse_geometry(geom).map(|g| (name, g)))
            .collect();

        Ok(Self {
            feature_type,
            id,
            properties,
            geometry: raw.geometry.and_then(parse_geometry),
            secondary_geometries,
        })
    }

    pub fn feature_ref(&self) -> FeatureRef {
        FeatureRef::new(self.feature_type.clone(), self.id.clone())
    }

    pub fn urn(&self) -> String {
        self.feature_ref().urn()
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Geometry stored in the named field: primary or secondary
    pub fn geometry_named(&self, name: &str, primary_name: Option<&str>) -> Option<&Geometry> {
        if primary_name == Some(name) {
            return self.geometry.as_ref();
        }
        self.secondary_geometries.get(name)
    }
}

/// A page (or the concatenation of pages) of feature records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    pub features: Vec<FeatureRecord>,
    /// Total matching rows on the backend, when reported
    pub total_count: Option<u64>,
    /// True if the backend truncated the result
    pub has_more: bool,
}

impl FeatureCollection {
    pub fn new(features: Vec<FeatureRecord>) -> Self {
        Self {
            features,
            total_count: None,
            has_more: false,
        }
    }

    pub fn with_pagination(
        features: Vec<FeatureRecord>,
        total_count: Option<u64>,
        has_more: bool,
    ) -> Self {
        Self {
            features,
            total_count,
            has_more,
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Append another collection, keeping order
    pub fn extend(&mut self, other: FeatureCollection) {
        self.features.extend(other.features);
        self.has_more |= other.has_more;
        self.total_count = match (self.total_count, other.total_count) {
            (Some(a), Some(b)) => Some(a + b),
            _ => None,
        };
    }

    /// Concatenate collections in the given order
    pub fn concat(collections: impl IntoIterator<Item = FeatureCollection>) -> Self {
        let mut iter = collections.into_iter();
        let mut result = iter.next().unwrap_or_default();
        for next in iter {
            result.extend(next);
        }
        result
    }
}

/// Sort specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortOrder {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

/// Options for `get_features` / `run_query` / `count`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureQuery {
    pub clauses: Vec<QueryClause>,
    pub bounds: Option<Bounds>,
    /// Spatial filter geometry (intersects)
    pub geometry: Option<Geometry>,
    pub ids: Option<Vec<String>>,
    /// Maximum rows; `None` means no limit
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub order_by: Vec<SortOrder>,
    /// Restrict the returned properties; `None` returns all
    pub fields: Option<Vec<String>>,
    pub include_geometry: bool,
    pub include_total: bool,
}

impl Default for FeatureQuery {
    fn default() -> Self {
        Self {
            clauses: Vec::new(),
            bounds: None,
            geometry: None,
            ids: None,
            limit: None,
            offset: None,
            order_by: Vec::new(),
            fields: None,
            include_geometry: true,
            include_total: false,
        }
    }
}

impl FeatureQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clause(mut self, clause: QueryClause) -> Self {
        self.clauses.push(clause);
        self
    }

    pub fn with_clauses(mut self, clauses: impl IntoIterator<Item = QueryClause>) -> Self {
        self.clauses.extend(clauses);
        self
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    pub fn with_ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_order(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.order_by.push(SortOrder {
            field: field.into(),
            descending,
        });
        self
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_total(mut self) -> Self {
        self.include_total = true;
        self
    }

    pub fn without_geometry(mut self) -> Self {
        self.include_geometry = false;
        self
    }
}

/// Point selection request (map click)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionRequest {
    pub point: Position,
    pub zoom: u8,
    pub pixel_tolerance: u32,
    /// Layer names to select from; empty means all selectable layers
    pub layers: Vec<String>,
    /// Feature types to select; empty means all
    pub feature_types: Vec<String>,
    /// Visible map extent, when known
    pub map_extent: Option<Bounds>,
    pub limit: Option<usize>,
}

impl SelectionRequest {
    pub fn at(x: f64, y: f64, zoom: u8) -> Self {
        Self {
            point: vec![x, y],
            zoom,
            pixel_tolerance: 4,
            layers: Vec::new(),
            feature_types: Vec::new(),
            map_extent: None,
            limit: None,
        }
    }

    pub fn x(&self) -> f64 {
        self.point.first().copied().unwrap_or_default()
    }

    pub fn y(&self) -> f64 {
        self.point.get(1).copied().unwrap_or_default()
    }

    /// Degrees per pixel at this zoom level (256px web-mercator tiles)
    pub fn resolution(&self) -> f64 {
        360.0 / (256.0 * 2f64.powi(self.zoom as i32))
    }

    /// Search box around the point covering the pixel tolerance
    pub fn tolerance_bounds(&self) -> Bounds {
        let half = self.resolution() * self.pixel_tolerance.max(1) as f64;
        Bounds::around(self.x(), self.y(), half)
    }
}

/// Box selection request (rubber band)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxSelectionRequest {
    pub bounds: Bounds,
    pub zoom: u8,
    pub layers: Vec<String>,
    pub feature_types: Vec<String>,
    pub limit: Option<usize>,
}

impl BoxSelectionRequest {
    pub fn new(bounds: Bounds, zoom: u8) -> Self {
        Self {
            bounds,
            zoom,
            layers: Vec::new(),
            feature_types: Vec::new(),
            limit: None,
        }
    }
}

/// Options for free-text search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    pub limit: usize,
    pub feature_types: Vec<String>,
    pub bounds: Option<Bounds>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            feature_types: Vec::new(),
            bounds: None,
        }
    }
}

/// Search result entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchSuggestion {
    /// A single matching feature
    Feature {
        label: String,
        feature_type: String,
        id: String,
    },
    /// A named query that can be run with `run_query`
    Query {
        label: String,
        feature_type: String,
        query: String,
    },
}

impl SearchSuggestion {
    pub fn label(&self) -> &str {
        match self {
            SearchSuggestion::Feature { label, .. } | SearchSuggestion::Query { label, .. } => {
                label
            }
        }
    }
}

/// Normalised input of insert/update operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureData {
    pub feature_type: String,
    pub id: Option<String>,
    pub properties: Properties,
    pub geometry: Option<Geometry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secondary_geometries: BTreeMap<String, Geometry>,
}

impl FeatureData {
    pub fn new(feature_type: impl Into<String>, properties: Properties) -> Self {
        Self {
            feature_type: feature_type.into(),
            id: None,
            properties,
            geometry: None,
            secondary_geometries: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    /// GeoJSON feature payload
    pub fn to_geojson(&self) -> Value {
        let mut feature = serde_json::json!({
            "type": "Feature",
            "properties": self.properties,
            "geometry": self.geometry,
        });
        if let Some(id) = &self.id {
            feature["id"] = Value::String(id.clone());
        }
        if !self.secondary_geometries.is_empty() {
            feature["secondary_geometries"] =
                serde_json::to_value(&self.secondary_geometries).unwrap_or(Value::Null);
        }
        feature
    }
}

impl From<FeatureRecord> for FeatureData {
    fn from(record: FeatureRecord) -> Self {
        Self {
            feature_type: record.feature_type,
            id: Some(record.id),
            properties: record.properties,
            geometry: record.geometry,
            secondary_geometries: record.secondary_geometries,
        }
    }
}

/// One operation inside a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransactionOp {
    Insert(FeatureData),
    Update(FeatureData),
    Delete { feature_type: String, id: String },
}

impl TransactionOp {
    pub fn feature_type(&self) -> &str {
        match self {
            TransactionOp::Insert(data) | TransactionOp::Update(data) => &data.feature_type,
            TransactionOp::Delete { feature_type, .. } => feature_type,
        }
    }
}

/// Ordered list of edits applied atomically by the backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub operations: Vec<TransactionOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_insert(&mut self, data: impl Into<FeatureData>) -> &mut Self {
        self.operations.push(TransactionOp::Insert(data.into()));
        self
    }

    pub fn add_update(&mut self, data: impl Into<FeatureData>) -> &mut Self {
        self.operations.push(TransactionOp::Update(data.into()));
        self
    }

    pub fn add_delete(&mut self, feature_type: impl Into<String>, id: impl Into<String>) -> &mut Self {
        self.operations.push(TransactionOp::Delete {
            feature_type: feature_type.into(),
            id: id.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Distinct feature types touched, in first-seen order
    pub fn feature_types(&self) -> Vec<String> {
        let mut types: Vec<String> = Vec::new();
        for op in &self.operations {
            if !types.iter().any(|t| t == op.feature_type()) {
                types.push(op.feature_type().to_string());
            }
        }
        types
    }
}

/// Per-operation result of a transaction: the id of each inserted/updated feature
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionResult {
    pub ids: Vec<Option<String>>,
}
