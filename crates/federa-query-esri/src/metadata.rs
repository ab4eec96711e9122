//! Layer index and layer-to-descriptor mapping

use chrono::{DateTime, Utc};
use federa_query::types::id_to_string;
use federa_query::{EnumValue, FeatureRecord, FeatureTypeDescriptor, FieldMetadata, Geometry, Properties};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::geometry::{ESRI_MULTIPOINT, ESRI_POINT, ESRI_POLYGON, ESRI_POLYLINE};
use crate::response::{EsriField, LayerInfo};

const FALLBACK_KEY: &str = "OBJECTID";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Feature type name of a layer: lowercase, non-alphanumerics replaced by `_`
pub fn feature_type_name(layer_name: &str) -> String {
    layer_name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn geometry_field_type(geometry_type: Option<&str>) -> &'static str {
    match geometry_type {
        Some(ESRI_POINT) | Some(ESRI_MULTIPOINT) => "point",
        Some(ESRI_POLYLINE) => "linestring",
        Some(ESRI_POLYGON) => "polygon",
        _ => "point",
    }
}

fn field_type(field: &EsriField, geometry_type: Option<&str>) -> String {
    match field.field_type.as_str() {
        "esriFieldTypeOID" | "esriFieldTypeInteger" | "esriFieldTypeSmallInteger" => {
            "integer".to_string()
        }
        "esriFieldTypeDouble" | "esriFieldTypeSingle" => "double".to_string(),
        "esriFieldTypeDate" => "timestamp".to_string(),
        "esriFieldTypeGeometry" => geometry_field_type(geometry_type).to_string(),
        "esriFieldTypeString" => match field.length {
            Some(length) => format!("string({})", length),
            None => "string".to_string(),
        },
        _ => "string".to_string(),
    }
}

/// Descriptor of a layer; coded-value domains become enumerators
pub fn descriptor_from_layer(info: &LayerInfo) -> FeatureTypeDescriptor {
    let name = feature_type_name(&info.name);
    let geometry_type = info.geometry_type.as_deref();
    let mut descriptor = FeatureTypeDescriptor::new(&name).with_external_name(&info.name);

    for field in &info.fields {
        let mut metadata = FieldMetadata::new(&field.name, field_type(field, geometry_type));
        if let Some(alias) = field.alias.as_ref().filter(|a| *a != &field.name) {
            metadata = metadata.with_external_name(alias);
        }
        if field.field_type == "esriFieldTypeOID" || info.object_id_field.as_deref() == Some(field.name.as_str()) {
            metadata = metadata.as_key();
        }

        if let Some(domain) = field.domain.as_ref().filter(|d| d.domain_type == "codedValue") {
            let enumerator = domain
                .name
                .clone()
                .unwrap_or_else(|| format!("{}.{}", name, field.name));
            let values = domain
                .coded_values
                .iter()
                .map(|cv| EnumValue::new(cv.code.clone()).with_display(&cv.name))
                .collect();
            descriptor.enumerators.insert(enumerator.clone(), values);
            metadata.enumerator = Some(enumerator);
        }

        if field.field_type == "esriFieldTypeGeometry" {
            descriptor.primary_geom_name = Some(field.name.clone());
        }
        descriptor = descriptor.with_field(metadata);
    }

    // Layers list their shape field only sometimes
    if geometry_type.is_some() && descriptor.primary_geom_name.is_none() {
        descriptor = descriptor.with_field(FieldMetadata::new("shape", geometry_field_type(geometry_type)));
        descriptor.primary_geom_name = Some("shape".to_string());
    }

    descriptor.key_name = info.object_id_field.clone();
    descriptor.title = info.display_field.as_ref().map(|f| format!("{{{}}}", f));
    descriptor.resolve_enumerators();
    descriptor
}

/// What is known about one layer of the service
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerEntry {
    pub id: u32,
    pub name: String,
    pub feature_type: String,
    /// Set once the layer info has been read
    pub loaded: bool,
    pub key_field: Option<String>,
    pub display_field: Option<String>,
    /// Field alias to field name, for identify and find results
    pub aliases: HashMap<String, String>,
    pub string_fields: Vec<String>,
    pub date_fields: Vec<String>,
}

impl LayerEntry {
    pub fn new(id: u32, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            feature_type: feature_type_name(name),
            ..Default::default()
        }
    }

    pub fn key(&self) -> &str {
        self.key_field.as_deref().unwrap_or(FALLBACK_KEY)
    }

    fn update(&mut self, info: &LayerInfo) {
        self.name = info.name.clone();
        self.feature_type = feature_type_name(&info.name);
        self.loaded = true;
        self.key_field = info.object_id_field.clone().or_else(|| {
            info.fields
                .iter()
                .find(|f| f.field_type == "esriFieldTypeOID")
                .map(|f| f.name.clone())
        });
        self.display_field = info.display_field.clone();
        self.aliases = info
            .fields
            .iter()
            .filter_map(|f| f.alias.as_ref().map(|a| (a.clone(), f.name.clone())))
            .collect();
        self.string_fields = info
            .fields
            .iter()
            .filter(|f| f.field_type == "esriFieldTypeString")
            .map(|f| f.name.clone())
            .collect();
        self.date_fields = info
            .fields
            .iter()
            .filter(|f| f.field_type == "esriFieldTypeDate")
            .map(|f| f.name.clone())
            .collect();
    }

    /// Record from a row, renaming aliased attributes and formatting dates
    pub fn record(&self, attributes: Properties, geometry: Option<Geometry>) -> Option<FeatureRecord> {
        let mut properties = Properties::new();
        for (name, value) in attributes {
            let name = self.aliases.get(&name).cloned().unwrap_or(name);
            properties.insert(name, value);
        }

        for field in &self.date_fields {
            if let Some(value) = properties.get_mut(field) {
                if let Some(formatted) = value
                    .as_i64()
                    .and_then(DateTime::<Utc>::from_timestamp_millis)
                    .map(|dt| dt.format(TIMESTAMP_FORMAT).to_string())
                {
                    *value = Value::String(formatted);
                }
            }
        }

        let id = properties.get(self.key()).and_then(id_to_string)?;
        let mut record = FeatureRecord::new(&self.feature_type, id).with_properties(properties);
        record.geometry = geometry;
        Some(record)
    }
}

/// Layers by id, and feature types to layer ids
#[derive(Debug, Clone, Default)]
pub struct LayerIndex {
    layers: BTreeMap<u32, LayerEntry>,
    by_type: HashMap<String, u32>,
}

impl LayerIndex {
    pub fn insert(&mut self, entry: LayerEntry) {
        self.by_type.insert(entry.feature_type.clone(), entry.id);
        self.layers.insert(entry.id, entry);
    }

    pub fn update(&mut self, info: &LayerInfo) {
        let entry = self
            .layers
            .entry(info.id)
            .or_insert_with(|| LayerEntry::new(info.id, &info.name));
        entry.update(info);
        self.by_type.insert(entry.feature_type.clone(), info.id);
    }

    pub fn get(&self, id: u32) -> Option<&LayerEntry> {
        self.layers.get(&id)
    }

    pub fn layer_for_type(&self, feature_type: &str) -> Option<&LayerEntry> {
        self.by_type.get(feature_type).and_then(|id| self.layers.get(id))
    }

    pub fn feature_types(&self) -> Vec<String> {
        self.layers.values().map(|l| l.feature_type.clone()).collect()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.layers.keys().copied().collect()
    }

    /// Layers named (by name, type or id) or serving one of the types; all when both are empty
    pub fn select(&self, layers: &[String], feature_types: &[String]) -> Vec<u32> {
        if layers.is_empty() && feature_types.is_empty() {
            return self.ids();
        }
        self.layers
            .values()
            .filter(|l| {
                layers
                    .iter()
                    .any(|n| *n == l.name || *n == l.feature_type || *n == l.id.to_string())
                    || feature_types.contains(&l.feature_type)
            })
            .map(|l| l.id)
            .collect()
    }

    pub fn unloaded(&self, ids: &[u32]) -> Vec<u32> {
        ids.iter()
            .copied()
            .filter(|id| self.layers.get(id).map_or(true, |l| !l.loaded))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn poles_layer() -> Value {
        json!({
            "id": 0,
            "name": "Street Poles",
            "geometryType": "esriGeometryPoint",
            "objectIdField": "OBJECTID",
            "displayField": "NAME",
            "fields": [
                {"name": "OBJECTID", "type": "esriFieldTypeOID", "alias": "Object ID"},
                {"name": "NAME", "type": "esriFieldTypeString", "alias": "Pole Name", "length": 50},
                {"name": "HEIGHT", "type": "esriFieldTypeDouble", "alias": "HEIGHT"},
                {"name": "INSTALLED", "type": "esriFieldTypeDate", "alias": "Installed"},
                {"name": "MATERIAL", "type": "esriFieldTypeString", "alias": "Material", "length": 1,
                 "domain": {"type": "codedValue", "name": "Materials",
                            "codedValues": [{"name": "Wood", "code": "W"}, {"name": "Steel", "code": "S"}]}},
                {"name": "SHAPE", "type": "esriFieldTypeGeometry", "alias": "Shape"}
            ]
        })
    }

    #[test]
    fn test_feature_type_name() {
        assert_eq!(feature_type_name("Street Poles"), "street_poles");
        assert_eq!(feature_type_name("HV-Cables (2020)"), "hv_cables__2020_");
    }

    #[test]
    fn test_descriptor_from_layer() {
        let info: LayerInfo = serde_json::from_value(poles_layer()).unwrap();
        let dd = descriptor_from_layer(&info);

        assert_eq!(dd.name, "street_poles");
        assert_eq!(dd.display_name(), "Street Poles");
        assert_eq!(dd.key_name(), Some("OBJECTID"));
        assert_eq!(dd.primary_geometry_name(), Some("SHAPE"));
        assert_eq!(dd.field("NAME").unwrap().type_name, "string(50)");
        assert_eq!(dd.field("NAME").unwrap().display_name(), "Pole Name");
        assert_eq!(dd.field("INSTALLED").unwrap().type_name, "timestamp");
        assert_eq!(dd.field("SHAPE").unwrap().type_name, "point");

        let values = dd.field("MATERIAL").unwrap().values.as_ref().unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[1].label(), "Steel");
    }

    #[test]
    fn test_record_renames_aliases() {
        let info: LayerInfo = serde_json::from_value(poles_layer()).unwrap();
        let mut index = LayerIndex::default();
        index.insert(LayerEntry::new(0, "Street Poles"));
        assert_eq!(index.unloaded(&[0]), vec![0]);
        index.update(&info);
        assert!(index.unloaded(&[0]).is_empty());

        let entry = index.layer_for_type("street_poles").unwrap();
        let record = entry
            .record(
                json!({"Object ID": 7, "Pole Name": "P7", "Installed": 1704067200000i64})
                    .as_object()
                    .cloned()
                    .unwrap(),
                None,
            )
            .unwrap();
        assert_eq!(record.urn(), "street_poles/7");
        assert_eq!(record.property("NAME"), Some(&json!("P7")));
        assert_eq!(record.property("INSTALLED"), Some(&json!("2024-01-01T00:00:00")));

        assert!(entry.record(Properties::new(), None).is_none());
    }

    #[test]
    fn test_select_layers() {
        let mut index = LayerIndex::default();
        index.insert(LayerEntry::new(0, "Poles"));
        index.insert(LayerEntry::new(3, "Cables"));
        assert_eq!(index.select(&[], &[]), vec![0, 3]);
        assert_eq!(index.select(&["Cables".to_string()], &[]), vec![3]);
        assert_eq!(index.select(&[], &["poles".to_string()]), vec![0]);
        assert_eq!(index.select(&["3".to_string()], &[]), vec![3]);
    }
}
