use federa_query::types::id_to_string;
use federa_query::{FeatureRecord, FeatureTypeDescriptor, FieldMetadata, Result};
use serde_json::Value;

use crate::xml::SchemaProperty;

/// Property holding the WFS feature id when no key field is configured
pub const FEATURE_ID_FIELD: &str = "fid";

/// Type name without its namespace prefix, `topp:poles` -> `poles`
pub fn local_type_name(type_name: &str) -> &str {
    type_name.rsplit(':').next().unwrap_or(type_name)
}

fn geometry_type(local_type: &str) -> Option<&'static str> {
    let shape = local_type
        .strip_suffix("PropertyType")
        .or_else(|| local_type.strip_suffix("AssociationType"))?;
    let shape = shape.strip_prefix("Multi").unwrap_or(shape);
    Some(match shape {
        "LineString" | "Curve" => "linestring",
        "Polygon" | "Surface" => "polygon",
        _ => "point",
    })
}

/// Field type of an XSD-declared property
pub fn field_type(property: &SchemaProperty) -> String {
    let local = property.local_type();
    if property.type_name.starts_with("gml:") || local.ends_with("PropertyType") {
        if let Some(geometry) = geometry_type(local) {
            return geometry.to_string();
        }
    }

    match local {
        "int" | "integer" | "long" | "short" | "byte" | "unsignedInt" | "unsignedLong"
        | "unsignedShort" | "nonNegativeInteger" | "positiveInteger" => "integer".to_string(),
        "double" | "float" => "double".to_string(),
        "decimal" => "numeric".to_string(),
        "boolean" => "boolean".to_string(),
        "date" => "date".to_string(),
        "dateTime" => "timestamp".to_string(),
        _ => match property.max_length {
            Some(length) => format!("string({})", length),
            None => "string".to_string(),
        },
    }
}

/// Descriptor of a WFS feature type from its schema properties
pub fn descriptor_from_schema(
    type_name: &str,
    title: Option<&str>,
    properties: &[SchemaProperty],
    key_field: Option<&str>,
    geometry_field: Option<&str>,
) -> FeatureTypeDescriptor {
    let mut descriptor = FeatureTypeDescriptor::new(type_name)
        .with_external_name(title.unwrap_or_else(|| local_type_name(type_name)));
    descriptor.editable = false;

    let key = key_field
        .filter(|k| properties.iter().any(|p| p.name == *k))
        .unwrap_or(FEATURE_ID_FIELD);
    if key == FEATURE_ID_FIELD {
        descriptor = descriptor.with_field(FieldMetadata::new(FEATURE_ID_FIELD, "string").as_key());
    }

    for property in properties {
        let mut field = FieldMetadata::new(&property.name, field_type(property));
        if property.name == key {
            field = field.as_key();
        }
        if field.is_geometry() && descriptor.primary_geom_name.is_none() {
            descriptor.primary_geom_name = Some(property.name.clone());
        }
        descriptor = descriptor.with_field(field);
    }

    if let Some(geometry) = geometry_field.filter(|g| descriptor.field(g).is_some()) {
        descriptor.primary_geom_name = Some(geometry.to_string());
    }
    descriptor.key_name = Some(key.to_string());
    descriptor
}

/// Record from a GeoJSON feature of a WFS response.
///
/// The key comes from `key_field` when configured, otherwise from the WFS
/// feature id with its `{type}.` prefix removed.
pub fn record_from_geojson(type_name: &str, value: Value, key_field: Option<&str>) -> Result<FeatureRecord> {
    let mut record = FeatureRecord::from_geojson(value, Some(type_name), key_field)?;

    if let Some(id) = key_field
        .and_then(|k| record.properties.get(k))
        .and_then(id_to_string)
    {
        record.id = id;
        return Ok(record);
    }

    let prefix = format!("{}.", local_type_name(type_name));
    if let Some(stripped) = record.id.strip_prefix(&prefix) {
        record.id = stripped.to_string();
    }
    record
        .properties
        .insert(FEATURE_ID_FIELD.to_string(), Value::String(record.id.clone()));
    Ok(record)
}

/// WFS feature id of a record key
pub fn feature_id(type_name: &str, id: &str) -> String {
    format!("{}.{}", local_type_name(type_name), id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn property(name: &str, type_name: &str) -> SchemaProperty {
        SchemaProperty {
            name: name.to_string(),
            type_name: type_name.to_string(),
            nillable: true,
            max_length: None,
        }
    }

    #[test]
    fn test_field_types() {
        assert_eq!(field_type(&property("g", "gml:MultiSurfacePropertyType")), "polygon");
        assert_eq!(field_type(&property("g", "gml:LineStringPropertyType")), "linestring");
        assert_eq!(field_type(&property("g", "gml:GeometryPropertyType")), "point");
        assert_eq!(field_type(&property("n", "xsd:long")), "integer");
        assert_eq!(field_type(&property("n", "xsd:decimal")), "numeric");
        assert_eq!(field_type(&property("d", "xsd:dateTime")), "timestamp");
        let mut name = property("name", "xsd:string");
        name.max_length = Some(40);
        assert_eq!(field_type(&name), "string(40)");
    }

    #[test]
    fn test_descriptor_from_schema() {
        let properties = vec![
            property("the_geom", "gml:PointPropertyType"),
            property("pole_id", "xsd:int"),
            property("name", "xsd:string"),
        ];

        let dd = descriptor_from_schema("topp:poles", Some("Poles"), &properties, None, None);
        assert_eq!(dd.name, "topp:poles");
        assert_eq!(dd.display_name(), "Poles");
        assert_eq!(dd.key_name(), Some(FEATURE_ID_FIELD));
        assert_eq!(dd.primary_geometry_name(), Some("the_geom"));
        assert!(!dd.editable);

        let dd = descriptor_from_schema("topp:poles", None, &properties, Some("pole_id"), None);
        assert_eq!(dd.display_name(), "poles");
        assert_eq!(dd.key_name(), Some("pole_id"));
        assert!(dd.field(FEATURE_ID_FIELD).is_none());
    }

    #[test]
    fn test_record_ids() {
        let feature = json!({
            "type": "Feature",
            "id": "poles.12",
            "properties": {"pole_id": 1012, "name": "P12"},
            "geometry": {"type": "Point", "coordinates": [5.0, 52.0]}
        });

        let record = record_from_geojson("topp:poles", feature.clone(), None).unwrap();
        assert_eq!(record.urn(), "topp:poles/12");
        assert_eq!(record.property(FEATURE_ID_FIELD), Some(&json!("12")));
        assert!(record.geometry.is_some());

        let record = record_from_geojson("topp:poles", feature, Some("pole_id")).unwrap();
        assert_eq!(record.id, "1012");
        assert_eq!(feature_id("topp:poles", "12"), "poles.12");
    }
}
