//! Fields needed to draw features of a type with a given style

use federa_query::descriptor::template_fields;
use federa_query::{FeatureQuery, FeatureTypeDescriptor};
use serde::{Deserialize, Serialize};

/// Style definition as far as it affects which fields are fetched.
/// Rules nest: a rule applies its own filter on top of its parent's.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureStyle {
    /// Field whose value selects the symbol
    #[serde(default)]
    pub style_field: Option<String>,
    /// Field whose value is looked up in a style table
    #[serde(default)]
    pub lookup_field: Option<String>,
    /// Label text with `{field}` placeholders
    #[serde(default)]
    pub label: Option<String>,
    /// Descriptor filter name, or an inline attribute query
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub rules: Vec<FeatureStyle>,
}

fn push_unique(fields: &mut Vec<String>, name: &str) {
    if !fields.iter().any(|f| f == name) {
        fields.push(name.to_string());
    }
}

fn collect_style_fields(descriptor: &FeatureTypeDescriptor, style: &FeatureStyle, fields: &mut Vec<String>) {
    if let Some(field) = &style.style_field {
        push_unique(fields, field);
    }
    if let Some(field) = &style.lookup_field {
        push_unique(fields, field);
    }
    if let Some(label) = &style.label {
        for field in template_fields(label) {
            push_unique(fields, &field);
        }
    }
    if let Some(filter) = &style.filter {
        for clause in descriptor.filter_clauses(filter) {
            push_unique(fields, &clause.field_name);
        }
    }
    for rule in &style.rules {
        collect_style_fields(descriptor, rule, fields);
    }
}

/// Key, geometry and every field the style reads, in first-use order
pub fn render_fields(descriptor: &FeatureTypeDescriptor, style: &FeatureStyle) -> Vec<String> {
    let mut fields = Vec::new();
    if let Some(key) = descriptor.key_name() {
        push_unique(&mut fields, key);
    }
    for geometry in descriptor.geometry_field_names() {
        push_unique(&mut fields, geometry);
    }
    collect_style_fields(descriptor, style, &mut fields);
    fields
}

/// Query restricted to the render fields
pub fn render_query(descriptor: &FeatureTypeDescriptor, style: &FeatureStyle) -> FeatureQuery {
    FeatureQuery::new().with_fields(render_fields(descriptor, style))
}

#[cfg(test)]
mod tests {
    use super::*;
    use federa_query::FieldMetadata;

    fn descriptor() -> FeatureTypeDescriptor {
        FeatureTypeDescriptor::new("pole")
            .with_field(FieldMetadata::new("id", "integer").as_key())
            .with_field(FieldMetadata::new("location", "point"))
            .with_field(FieldMetadata::new("label_point", "point"))
            .with_field(FieldMetadata::new("status", "string"))
            .with_field(FieldMetadata::new("height", "double"))
            .with_field(FieldMetadata::new("owner", "string"))
            .with_filter("tall_open", "[height]>20 & [status]='Open'")
    }

    #[test]
    fn test_render_fields_follow_nested_rules() {
        let style = FeatureStyle {
            style_field: Some("status".to_string()),
            label: Some("{owner} {id}".to_string()),
            rules: vec![FeatureStyle {
                filter: Some("tall_open".to_string()),
                rules: vec![FeatureStyle {
                    lookup_field: Some("material".to_string()),
                    filter: Some("[voltage]>=11".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };

        assert_eq!(
            render_fields(&descriptor(), &style),
            vec![
                "id",
                "location",
                "label_point",
                "status",
                "owner",
                "height",
                "material",
                "voltage"
            ]
        );
    }

    #[test]
    fn test_plain_style() {
        let query = render_query(&descriptor(), &FeatureStyle::default());
        assert_eq!(
            query.fields,
            Some(vec![
                "id".to_string(),
                "location".to_string(),
                "label_point".to_string()
            ])
        );
    }
}
