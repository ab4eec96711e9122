//! Server-declared schema of a feature type

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::field::{EnumValue, FieldMetadata, FieldValidationError};
use crate::parser::{AttributeQueryParser, QueryClause};
use crate::types::Properties;

/// Named query offered for a feature type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Name of a descriptor filter, or an inline attribute query
    #[serde(default)]
    pub filter: Option<String>,
}

/// Search template, e.g. `{name}` with description `Pole {name}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDefinition {
    pub value: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Feature type descriptor ("DD")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTypeDescriptor {
    pub name: String,
    #[serde(default)]
    pub external_name: Option<String>,
    /// Title template, e.g. `{name} ({id})`
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub short_description: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldMetadata>,
    #[serde(default)]
    pub key_name: Option<String>,
    #[serde(default)]
    pub primary_geom_name: Option<String>,
    #[serde(default)]
    pub editable: bool,
    #[serde(default)]
    pub versioned: bool,
    /// Named attribute-query filters
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    #[serde(default)]
    pub queries: Vec<QueryDefinition>,
    #[serde(default)]
    pub searches: Vec<SearchDefinition>,
    #[serde(default)]
    pub enumerators: BTreeMap<String, Vec<EnumValue>>,
}

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z0-9_.]+)\}").expect("placeholder regex is valid"));

/// Field names referenced by `{field}` placeholders in a template
pub fn template_fields(template: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(template)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Substitute `{field}` placeholders with property values; missing values render empty
pub fn render_template(template: &str, properties: &Properties) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures| {
            match properties.get(&caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            }
        })
        .trim()
        .to_string()
}

impl FeatureTypeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            external_name: None,
            title: None,
            short_description: None,
            fields: Vec::new(),
            key_name: None,
            primary_geom_name: None,
            editable: false,
            versioned: false,
            filters: BTreeMap::new(),
            queries: Vec::new(),
            searches: Vec::new(),
            enumerators: BTreeMap::new(),
        }
    }

    /// Parse descriptor JSON and link enumerator value lists
    pub fn from_json(value: Value) -> Result<Self> {
        let mut descriptor: Self = serde_json::from_value(value)?;
        descriptor.resolve_enumerators();
        Ok(descriptor)
    }

    pub fn with_external_name(mut self, name: impl Into<String>) -> Self {
        self.external_name = Some(name.into());
        self
    }

    pub fn with_field(mut self, field: FieldMetadata) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_filter(mut self, name: impl Into<String>, expression: impl Into<String>) -> Self {
        self.filters.insert(name.into(), expression.into());
        self
    }

    pub fn with_query(mut self, query: QueryDefinition) -> Self {
        self.queries.push(query);
        self
    }

    pub fn editable(mut self, editable: bool) -> Self {
        self.editable = editable;
        self
    }

    pub fn display_name(&self) -> &str {
        self.external_name.as_deref().unwrap_or(&self.name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldMetadata> {
        self.fields.iter().find(|f| f.internal_name == name)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.internal_name.as_str()).collect()
    }

    /// Explicit key name, or the first field flagged as key
    pub fn key_name(&self) -> Option<&str> {
        self.key_name
            .as_deref()
            .or_else(|| self.fields.iter().find(|f| f.key).map(|f| f.internal_name.as_str()))
    }

    pub fn geometry_field_names(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.is_geometry())
            .map(|f| f.internal_name.as_str())
            .collect()
    }

    /// Explicit primary geometry, or the first geometry field
    pub fn primary_geometry_name(&self) -> Option<&str> {
        self.primary_geom_name
            .as_deref()
            .or_else(|| self.geometry_field_names().into_iter().next())
    }

    pub fn calculated_field_names(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.is_calculated())
            .map(|f| f.internal_name.as_str())
            .collect()
    }

    /// Clauses of a named filter, or of `name_or_expression` parsed directly
    pub fn filter_clauses(&self, name_or_expression: &str) -> Vec<QueryClause> {
        let expression = self
            .filters
            .get(name_or_expression)
            .map(String::as_str)
            .unwrap_or(name_or_expression);
        AttributeQueryParser::new().parse(expression)
    }

    pub fn query(&self, name: &str) -> Option<&QueryDefinition> {
        self.queries.iter().find(|q| q.name == name)
    }

    /// Clauses applied by a named query (empty when it has no filter)
    pub fn query_clauses(&self, name: &str) -> Option<Vec<QueryClause>> {
        let query = self.query(name)?;
        Some(
            query
                .filter
                .as_deref()
                .map(|f| self.filter_clauses(f))
                .unwrap_or_default(),
        )
    }

    /// Copy enumerator value lists onto the fields that reference them
    pub fn resolve_enumerators(&mut self) {
        for field in &mut self.fields {
            if field.values.is_some() {
                continue;
            }
            if let Some(values) = field
                .enumerator
                .as_ref()
                .and_then(|name| self.enumerators.get(name))
            {
                field.values = Some(values.clone());
            }
        }
    }

    /// Fold a later fetch of the same type into this descriptor.
    /// Nothing is removed: fields, filters, queries and searches are added or replaced.
    pub fn merge(&mut self, other: FeatureTypeDescriptor) {
        for field in other.fields {
            match self
                .fields
                .iter_mut()
                .find(|f| f.internal_name == field.internal_name)
            {
                Some(existing) => *existing = field,
                None => self.fields.push(field),
            }
        }
        for query in other.queries {
            match self.queries.iter_mut().find(|q| q.name == query.name) {
                Some(existing) => *existing = query,
                None => self.queries.push(query),
            }
        }
        for search in other.searches {
            if !self.searches.contains(&search) {
                self.searches.push(search);
            }
        }
        self.filters.extend(other.filters);
        self.enumerators.extend(other.enumerators);

        self.external_name = other.external_name.or(self.external_name.take());
        self.title = other.title.or(self.title.take());
        self.short_description = other.short_description.or(self.short_description.take());
        self.key_name = other.key_name.or(self.key_name.take());
        self.primary_geom_name = other.primary_geom_name.or(self.primary_geom_name.take());
        self.editable |= other.editable;
        self.versioned |= other.versioned;

        self.resolve_enumerators();
    }

    /// Validate every field of a feature
    pub fn validate(&self, properties: &Properties) -> Vec<FieldValidationError> {
        self.fields
            .iter()
            .filter(|f| !f.is_geometry() && !f.is_calculated())
            .filter_map(|f| f.validate(properties).err())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldRule;
    use serde_json::json;

    fn pole_json() -> Value {
        json!({
            "name": "pole",
            "external_name": "Pole",
            "title": "Pole {name}",
            "editable": true,
            "fields": [
                {"internal_name": "id", "type": "integer", "key": true},
                {"internal_name": "name", "type": "string(20)"},
                {"internal_name": "status", "type": "string(10)", "enum": "pole_status"},
                {"internal_name": "location", "type": "point"},
                {"internal_name": "label_point", "type": "point"},
                {"internal_name": "cables", "type": "reference_set(cable)", "value": "select(cable.pole)"}
            ],
            "filters": {"open": "[status]='Open'"},
            "queries": [{"name": "open_poles", "filter": "open"}],
            "enumerators": {"pole_status": [{"value": "Open"}, {"value": "Closed"}]}
        })
    }

    #[test]
    fn test_from_json_links_enumerators() {
        let dd = FeatureTypeDescriptor::from_json(pole_json()).unwrap();
        assert_eq!(dd.display_name(), "Pole");
        assert_eq!(dd.key_name(), Some("id"));
        assert_eq!(dd.geometry_field_names(), vec!["location", "label_point"]);
        assert_eq!(dd.primary_geometry_name(), Some("location"));
        assert_eq!(dd.calculated_field_names(), vec!["cables"]);
        assert_eq!(dd.field("status").unwrap().values.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_named_filters_and_queries() {
        let dd = FeatureTypeDescriptor::from_json(pole_json()).unwrap();
        let clauses = dd.query_clauses("open_poles").unwrap();
        assert_eq!(clauses.len(), 1);
        assert_eq!(clauses[0].field_name, "status");

        let inline = dd.filter_clauses("[name]='P1'");
        assert_eq!(inline[0].field_name, "name");
        assert!(dd.query_clauses("missing").is_none());
    }

    #[test]
    fn test_merge_never_removes() {
        let mut dd = FeatureTypeDescriptor::from_json(pole_json()).unwrap();
        let extra = FeatureTypeDescriptor::new("pole")
            .with_field(
                FieldMetadata::new("name", "string(40)").with_rules(
                    FieldRule::always(),
                    FieldRule::always(),
                    FieldRule::never(),
                ),
            )
            .with_field(FieldMetadata::new("height", "double"))
            .with_filter("tall", "[height]>20");

        dd.merge(extra);

        assert_eq!(dd.fields.len(), 7);
        assert_eq!(dd.field("name").unwrap().max_length(), Some(40));
        assert!(dd.filters.contains_key("open"));
        assert!(dd.filters.contains_key("tall"));
        assert_eq!(dd.external_name.as_deref(), Some("Pole"));
        assert!(dd.editable);
    }

    #[test]
    fn test_templates() {
        let props = json!({"name": "P7", "height": 12}).as_object().cloned().unwrap();
        assert_eq!(render_template("Pole {name} ({height}m)", &props), "Pole P7 (12m)");
        assert_eq!(render_template("{missing} x", &props), "x");
        assert_eq!(template_fields("{a} and {b.c}"), vec!["a", "b.c"]);
    }

    #[test]
    fn test_validate_skips_calculated_fields() {
        let dd = FeatureTypeDescriptor::from_json(pole_json()).unwrap();
        let props = json!({"id": 1, "status": "Unknown"}).as_object().cloned().unwrap();
        let errors = dd.validate(&props);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "status");
    }
}
