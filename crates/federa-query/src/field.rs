//! Per-field metadata of a feature type

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::parser::{AttributeQueryParser, QueryClause};
use crate::types::Properties;

/// Base types whose values are geometries
pub const GEOMETRY_TYPES: &[&str] = &["point", "linestring", "polygon"];

/// Base types whose values identify other features
pub const REFERENCE_TYPES: &[&str] = &["reference", "reference_set", "foreign_key"];

/// Boolean field property that is either fixed or conditional on the feature
///
/// In descriptor JSON this is written either as `true`/`false` or as an
/// attribute query string such as `"[status]='Locked'"`.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldRule {
    Always(bool),
    When {
        expression: String,
        clauses: Vec<QueryClause>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawFieldRule {
    Flag(bool),
    Expression(String),
}

impl From<RawFieldRule> for FieldRule {
    fn from(raw: RawFieldRule) -> Self {
        match raw {
            RawFieldRule::Flag(flag) => FieldRule::Always(flag),
            RawFieldRule::Expression(expr) => match expr.trim() {
                "true" => FieldRule::Always(true),
                "false" | "" => FieldRule::Always(false),
                _ => FieldRule::when(&expr),
            },
        }
    }
}

impl From<FieldRule> for RawFieldRule {
    fn from(rule: FieldRule) -> Self {
        match rule {
            FieldRule::Always(flag) => RawFieldRule::Flag(flag),
            FieldRule::When { expression, .. } => RawFieldRule::Expression(expression),
        }
    }
}

impl Serialize for FieldRule {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RawFieldRule::from(self.clone()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FieldRule {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        RawFieldRule::deserialize(deserializer).map(FieldRule::from)
    }
}

impl FieldRule {
    pub fn always() -> Self {
        FieldRule::Always(true)
    }

    pub fn never() -> Self {
        FieldRule::Always(false)
    }

    /// Conditional rule; all clauses must match
    pub fn when(expression: &str) -> Self {
        FieldRule::When {
            expression: expression.to_string(),
            clauses: AttributeQueryParser::new().parse(expression),
        }
    }

    pub fn evaluate(&self, properties: &Properties) -> bool {
        match self {
            FieldRule::Always(flag) => *flag,
            FieldRule::When { clauses, .. } => {
                !clauses.is_empty() && clauses.iter().all(|c| c.matches(properties))
            }
        }
    }

    /// Fields the rule depends on
    pub fn referenced_fields(&self) -> Vec<&str> {
        match self {
            FieldRule::Always(_) => Vec::new(),
            FieldRule::When { clauses, .. } => {
                clauses.iter().map(|c| c.field_name.as_str()).collect()
            }
        }
    }
}

/// One entry of an enumerator value list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumValue {
    pub value: Value,
    #[serde(default)]
    pub display_value: Option<String>,
}

impl EnumValue {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            display_value: None,
        }
    }

    pub fn with_display(mut self, display_value: impl Into<String>) -> Self {
        self.display_value = Some(display_value.into());
        self
    }

    pub fn label(&self) -> String {
        match (&self.display_value, &self.value) {
            (Some(display), _) => display.clone(),
            (None, Value::String(s)) => s.clone(),
            (None, other) => other.to_string(),
        }
    }
}

/// Declarative value check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Validator {
    Range {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    MaxLength {
        length: usize,
    },
    Pattern {
        pattern: String,
        #[serde(default)]
        message: Option<String>,
    },
}

impl Validator {
    fn check(&self, value: &Value) -> Result<(), String> {
        match self {
            Validator::Range { min, max } => {
                let Some(n) = value
                    .as_f64()
                    .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
                else {
                    return Err("must be a number".to_string());
                };
                if let Some(min) = min {
                    if n < *min {
                        return Err(format!("must be at least {}", min));
                    }
                }
                if let Some(max) = max {
                    if n > *max {
                        return Err(format!("must be at most {}", max));
                    }
                }
                Ok(())
            }
            Validator::MaxLength { length } => match value.as_str() {
                Some(s) if s.chars().count() > *length => {
                    Err(format!("must be at most {} characters", length))
                }
                _ => Ok(()),
            },
            Validator::Pattern { pattern, message } => {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                match regex::Regex::new(pattern) {
                    Ok(re) if re.is_match(&text) => Ok(()),
                    Ok(_) => Err(message
                        .clone()
                        .unwrap_or_else(|| format!("must match {}", pattern))),
                    Err(_) => Err(format!("has an invalid pattern {}", pattern)),
                }
            }
        }
    }
}

/// Value of a calculated field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalculatedValue {
    /// Computed server-side by the named method
    Method(String),
    /// Features of other types whose field references this feature
    Select(Vec<(String, String)>),
}

impl CalculatedValue {
    /// Parse `method(name)` or `select(type.field, other.field)`
    pub fn parse(expression: &str) -> Option<Self> {
        let expression = expression.trim();
        let (head, rest) = expression.split_once('(')?;
        let args = rest.strip_suffix(')')?;

        match head.trim() {
            "method" => {
                let name = args.trim();
                (!name.is_empty()).then(|| CalculatedValue::Method(name.to_string()))
            }
            "select" => {
                let targets: Vec<(String, String)> = args
                    .split(',')
                    .filter_map(|target| {
                        let (ty, field) = target.trim().split_once('.')?;
                        Some((ty.trim().to_string(), field.trim().to_string()))
                    })
                    .collect();
                (!targets.is_empty()).then_some(CalculatedValue::Select(targets))
            }
            _ => None,
        }
    }
}

/// A failed field check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldValidationError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for FieldValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.message)
    }
}

/// Descriptor of a single field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMetadata {
    pub internal_name: String,
    #[serde(default)]
    pub external_name: Option<String>,
    /// Declared type, possibly parameterised: `string(50)`, `reference(pole)`
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub key: bool,
    #[serde(default = "FieldRule::always")]
    pub visible: FieldRule,
    #[serde(default = "FieldRule::never")]
    pub read_only: FieldRule,
    #[serde(default = "FieldRule::never")]
    pub mandatory: FieldRule,
    /// Name of the enumerator supplying the value list
    #[serde(default, rename = "enum")]
    pub enumerator: Option<String>,
    /// `type.field` whose distinct values form the value list
    #[serde(default)]
    pub catalogue: Option<String>,
    /// Resolved enumerator values
    #[serde(default)]
    pub values: Option<Vec<EnumValue>>,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub unit: Option<String>,
    /// Calculated-value expression (`method(..)` / `select(..)`)
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub validators: Vec<Validator>,
    #[serde(default)]
    pub indexed: bool,
}

impl FieldMetadata {
    pub fn new(internal_name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            internal_name: internal_name.into(),
            external_name: None,
            type_name: type_name.into(),
            key: false,
            visible: FieldRule::always(),
            read_only: FieldRule::never(),
            mandatory: FieldRule::never(),
            enumerator: None,
            catalogue: None,
            values: None,
            default: None,
            unit: None,
            value: None,
            validators: Vec::new(),
            indexed: false,
        }
    }

    pub fn with_external_name(mut self, name: impl Into<String>) -> Self {
        self.external_name = Some(name.into());
        self
    }

    pub fn as_key(mut self) -> Self {
        self.key = true;
        self.mandatory = FieldRule::always();
        self
    }

    pub fn with_values(mut self, values: Vec<EnumValue>) -> Self {
        self.values = Some(values);
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn with_calculated_value(mut self, expression: impl Into<String>) -> Self {
        self.value = Some(expression.into());
        self
    }

    pub fn with_rules(mut self, visible: FieldRule, read_only: FieldRule, mandatory: FieldRule) -> Self {
        self.visible = visible;
        self.read_only = read_only;
        self.mandatory = mandatory;
        self
    }

    /// Type without parameters: `string(50)` -> `string`
    pub fn base_type(&self) -> &str {
        self.type_name
            .split('(')
            .next()
            .unwrap_or_default()
            .trim()
    }

    /// Text between the parentheses of a parameterised type
    pub fn type_params(&self) -> Option<&str> {
        let (_, rest) = self.type_name.split_once('(')?;
        rest.strip_suffix(')').map(str::trim)
    }

    /// Declared length of a `string(n)` field
    pub fn max_length(&self) -> Option<usize> {
        if self.base_type() != "string" {
            return None;
        }
        self.type_params()?.parse().ok()
    }

    pub fn display_name(&self) -> &str {
        self.external_name.as_deref().unwrap_or(&self.internal_name)
    }

    pub fn is_geometry(&self) -> bool {
        GEOMETRY_TYPES.contains(&self.base_type())
    }

    pub fn is_reference(&self) -> bool {
        REFERENCE_TYPES.contains(&self.base_type())
    }

    /// Target feature types of a reference field, e.g. `reference(pole,pole_top)`
    pub fn reference_targets(&self) -> Vec<&str> {
        if !self.is_reference() {
            return Vec::new();
        }
        self.type_params()
            .map(|params| {
                params
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_calculated(&self) -> bool {
        self.value.is_some()
    }

    pub fn calculated_value(&self) -> Option<CalculatedValue> {
        self.value.as_deref().and_then(CalculatedValue::parse)
    }

    pub fn is_visible(&self, properties: &Properties) -> bool {
        self.visible.evaluate(properties)
    }

    pub fn is_read_only(&self, properties: &Properties) -> bool {
        self.is_calculated() || self.read_only.evaluate(properties)
    }

    pub fn is_mandatory(&self, properties: &Properties) -> bool {
        self.mandatory.evaluate(properties)
    }

    /// Check the field's value within a feature
    pub fn validate(&self, properties: &Properties) -> Result<(), FieldValidationError> {
        let fail = |message: String| FieldValidationError {
            field: self.internal_name.clone(),
            message,
        };

        let value = properties.get(&self.internal_name).unwrap_or(&Value::Null);
        let empty = value.is_null() || value.as_str().is_some_and(|s| s.is_empty());

        if empty {
            return if self.is_mandatory(properties) {
                Err(fail("is mandatory".to_string()))
            } else {
                Ok(())
            };
        }

        if let Some(length) = self.max_length() {
            Validator::MaxLength { length }.check(value).map_err(fail)?;
        }

        if let Some(values) = &self.values {
            if !values.iter().any(|v| &v.value == value) {
                return Err(fail(format!("has a value not in the list: {}", value)));
            }
        }

        for validator in &self.validators {
            validator.check(value).map_err(fail)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> Properties {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_base_type_strips_parameters() {
        assert_eq!(FieldMetadata::new("name", "string(50)").base_type(), "string");
        assert_eq!(FieldMetadata::new("name", "string(50)").max_length(), Some(50));
        assert_eq!(FieldMetadata::new("id", "integer").base_type(), "integer");
        assert_eq!(FieldMetadata::new("id", "integer").type_params(), None);

        let reference = FieldMetadata::new("owner", "reference(pole, pole_top)");
        assert_eq!(reference.base_type(), "reference");
        assert!(reference.is_reference());
        assert_eq!(reference.reference_targets(), vec!["pole", "pole_top"]);
    }

    #[test]
    fn test_rules_from_json() {
        let field: FieldMetadata = serde_json::from_value(json!({
            "internal_name": "reason",
            "type": "string(100)",
            "visible": "[status]='Closed'",
            "read_only": false,
            "mandatory": "[status]='Closed' & [urgent]=true"
        }))
        .unwrap();

        let open = props(json!({"status": "Open", "urgent": true}));
        let closed = props(json!({"status": "Closed", "urgent": true}));
        let closed_quiet = props(json!({"status": "Closed", "urgent": false}));

        assert!(!field.is_visible(&open));
        assert!(field.is_visible(&closed));
        assert!(!field.is_read_only(&closed));
        assert!(field.is_mandatory(&closed));
        assert!(!field.is_mandatory(&closed_quiet));
        assert_eq!(field.mandatory.referenced_fields(), vec!["status", "urgent"]);
    }

    #[test]
    fn test_rule_defaults() {
        let field: FieldMetadata =
            serde_json::from_value(json!({"internal_name": "x", "type": "integer"})).unwrap();
        assert_eq!(field.visible, FieldRule::Always(true));
        assert_eq!(field.read_only, FieldRule::Always(false));
        assert_eq!(field.mandatory, FieldRule::Always(false));
    }

    #[test]
    fn test_calculated_fields_are_read_only() {
        let field = FieldMetadata::new("poles", "reference_set(pole)")
            .with_calculated_value("select(pole.substation)");
        assert!(field.is_read_only(&Properties::new()));
        assert_eq!(
            field.calculated_value(),
            Some(CalculatedValue::Select(vec![(
                "pole".to_string(),
                "substation".to_string()
            )]))
        );
        assert_eq!(
            CalculatedValue::parse("method(connected_cables)"),
            Some(CalculatedValue::Method("connected_cables".to_string()))
        );
        assert_eq!(CalculatedValue::parse("select()"), None);
        assert_eq!(CalculatedValue::parse("nonsense"), None);
    }

    #[test]
    fn test_validation() {
        let field = FieldMetadata::new("height", "double")
            .with_validator(Validator::Range {
                min: Some(0.0),
                max: Some(50.0),
            })
            .with_rules(FieldRule::always(), FieldRule::never(), FieldRule::always());

        assert!(field.validate(&props(json!({"height": 12.0}))).is_ok());
        let err = field.validate(&props(json!({"height": 60}))).unwrap_err();
        assert_eq!(err.to_string(), "height must be at most 50");
        let err = field.validate(&props(json!({}))).unwrap_err();
        assert_eq!(err.message, "is mandatory");
    }

    #[test]
    fn test_enumerator_and_length_validation() {
        let field = FieldMetadata::new("status", "string(6)").with_values(vec![
            EnumValue::new("Open"),
            EnumValue::new("Closed").with_display("Shut"),
        ]);
        assert!(field.validate(&props(json!({"status": "Open"}))).is_ok());
        assert!(field.validate(&props(json!({"status": "Pending"}))).is_err());
        assert!(field.validate(&props(json!({"status": "Closed!"}))).is_err());
        assert_eq!(field.values.as_ref().unwrap()[1].label(), "Shut");
    }
}
