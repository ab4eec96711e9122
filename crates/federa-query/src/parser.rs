//! Attribute query strings
//!
//! Clauses look like `[field] op value` and are joined with `&`:
//!
//! ```text
//! [status]='Open' & [height]>=12.5 & [urgent]=true & [owner]={user} & [removed]=null
//! ```
//!
//! Parsing is lenient: a clause that matches none of the known patterns is
//! dropped with a warning, never reported as an error.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::error::DataError;
use crate::types::Properties;

/// Comparison operator of a clause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "<>")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "like")]
    Like,
    #[serde(rename = "ilike")]
    ILike,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "<>",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Like => "like",
            Operator::ILike => "ilike",
        }
    }

    fn compare(&self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Operator::Eq => ordering == Equal,
            Operator::Ne => ordering != Equal,
            Operator::Lt => ordering == Less,
            Operator::Le => ordering != Greater,
            Operator::Gt => ordering == Greater,
            Operator::Ge => ordering != Less,
            Operator::Like | Operator::ILike => ordering == Equal,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "=" | "==" => Ok(Operator::Eq),
            "<>" | "!=" => Ok(Operator::Ne),
            "<" => Ok(Operator::Lt),
            "<=" => Ok(Operator::Le),
            ">" => Ok(Operator::Gt),
            ">=" => Ok(Operator::Ge),
            "like" => Ok(Operator::Like),
            "ilike" => Ok(Operator::ILike),
            other => Err(DataError::InvalidQuery(format!(
                "Unknown operator: {}",
                other
            ))),
        }
    }
}

/// Typed clause value, serialised as `{"type": ..., "value": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ClauseValue {
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    /// Placeholder resolved from session variables, written `{name}`
    Variable(String),
}

impl ClauseValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ClauseValue::Null)
    }

    /// JSON representation; unresolved variables render as their `{name}` text
    pub fn to_json(&self) -> Value {
        match self {
            ClauseValue::Null => Value::Null,
            ClauseValue::Boolean(b) => Value::Bool(*b),
            ClauseValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ClauseValue::String(s) => Value::String(s.clone()),
            ClauseValue::Variable(v) => Value::String(format!("{{{}}}", v)),
        }
    }

    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => ClauseValue::Null,
            Value::Bool(b) => ClauseValue::Boolean(*b),
            Value::Number(n) => n
                .as_f64()
                .map(ClauseValue::Number)
                .unwrap_or(ClauseValue::Null),
            Value::String(s) => ClauseValue::String(s.clone()),
            other => ClauseValue::String(other.to_string()),
        }
    }
}

impl fmt::Display for ClauseValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClauseValue::Null => write!(f, "null"),
            ClauseValue::Boolean(b) => write!(f, "{}", b),
            ClauseValue::Number(n) => write!(f, "{}", n),
            ClauseValue::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            ClauseValue::Variable(v) => write!(f, "{{{}}}", v),
        }
    }
}

/// A single field/operator/value filter condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryClause {
    pub field_name: String,
    pub operator: Operator,
    pub value: ClauseValue,
}

impl QueryClause {
    pub fn new(field_name: impl Into<String>, operator: Operator, value: ClauseValue) -> Self {
        Self {
            field_name: field_name.into(),
            operator,
            value,
        }
    }

    pub fn eq(field_name: impl Into<String>, value: impl Into<ClauseValue>) -> Self {
        Self::new(field_name, Operator::Eq, value.into())
    }

    /// Replace `{name}` placeholders with values from `variables`.
    /// Unknown variables are left in place.
    pub fn resolve_variables(&self, variables: &HashMap<String, Value>) -> Self {
        match &self.value {
            ClauseValue::Variable(name) => match variables.get(name) {
                Some(value) => Self::new(
                    self.field_name.clone(),
                    self.operator,
                    ClauseValue::from_json(value),
                ),
                None => self.clone(),
            },
            _ => self.clone(),
        }
    }

    /// Evaluate the clause against a set of feature properties
    pub fn matches(&self, properties: &Properties) -> bool {
        let actual = properties.get(&self.field_name).unwrap_or(&Value::Null);

        match &self.value {
            ClauseValue::Null => match self.operator {
                Operator::Eq => actual.is_null(),
                Operator::Ne => !actual.is_null(),
                _ => false,
            },
            ClauseValue::Boolean(expected) => {
                let actual = match actual {
                    Value::Bool(b) => Some(*b),
                    Value::Number(n) => n.as_f64().map(|n| n != 0.0),
                    Value::String(s) => s.parse::<bool>().ok(),
                    _ => None,
                };
                match (self.operator, actual) {
                    (Operator::Eq, Some(a)) => a == *expected,
                    (Operator::Ne, Some(a)) => a != *expected,
                    (Operator::Ne, None) => true,
                    _ => false,
                }
            }
            ClauseValue::Number(expected) => {
                let actual = match actual {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                };
                match actual.and_then(|a| a.partial_cmp(expected)) {
                    Some(ordering) => self.operator.compare(ordering),
                    None => self.operator == Operator::Ne,
                }
            }
            ClauseValue::String(expected) => {
                let actual = match actual {
                    Value::Null => return self.operator == Operator::Ne,
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                match self.operator {
                    Operator::Like => like_matches(expected, &actual, false),
                    Operator::ILike => like_matches(expected, &actual, true),
                    op => op.compare(actual.as_str().cmp(expected.as_str())),
                }
            }
            ClauseValue::Variable(name) => {
                debug!(
                    "Unresolved variable {{{}}} in clause on {}",
                    name, self.field_name
                );
                false
            }
        }
    }
}

impl fmt::Display for QueryClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} {}", self.field_name, self.operator, self.value)
    }
}

impl From<&str> for ClauseValue {
    fn from(s: &str) -> Self {
        ClauseValue::String(s.to_string())
    }
}

impl From<String> for ClauseValue {
    fn from(s: String) -> Self {
        ClauseValue::String(s)
    }
}

impl From<f64> for ClauseValue {
    fn from(n: f64) -> Self {
        ClauseValue::Number(n)
    }
}

impl From<i64> for ClauseValue {
    fn from(n: i64) -> Self {
        ClauseValue::Number(n as f64)
    }
}

impl From<bool> for ClauseValue {
    fn from(b: bool) -> Self {
        ClauseValue::Boolean(b)
    }
}

/// SQL-style `like` with `%` and `_` wildcards
fn like_matches(pattern: &str, value: &str, case_insensitive: bool) -> bool {
    let mut regex = String::from("^");
    for c in pattern.chars() {
        match c {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');

    RegexBuilder::new(&regex)
        .case_insensitive(case_insensitive)
        .dot_matches_new_line(true)
        .build()
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy)]
enum PatternKind {
    Null,
    String,
    Boolean,
    Variable,
    Number,
}

struct ClausePattern {
    kind: PatternKind,
    regex: Regex,
}

fn pattern(kind: PatternKind, source: &str) -> ClausePattern {
    ClausePattern {
        kind,
        regex: RegexBuilder::new(source)
            .case_insensitive(true)
            .build()
            .expect("clause pattern is a valid regex"),
    }
}

// Order matters: first match wins.
static PATTERNS: Lazy<Vec<ClausePattern>> = Lazy::new(|| {
    vec![
        pattern(
            PatternKind::Null,
            r"^\s*\[([^\]]+)\]\s*(<>|=)\s*null\s*$",
        ),
        pattern(
            PatternKind::String,
            r"^\s*\[([^\]]+)\]\s*(<>|<=|>=|=|<|>|ilike|like)\s*'(.*)'\s*$",
        ),
        pattern(
            PatternKind::Boolean,
            r"^\s*\[([^\]]+)\]\s*(<>|=)\s*(true|false)\s*$",
        ),
        pattern(
            PatternKind::Variable,
            r"^\s*\[([^\]]+)\]\s*(<>|<=|>=|=|<|>|ilike|like)\s*\{([^}]+)\}\s*$",
        ),
        pattern(
            PatternKind::Number,
            r"^\s*\[([^\]]+)\]\s*(<>|<=|>=|=|<|>)\s*([-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)\s*$",
        ),
    ]
});

/// Converts textual attribute queries into structured clauses
#[derive(Debug, Default, Clone, Copy)]
pub struct AttributeQueryParser;

impl AttributeQueryParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse an `&`-joined query string. Unrecognised clauses are dropped.
    pub fn parse(&self, query: &str) -> Vec<QueryClause> {
        query
            .split('&')
            .filter(|clause| !clause.trim().is_empty())
            .filter_map(|clause| {
                let parsed = self.parse_clause(clause);
                if parsed.is_none() {
                    warn!("Ignoring unrecognised attribute query clause: {}", clause);
                }
                parsed
            })
            .collect()
    }

    /// Parse a single clause; `None` if no pattern matches
    pub fn parse_clause(&self, clause: &str) -> Option<QueryClause> {
        PATTERNS.iter().find_map(|p| {
            let caps = p.regex.captures(clause)?;
            let field_name = caps.get(1)?.as_str().trim().to_string();
            let operator = caps.get(2)?.as_str().parse::<Operator>().ok()?;

            let value = match p.kind {
                PatternKind::Null => ClauseValue::Null,
                PatternKind::String => {
                    ClauseValue::String(caps.get(3)?.as_str().replace("''", "'"))
                }
                PatternKind::Boolean => {
                    ClauseValue::Boolean(caps.get(3)?.as_str().eq_ignore_ascii_case("true"))
                }
                PatternKind::Variable => {
                    ClauseValue::Variable(caps.get(3)?.as_str().trim().to_string())
                }
                PatternKind::Number => ClauseValue::Number(caps.get(3)?.as_str().parse().ok()?),
            };

            Some(QueryClause {
                field_name,
                operator,
                value,
            })
        })
    }
}

/// Shorthand for `AttributeQueryParser::new().parse(query)`
pub fn parse_attribute_query(query: &str) -> Vec<QueryClause> {
    AttributeQueryParser::new().parse(query)
}

/// Serialise clauses back into the `&`-joined query syntax
pub fn format_attribute_query(clauses: &[QueryClause]) -> String {
    clauses
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(" & ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> Properties {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_boolean_clause() {
        let clause = AttributeQueryParser::new()
            .parse_clause("[urgent]=true")
            .unwrap();
        assert_eq!(clause.field_name, "urgent");
        assert_eq!(clause.operator, Operator::Eq);
        assert_eq!(clause.value, ClauseValue::Boolean(true));
    }

    #[test]
    fn test_quoted_string_clause() {
        let clause = AttributeQueryParser::new()
            .parse_clause("[problem_type]='Wires Down'")
            .unwrap();
        assert_eq!(clause.field_name, "problem_type");
        assert_eq!(clause.operator, Operator::Eq);
        assert_eq!(clause.value, ClauseValue::String("Wires Down".to_string()));
    }

    #[test]
    fn test_numeric_clause_coerces_to_number() {
        let parser = AttributeQueryParser::new();
        let clause = parser.parse_clause("[height] >= 12.5").unwrap();
        assert_eq!(clause.operator, Operator::Ge);
        assert_eq!(clause.value, ClauseValue::Number(12.5));

        let clause = parser.parse_clause("[count]<-3").unwrap();
        assert_eq!(clause.operator, Operator::Lt);
        assert_eq!(clause.value, ClauseValue::Number(-3.0));
    }

    #[test]
    fn test_null_clause_has_no_value() {
        let parser = AttributeQueryParser::new();
        let clause = parser.parse_clause("[removed] = NULL").unwrap();
        assert_eq!(clause.operator, Operator::Eq);
        assert!(clause.value.is_null());

        let clause = parser.parse_clause("[removed]<>null").unwrap();
        assert_eq!(clause.operator, Operator::Ne);
        assert!(clause.value.is_null());
    }

    #[test]
    fn test_clause_value_serde_keeps_variables() {
        let clause = AttributeQueryParser::new()
            .parse_clause("[owner] = {user}")
            .unwrap();
        assert_eq!(clause.value, ClauseValue::Variable("user".to_string()));

        let json = serde_json::to_value(&clause).unwrap();
        assert_eq!(json["value"], serde_json::json!({"type": "variable", "value": "user"}));
        let back: QueryClause = serde_json::from_value(json).unwrap();
        assert_eq!(back, clause);

        let text: ClauseValue =
            serde_json::from_value(serde_json::json!({"type": "string", "value": "user"})).unwrap();
        assert_eq!(text, ClauseValue::String("user".to_string()));
        let null: ClauseValue = serde_json::from_value(serde_json::json!({"type": "null"})).unwrap();
        assert!(null.is_null());
    }

    #[test]
    fn test_quoted_null_is_a_string() {
        let clause = AttributeQueryParser::new()
            .parse_clause("[name]='null'")
            .unwrap();
        assert_eq!(clause.value, ClauseValue::String("null".to_string()));
    }

    #[test]
    fn test_variable_clause() {
        let clause = AttributeQueryParser::new()
            .parse_clause("[owner] = {user}")
            .unwrap();
        assert_eq!(clause.value, ClauseValue::Variable("user".to_string()));

        let mut vars = HashMap::new();
        vars.insert("user".to_string(), json!("alice"));
        let resolved = clause.resolve_variables(&vars);
        assert_eq!(resolved.value, ClauseValue::String("alice".to_string()));
    }

    #[test]
    fn test_like_operators() {
        let parser = AttributeQueryParser::new();
        let clause = parser.parse_clause("[name] ILIKE 'main%'").unwrap();
        assert_eq!(clause.operator, Operator::ILike);
        assert!(clause.matches(&props(json!({"name": "MAIN STREET"}))));

        let clause = parser.parse_clause("[name] like 'main%'").unwrap();
        assert_eq!(clause.operator, Operator::Like);
        assert!(!clause.matches(&props(json!({"name": "MAIN STREET"}))));
        assert!(clause.matches(&props(json!({"name": "main road"}))));
    }

    #[test]
    fn test_malformed_clauses_are_dropped() {
        let clauses =
            parse_attribute_query("[a]=1 & garbage & [b]='x' & [c] ~ 4 & & [d]=false");
        assert_eq!(clauses.len(), 3);
        assert_eq!(clauses[0].field_name, "a");
        assert_eq!(clauses[1].field_name, "b");
        assert_eq!(clauses[2].field_name, "d");
    }

    #[test]
    fn test_round_trip_through_display() {
        let source = "[status]='It''s open' & [height]>=2.5 & [urgent]=false & [owner]={user} & [removed]<>null & [name] ilike 'a%'";
        let clauses = parse_attribute_query(source);
        assert_eq!(clauses.len(), 6);

        let reparsed = parse_attribute_query(&format_attribute_query(&clauses));
        assert_eq!(reparsed, clauses);
        assert_eq!(
            clauses[0].value,
            ClauseValue::String("It's open".to_string())
        );
    }

    #[test]
    fn test_clause_evaluation() {
        let properties = props(json!({
            "status": "Open",
            "height": 12,
            "urgent": true,
            "removed": null
        }));
        for (query, expected) in [
            ("[status]='Open'", true),
            ("[status]<>'Open'", false),
            ("[height]>10", true),
            ("[height]<=11.9", false),
            ("[urgent]=true", true),
            ("[removed]=null", true),
            ("[status]=null", false),
            ("[missing]<>null", false),
        ] {
            let clause = AttributeQueryParser::new().parse_clause(query).unwrap();
            assert_eq!(clause.matches(&properties), expected, "{}", query);
        }
    }
}
