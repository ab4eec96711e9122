//! ArcGIS REST response shapes

use federa_query::transport::status_error;
use federa_query::{DataError, Properties, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// `{"error": {...}}` body, returned with HTTP 200 by most services
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EsriError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: Vec<String>,
}

impl EsriError {
    /// 498 invalid token, 499 token required
    pub fn is_token_error(&self) -> bool {
        matches!(self.code, 498 | 499)
    }

    pub fn is_get_disabled(&self) -> bool {
        std::iter::once(&self.message)
            .chain(&self.details)
            .any(|text| text.to_lowercase().contains("get is disabled"))
    }

    fn text(&self) -> String {
        if self.details.is_empty() {
            self.message.clone()
        } else {
            format!("{} ({})", self.message, self.details.join("; "))
        }
    }
}

impl From<EsriError> for DataError {
    fn from(error: EsriError) -> Self {
        if error.is_token_error() {
            return DataError::Unauthorized(error.text());
        }
        match u16::try_from(error.code) {
            Ok(status) => status_error(status, &error.text()),
            Err(_) => DataError::protocol(error.text()),
        }
    }
}

/// Query result row
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EsriFeature {
    #[serde(default)]
    pub attributes: Properties,
    #[serde(default)]
    pub geometry: Option<Value>,
}

/// Identify / find result row; attributes are keyed by field alias
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EsriResult {
    pub layer_id: u32,
    #[serde(default)]
    pub layer_name: String,
    #[serde(default)]
    pub display_field_name: Option<String>,
    #[serde(default)]
    pub found_field_name: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub attributes: Properties,
    #[serde(default)]
    pub geometry: Option<Value>,
}

impl EsriResult {
    /// Matched or display value as text
    pub fn label(&self) -> String {
        match &self.value {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }
}

/// Response of the query, identify, find and count operations.
/// Variants are distinguished by their required member.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum EsriResponse {
    Error {
        error: EsriError,
    },
    Results {
        results: Vec<EsriResult>,
    },
    Features {
        features: Vec<EsriFeature>,
        #[serde(default, rename = "exceededTransferLimit")]
        exceeded_transfer_limit: bool,
    },
    Count {
        count: u64,
    },
    /// `returnIdsOnly=true`; `objectIds` is null when nothing matches
    ObjectIds {
        #[serde(rename = "objectIdFieldName")]
        id_field: String,
        #[serde(default, rename = "objectIds")]
        object_ids: Option<Vec<i64>>,
    },
}

impl EsriResponse {
    pub fn parse(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| DataError::protocol(format!("Unexpected ArcGIS response: {}", e)))
    }

    pub fn into_features(self) -> Result<(Vec<EsriFeature>, bool)> {
        match self {
            EsriResponse::Features {
                features,
                exceeded_transfer_limit,
            } => Ok((features, exceeded_transfer_limit)),
            EsriResponse::Error { error } => Err(error.into()),
            other => Err(unexpected("features", &other)),
        }
    }

    pub fn into_results(self) -> Result<Vec<EsriResult>> {
        match self {
            EsriResponse::Results { results } => Ok(results),
            EsriResponse::Error { error } => Err(error.into()),
            other => Err(unexpected("results", &other)),
        }
    }

    pub fn into_count(self) -> Result<u64> {
        match self {
            EsriResponse::Count { count } => Ok(count),
            EsriResponse::Error { error } => Err(error.into()),
            other => Err(unexpected("count", &other)),
        }
    }

    pub fn into_object_ids(self) -> Result<Vec<i64>> {
        match self {
            EsriResponse::ObjectIds { object_ids, .. } => Ok(object_ids.unwrap_or_default()),
            EsriResponse::Error { error } => Err(error.into()),
            other => Err(unexpected("object ids", &other)),
        }
    }
}

fn unexpected(expected: &str, response: &EsriResponse) -> DataError {
    let found = match response {
        EsriResponse::Error { .. } => "error",
        EsriResponse::Results { .. } => "results",
        EsriResponse::Features { .. } => "features",
        EsriResponse::Count { .. } => "count",
        EsriResponse::ObjectIds { .. } => "object ids",
    };
    DataError::protocol(format!("Expected {} in ArcGIS response, got {}", expected, found))
}

/// Error object of a body, if it has one
pub fn body_error(value: &Value) -> Option<EsriError> {
    value
        .get("error")
        .and_then(|error| serde_json::from_value(error.clone()).ok())
}

/// Parse an info document (service, layer, token), surfacing `{"error"}` bodies
pub fn parse_reply<T: DeserializeOwned>(value: Value) -> Result<T> {
    if let Some(error) = body_error(&value) {
        return Err(error.into());
    }
    serde_json::from_value(value)
        .map_err(|e| DataError::protocol(format!("Unexpected ArcGIS response: {}", e)))
}

#[derive(Debug, Clone, Deserialize)]
pub struct LayerSummary {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    #[serde(default)]
    pub layers: Vec<LayerSummary>,
    #[serde(default)]
    pub tables: Vec<LayerSummary>,
    #[serde(default)]
    pub current_version: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CodedValue {
    pub name: String,
    pub code: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EsriDomain {
    #[serde(rename = "type")]
    pub domain_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "codedValues")]
    pub coded_values: Vec<CodedValue>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EsriField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub length: Option<usize>,
    #[serde(default)]
    pub editable: Option<bool>,
    #[serde(default)]
    pub nullable: Option<bool>,
    #[serde(default)]
    pub domain: Option<EsriDomain>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerInfo {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub geometry_type: Option<String>,
    #[serde(default)]
    pub object_id_field: Option<String>,
    #[serde(default)]
    pub display_field: Option<String>,
    #[serde(default)]
    pub capabilities: Option<String>,
    #[serde(default)]
    pub fields: Vec<EsriField>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub token: String,
    #[serde(default)]
    pub expires: Option<i64>,
}
