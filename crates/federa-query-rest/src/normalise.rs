//! Value normalisation applied before every write
//!
//! Calculated fields are never sent. Dates and timestamps are rendered in
//! the server's fixed formats and numeric strings are coerced for numeric
//! fields.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use federa_query::{
    DataError, FeatureData, FeatureRef, FeatureTypeDescriptor, MetadataMap, Properties, Result,
    TransactionOp,
};
use serde_json::{Number, Value};
use tracing::debug;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

fn parse_datetime(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.naive_utc())
                .or_else(|_| NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT))
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
                .ok()
                .or_else(|| {
                    NaiveDate::parse_from_str(s, DATE_FORMAT)
                        .ok()
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                })
        }
        // Epoch milliseconds
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|dt| dt.naive_utc()),
        _ => None,
    }
}

fn coerce_number(value: &Value, integer: bool) -> Option<Value> {
    let Value::String(s) = value else {
        return None;
    };
    let s = s.trim();
    if integer {
        s.parse::<i64>().ok().map(Value::from)
    } else {
        s.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
    }
}

fn normalise_value(field: &str, base_type: &str, value: Value) -> Result<Value> {
    if value.is_null() {
        return Ok(value);
    }

    match base_type {
        "date" => parse_datetime(&value)
            .map(|dt| Value::String(dt.format(DATE_FORMAT).to_string()))
            .ok_or_else(|| DataError::bad_request(format!("Invalid date for {}: {}", field, value))),
        "timestamp" => parse_datetime(&value)
            .map(|dt| Value::String(dt.format(TIMESTAMP_FORMAT).to_string()))
            .ok_or_else(|| {
                DataError::bad_request(format!("Invalid timestamp for {}: {}", field, value))
            }),
        "integer" => match &value {
            Value::String(s) if s.trim().is_empty() => Ok(Value::Null),
            Value::String(_) => coerce_number(&value, true).ok_or_else(|| {
                DataError::bad_request(format!("Invalid integer for {}: {}", field, value))
            }),
            _ => Ok(value),
        },
        "double" | "numeric" => match &value {
            Value::String(s) if s.trim().is_empty() => Ok(Value::Null),
            Value::String(_) => coerce_number(&value, false).ok_or_else(|| {
                DataError::bad_request(format!("Invalid number for {}: {}", field, value))
            }),
            _ => Ok(value),
        },
        _ => Ok(value),
    }
}

/// Prepare properties of one feature type for sending
pub fn normalise_properties(
    descriptor: &FeatureTypeDescriptor,
    properties: &Properties,
) -> Result<Properties> {
    let mut normalised = Properties::new();
    for (name, value) in properties {
        match descriptor.field(name) {
            Some(field) if field.is_calculated() => {
                debug!("Dropping calculated field {}.{}", descriptor.name, name);
            }
            Some(field) => {
                let value = normalise_value(name, field.base_type(), value.clone())?;
                normalised.insert(name.clone(), value);
            }
            None => {
                normalised.insert(name.clone(), value.clone());
            }
        }
    }
    Ok(normalised)
}

pub fn normalise_data(descriptor: &FeatureTypeDescriptor, data: &FeatureData) -> Result<FeatureData> {
    Ok(FeatureData {
        properties: normalise_properties(descriptor, &data.properties)?,
        ..data.clone()
    })
}

pub fn normalise_transaction_op(op: &TransactionOp, descriptors: &MetadataMap) -> Result<TransactionOp> {
    let descriptor = |feature_type: &str| {
        descriptors
            .get(feature_type)
            .ok_or_else(|| DataError::MissingMetadata(vec![feature_type.to_string()]))
    };

    Ok(match op {
        TransactionOp::Insert(data) => {
            TransactionOp::Insert(normalise_data(descriptor(&data.feature_type)?, data)?)
        }
        TransactionOp::Update(data) => {
            TransactionOp::Update(normalise_data(descriptor(&data.feature_type)?, data)?)
        }
        TransactionOp::Delete { .. } => op.clone(),
    })
}

/// Check that `properties` can be applied to every target type, then
/// normalise them against the first type
pub fn validate_bulk_update(
    targets: &[FeatureRef],
    properties: &Properties,
    descriptors: &MetadataMap,
) -> Result<Properties> {
    if targets.is_empty() {
        return Err(DataError::bad_request("Bulk update without features"));
    }

    let mut types: Vec<&str> = Vec::new();
    for target in targets {
        if !types.contains(&target.feature_type.as_str()) {
            types.push(&target.feature_type);
        }
    }

    let involved = types
        .iter()
        .map(|t| {
            descriptors
                .get(*t)
                .map(|d| d.as_ref())
                .ok_or_else(|| DataError::MissingMetadata(vec![t.to_string()]))
        })
        .collect::<Result<Vec<&FeatureTypeDescriptor>>>()?;

    for name in properties.keys() {
        let mut base_type: Option<&str> = None;
        for descriptor in &involved {
            let field = descriptor.field(name).ok_or_else(|| {
                DataError::bad_request(format!("{} has no field {}", descriptor.name, name))
            })?;
            if field.is_geometry() {
                return Err(DataError::bad_request(format!(
                    "Geometry field {} cannot be bulk updated",
                    name
                )));
            }
            match base_type {
                None => base_type = Some(field.base_type()),
                Some(existing) if existing != field.base_type() => {
                    return Err(DataError::bad_request(format!(
                        "Field {} has different types ({} and {})",
                        name,
                        existing,
                        field.base_type()
                    )));
                }
                Some(_) => {}
            }
        }
    }

    normalise_properties(involved[0], properties)
}
