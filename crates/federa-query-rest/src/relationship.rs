//! Following reference fields to related features

use federa_query::field::CalculatedValue;
use federa_query::types::id_to_string;
use federa_query::{
    DataError, FeatureQuery, FeatureRecord, FeatureRef, FeatureSource, FeatureTypeDescriptor,
    HttpRequest, QueryClause, Result,
};
use futures::future::try_join_all;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use crate::source::{CollectionResponse, RestSource};

/// Urns held by a stored reference or reference-set value
fn stored_urns(value: &Value) -> Vec<FeatureRef> {
    match value {
        Value::String(s) => s
            .split(';')
            .map(str::trim)
            .filter_map(FeatureRef::parse_urn)
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .filter_map(FeatureRef::parse_urn)
            .collect(),
        _ => Vec::new(),
    }
}

impl RestSource {
    pub(crate) async fn related_features(
        &self,
        descriptor: &FeatureTypeDescriptor,
        record: &FeatureRecord,
        field: &str,
    ) -> Result<Vec<FeatureRecord>> {
        let metadata = descriptor.field(field).ok_or_else(|| {
            DataError::InvalidQuery(format!("Unknown field {}.{}", descriptor.name, field))
        })?;

        if let Some(calculated) = metadata.calculated_value() {
            return match calculated {
                CalculatedValue::Method(method) => {
                    debug!("Relationship {}.{} via method {}", descriptor.name, field, method);
                    self.server_relationship(descriptor, record, field).await
                }
                CalculatedValue::Select(targets) => self.referencing_features(record, &targets).await,
            };
        }

        let value = record.property(field).cloned().unwrap_or(Value::Null);
        match metadata.base_type() {
            "foreign_key" => {
                let target = metadata.reference_targets().first().copied().ok_or_else(|| {
                    DataError::InvalidQuery(format!("{}.{} has no target type", descriptor.name, field))
                })?;
                match id_to_string(&value) {
                    Some(id) => Ok(vec![
                        self.get_feature(&FeatureTypeDescriptor::new(target), &id).await?
                    ]),
                    None => Ok(Vec::new()),
                }
            }
            "reference" | "reference_set" => self.features_by_ref(&stored_urns(&value)).await,
            other => Err(DataError::InvalidQuery(format!(
                "{}.{} is a {} field, not a reference",
                descriptor.name, field, other
            ))),
        }
    }

    async fn server_relationship(
        &self,
        descriptor: &FeatureTypeDescriptor,
        record: &FeatureRecord,
        field: &str,
    ) -> Result<Vec<FeatureRecord>> {
        let response: CollectionResponse = self
            .fetch(HttpRequest::get(self.endpoint(&[
                "feature",
                &descriptor.name,
                &record.id,
                "relationship",
                field,
            ])?))
            .await?;
        Ok(Self::parse_collection(response, None, None).features)
    }

    /// Features of other types whose field holds this record's id
    async fn referencing_features(
        &self,
        record: &FeatureRecord,
        targets: &[(String, String)],
    ) -> Result<Vec<FeatureRecord>> {
        let queries = targets.iter().map(|(feature_type, field)| async move {
            let query = FeatureQuery::new().with_clause(QueryClause::eq(field.as_str(), record.id.as_str()));
            self.get_features(&FeatureTypeDescriptor::new(feature_type.as_str()), &query)
                .await
        });

        Ok(try_join_all(queries)
            .await?
            .into_iter()
            .flat_map(|c| c.features)
            .collect())
    }

    /// Fetch referenced features grouped by type, in reference order
    async fn features_by_ref(&self, refs: &[FeatureRef]) -> Result<Vec<FeatureRecord>> {
        if refs.is_empty() {
            return Ok(Vec::new());
        }

        let mut groups: Vec<(&str, Vec<String>)> = Vec::new();
        for r in refs {
            match groups.iter_mut().find(|(t, _)| *t == r.feature_type) {
                Some((_, ids)) => ids.push(r.id.clone()),
                None => groups.push((r.feature_type.as_str(), vec![r.id.clone()])),
            }
        }

        let fetches = groups.into_iter().map(|(feature_type, ids)| async move {
            self.get_features(
                &FeatureTypeDescriptor::new(feature_type),
                &FeatureQuery::new().with_ids(ids),
            )
            .await
        });

        let mut by_urn: HashMap<String, FeatureRecord> = try_join_all(fetches)
            .await?
            .into_iter()
            .flat_map(|c| c.features)
            .map(|record| (record.urn(), record))
            .collect();

        Ok(refs.iter().filter_map(|r| by_urn.remove(&r.urn())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::tests::create_source;
    use federa_query::FieldMetadata;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pole_dd() -> FeatureTypeDescriptor {
        FeatureTypeDescriptor::new("pole")
            .with_field(FieldMetadata::new("id", "integer").as_key())
            .with_field(FieldMetadata::new("owner_id", "foreign_key(company)"))
            .with_field(FieldMetadata::new("supports", "reference_set(cable,duct)"))
            .with_field(FieldMetadata::new("height", "double"))
            .with_field(
                FieldMetadata::new("cables", "reference_set(cable)").with_calculated_value("select(cable.pole_id)"),
            )
            .with_field(
                FieldMetadata::new("trays", "reference_set(tray)").with_calculated_value("method(trays)"),
            )
    }

    fn pole() -> FeatureRecord {
        FeatureRecord::new("pole", "5").with_properties(
            json!({
                "id": 5,
                "owner_id": 31,
                "supports": ["duct/2", "cable/8", "cable/7"],
                "height": 9
            })
            .as_object()
            .cloned()
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_foreign_key() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/feature/company/31"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": 31, "properties": {"name": "Grid Co"}})),
            )
            .mount(&mock_server)
            .await;

        let source = create_source(&mock_server, Value::Null);
        let related = source.related_features(&pole_dd(), &pole(), "owner_id").await.unwrap();
        assert_eq!(related[0].urn(), "company/31");
    }

    #[tokio::test]
    async fn test_stored_reference_set_keeps_order() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/feature/cable/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "features": [{"id": 7, "properties": {}}, {"id": 8, "properties": {}}]
            })))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/feature/duct/query"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"features": [{"id": 2, "properties": {}}]})),
            )
            .mount(&mock_server)
            .await;

        let source = create_source(&mock_server, Value::Null);
        let related = source.related_features(&pole_dd(), &pole(), "supports").await.unwrap();
        let urns: Vec<String> = related.iter().map(|r| r.urn()).collect();
        assert_eq!(urns, vec!["duct/2", "cable/8", "cable/7"]);
    }

    #[tokio::test]
    async fn test_calculated_relationships() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/feature/cable/query"))
            .and(body_partial_json(json!({"filter": "[pole_id] = '5'"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"features": [{"id": 70, "properties": {}}]})),
            )
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/feature/pole/5/relationship/trays"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "features": [{"feature_type": "tray", "id": 1, "properties": {}}]
            })))
            .mount(&mock_server)
            .await;

        let source = create_source(&mock_server, Value::Null);

        let cables = source.related_features(&pole_dd(), &pole(), "cables").await.unwrap();
        assert_eq!(cables[0].urn(), "cable/70");

        let trays = source.related_features(&pole_dd(), &pole(), "trays").await.unwrap();
        assert_eq!(trays[0].urn(), "tray/1");

        let err = source.related_features(&pole_dd(), &pole(), "height").await.unwrap_err();
        assert!(matches!(err, DataError::InvalidQuery(_)));
    }

    #[test]
    fn test_stored_urns() {
        assert_eq!(stored_urns(&json!("pole/1; pole/2")).len(), 2);
        assert_eq!(stored_urns(&json!(["a/1", "bad"])).len(), 1);
        assert!(stored_urns(&Value::Null).is_empty());
    }
}
