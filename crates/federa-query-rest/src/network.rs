//! Network traces and delta change lists
//!
//! These are REST-only operations, reached through
//! `Datasource::source_as::<RestSource>()`.

use federa_query::types::id_to_string;
use federa_query::{FeatureRecord, FeatureRef, HttpRequest, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::source::{CollectionResponse, RestSource};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceDirection {
    #[default]
    Downstream,
    Upstream,
    Both,
}

impl TraceDirection {
    fn as_str(&self) -> &'static str {
        match self {
            TraceDirection::Downstream => "downstream",
            TraceDirection::Upstream => "upstream",
            TraceDirection::Both => "both",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceOptions {
    pub direction: TraceDirection,
    /// Stop after this distance along the network
    pub max_distance: Option<f64>,
    /// Only return features of these types; empty returns all
    pub result_types: Vec<String>,
    pub max_nodes: Option<usize>,
}

/// A feature reached by a trace, with its distance from the start
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceNode {
    pub record: FeatureRecord,
    pub distance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// One feature changed in a delta relative to the master data
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeltaChange {
    pub change_type: ChangeType,
    pub feature: FeatureRef,
    /// Delta version of the feature; absent for deletes
    pub record: Option<FeatureRecord>,
}

#[derive(Debug, Deserialize)]
struct RawChange {
    change_type: ChangeType,
    feature_type: String,
    id: Value,
    #[serde(default)]
    feature: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChangesResponse {
    #[serde(default)]
    changes: Vec<RawChange>,
}

fn trace_nodes(response: CollectionResponse) -> Vec<TraceNode> {
    RestSource::parse_collection(response, None, None)
        .features
        .into_iter()
        .map(|record| {
            let distance = record
                .property("distance")
                .and_then(Value::as_f64)
                .unwrap_or_default();
            TraceNode { record, distance }
        })
        .collect()
}

impl RestSource {
    /// Features reachable from `from` along `network`, nearest first
    pub async fn trace_out(
        &self,
        network: &str,
        from: &FeatureRef,
        options: &TraceOptions,
    ) -> Result<Vec<TraceNode>> {
        let mut request = HttpRequest::get(self.endpoint(&["network", network, "trace_out"])?)
            .query("from", from.urn())
            .query("direction", options.direction.as_str());
        if let Some(max_distance) = options.max_distance {
            request = request.query("max_dist", max_distance.to_string());
        }
        if let Some(max_nodes) = options.max_nodes {
            request = request.query("max_nodes", max_nodes.to_string());
        }
        if !options.result_types.is_empty() {
            request = request.query("types", options.result_types.join(","));
        }

        let response: CollectionResponse = self.fetch(request).await?;
        let mut nodes = trace_nodes(response);
        nodes.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        debug!("Trace from {} reached {} features", from, nodes.len());
        Ok(nodes)
    }

    /// Path from `from` to `to` along `network`, in path order
    pub async fn shortest_path(
        &self,
        network: &str,
        from: &FeatureRef,
        to: &FeatureRef,
        options: &TraceOptions,
    ) -> Result<Vec<TraceNode>> {
        let mut request = HttpRequest::get(self.endpoint(&["network", network, "shortest_path"])?)
            .query("from", from.urn())
            .query("to", to.urn());
        if !options.result_types.is_empty() {
            request = request.query("types", options.result_types.join(","));
        }

        let response: CollectionResponse = self.fetch(request).await?;
        Ok(trace_nodes(response))
    }

    /// Changes made in `delta`, optionally restricted to some feature types
    pub async fn delta_changes(&self, delta: &str, feature_types: &[String]) -> Result<Vec<DeltaChange>> {
        let mut request = HttpRequest::get(self.endpoint(&["delta", delta, "changes"])?);
        if !feature_types.is_empty() {
            request = request.query("types", feature_types.join(","));
        }

        // The delta is explicit here, so the active one is not attached
        let response: ChangesResponse = self.transport.get_json(request).await?;

        Ok(response
            .changes
            .into_iter()
            .filter_map(|change| {
                let Some(id) = id_to_string(&change.id) else {
                    warn!("Ignoring change of {} without id", change.feature_type);
                    return None;
                };
                let record = change.feature.and_then(|feature| {
                    FeatureRecord::from_geojson(feature, Some(&change.feature_type), None)
                        .map_err(|e| warn!("Ignoring malformed changed feature: {}", e))
                        .ok()
                });
                Some(DeltaChange {
                    change_type: change.change_type,
                    feature: FeatureRef::new(change.feature_type, id),
                    record,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::tests::create_source;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_trace_out_sorted_by_distance() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/network/electric/trace_out"))
            .and(query_param("from", "pole/1"))
            .and(query_param("direction", "upstream"))
            .and(query_param("max_dist", "250"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "features": [
                    {"feature_type": "pole", "id": 3, "properties": {"distance": 120.5}},
                    {"feature_type": "cable", "id": 9, "properties": {"distance": 40.0}},
                    {"feature_type": "pole", "id": 1, "properties": {"distance": 0}}
                ]
            })))
            .mount(&mock_server)
            .await;

        let source = create_source(&mock_server, Value::Null);
        let nodes = source
            .trace_out(
                "electric",
                &FeatureRef::new("pole", "1"),
                &TraceOptions {
                    direction: TraceDirection::Upstream,
                    max_distance: Some(250.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let order: Vec<String> = nodes.iter().map(|n| n.record.urn()).collect();
        assert_eq!(order, vec!["pole/1", "cable/9", "pole/3"]);
        assert_eq!(nodes[2].distance, 120.5);
    }

    #[tokio::test]
    async fn test_shortest_path_keeps_path_order() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/network/electric/shortest_path"))
            .and(query_param("to", "pole/4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "features": [
                    {"feature_type": "pole", "id": 1, "properties": {"distance": 0}},
                    {"feature_type": "cable", "id": 2, "properties": {"distance": 30}},
                    {"feature_type": "pole", "id": 4, "properties": {"distance": 60}}
                ]
            })))
            .mount(&mock_server)
            .await;

        let source = create_source(&mock_server, Value::Null);
        let path = source
            .shortest_path(
                "electric",
                &FeatureRef::new("pole", "1"),
                &FeatureRef::new("pole", "4"),
                &TraceOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(path.len(), 3);
        assert_eq!(path[1].record.urn(), "cable/2");
    }

    #[tokio::test]
    async fn test_delta_changes() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/delta/design_7/changes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "changes": [
                    {"change_type": "insert", "feature_type": "pole", "id": 40,
                     "feature": {"id": 40, "properties": {"height": 11}}},
                    {"change_type": "delete", "feature_type": "cable", "id": "c2"},
                    {"change_type": "update", "feature_type": "pole", "id": null}
                ]
            })))
            .mount(&mock_server)
            .await;

        let source = create_source(&mock_server, json!({"delta": "other"}));
        let changes = source.delta_changes("design_7", &[]).await.unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].change_type, ChangeType::Insert);
        assert_eq!(changes[0].record.as_ref().unwrap().urn(), "pole/40");
        assert_eq!(changes[1].feature.urn(), "cable/c2");
        assert!(changes[1].record.is_none());
    }
}
