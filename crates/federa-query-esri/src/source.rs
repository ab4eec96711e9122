use async_trait::async_trait;
use federa_query::{
    BoxSelectionRequest, Bounds, Capability, ClauseValue, ConnectionConfig, DataError,
    FeatureCollection, FeatureQuery, FeatureRecord, FeatureSource, FeatureTypeDescriptor, Geometry,
    Operator, QueryClause, Result, SearchOptions, SearchSuggestion, SelectionRequest,
};
use futures::future::{join_all, try_join_all};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::client::{EsriQueryClient, Params};
use crate::config::{EsriConfig, ServiceKind};
use crate::geometry::{envelope, from_esri, to_esri, ESRI_ENVELOPE, ESRI_POINT, WGS84};
use crate::metadata::{descriptor_from_layer, LayerEntry, LayerIndex};
use crate::response::{EsriFeature, EsriResult};
use crate::sql::where_clause;

fn param(key: &str, value: impl Into<String>) -> (String, String) {
    (key.to_string(), value.into())
}

fn spatial_params(params: &mut Params, geometry_type: &str, geometry: serde_json::Value) {
    params.push(param("geometry", geometry.to_string()));
    params.push(param("geometryType", geometry_type));
    params.push(param("spatialRel", "esriSpatialRelIntersects"));
    params.push(param("inSR", WGS84.to_string()));
}

/// Concatenate the results of overlapping spatial parts in part order,
/// dropping repeated features, then apply the offset and limit
fn merge_parts(parts: Vec<FeatureCollection>, offset: usize, limit: Option<usize>) -> FeatureCollection {
    let mut more = false;
    let mut seen = HashSet::new();
    let mut features = Vec::new();
    for part in parts {
        more |= part.has_more;
        features.extend(part.features.into_iter().filter(|r| seen.insert(r.urn())));
    }

    let mut features: Vec<FeatureRecord> = features.into_iter().skip(offset).collect();
    if let Some(limit) = limit {
        if features.len() > limit {
            features.truncate(limit);
            more = true;
        }
    }
    FeatureCollection::with_pagination(features, None, more)
}

fn records(entry: &LayerEntry, features: Vec<EsriFeature>) -> Vec<FeatureRecord> {
    features
        .into_iter()
        .filter_map(|feature| {
            let geometry = feature.geometry.as_ref().and_then(from_esri);
            let record = entry.record(feature.attributes, geometry);
            if record.is_none() {
                warn!("Skipping {} row without {}", entry.feature_type, entry.key());
            }
            record
        })
        .collect()
}

/// ArcGIS MapServer / FeatureServer backend
pub struct EsriSource {
    client: EsriQueryClient,
    config: EsriConfig,
    kind: ServiceKind,
    index: RwLock<LayerIndex>,
}

impl EsriSource {
    pub fn new(connection: &ConnectionConfig) -> Result<Self> {
        let config: EsriConfig = connection.options_as()?;
        let kind = config
            .service_kind
            .or_else(|| ServiceKind::from_url(connection.base_url()))
            .unwrap_or(ServiceKind::MapServer);
        let client = EsriQueryClient::new(connection, &config)?;

        debug!("Creating ArcGIS {:?} source for {}", kind, connection.base_url());

        Ok(Self {
            client,
            config,
            kind,
            index: RwLock::new(LayerIndex::default()),
        })
    }

    pub fn client(&self) -> &EsriQueryClient {
        &self.client
    }

    pub fn service_kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn layer(&self, id: u32) -> Option<LayerEntry> {
        self.index.read().get(id).cloned()
    }

    fn layer_for_type(&self, feature_type: &str) -> Result<LayerEntry> {
        self.index
            .read()
            .layer_for_type(feature_type)
            .cloned()
            .ok_or_else(|| DataError::not_found(format!("No layer serves feature type {}", feature_type)))
    }

    /// Read layer info for layers not loaded yet; failures are logged and skipped
    async fn load_layers(&self, ids: &[u32]) {
        let missing = self.index.read().unloaded(ids);
        if missing.is_empty() {
            return;
        }
        let results = join_all(missing.iter().map(|id| self.client.layer_info(*id))).await;
        let mut index = self.index.write();
        for (id, result) in missing.iter().zip(results) {
            match result {
                Ok(info) => index.update(&info),
                Err(e) => warn!("Could not read layer {} of {}: {}", id, self.client.base_url(), e),
            }
        }
    }

    fn query_params(&self, entry: &LayerEntry, query: &FeatureQuery) -> Result<Params> {
        let mut params = vec![
            param("where", where_clause(&query.clauses)?),
            param("returnGeometry", query.include_geometry.to_string()),
            param("outSR", WGS84.to_string()),
        ];

        let out_fields = match &query.fields {
            Some(fields) if !fields.is_empty() => {
                let mut fields = fields.clone();
                if !fields.iter().any(|f| f == entry.key()) {
                    fields.insert(0, entry.key().to_string());
                }
                fields.join(",")
            }
            _ => "*".to_string(),
        };
        params.push(param("outFields", out_fields));

        if let Some(ids) = &query.ids {
            params.push(param("objectIds", ids.join(",")));
        }
        if !query.order_by.is_empty() {
            let order = query
                .order_by
                .iter()
                .map(|o| format!("{} {}", o.field, if o.descending { "DESC" } else { "ASC" }))
                .collect::<Vec<_>>()
                .join(",");
            params.push(param("orderByFields", order));
        }
        Ok(params)
    }

    /// Parameter sets for one query: one per simple geometry of a multi
    /// geometry filter, otherwise one (with the bounds filter if any)
    fn spatial_variants(&self, params: Params, query: &FeatureQuery) -> Vec<Params> {
        if let Some(geometry) = &query.geometry {
            return geometry
                .split()
                .iter()
                .map(|part| {
                    let mut params = params.clone();
                    let (geometry_type, value) = to_esri(part);
                    spatial_params(&mut params, geometry_type, value);
                    params
                })
                .collect();
        }

        let mut params = params;
        if let Some(bounds) = &query.bounds {
            spatial_params(&mut params, ESRI_ENVELOPE, envelope(bounds));
        }
        vec![params]
    }

    async fn query_layer(
        &self,
        entry: &LayerEntry,
        params: &Params,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<FeatureCollection> {
        let page = self.client.query(entry.id, params, offset, limit).await?;
        Ok(FeatureCollection::with_pagination(
            records(entry, page.features),
            None,
            page.has_more,
        ))
    }

    async fn envelope_query(&self, id: u32, bounds: &Bounds, limit: Option<usize>) -> Result<Vec<FeatureRecord>> {
        let entry = self
            .layer(id)
            .ok_or_else(|| DataError::not_found(format!("Unknown layer {}", id)))?;
        let mut params = vec![
            param("where", "1=1"),
            param("outFields", "*"),
            param("returnGeometry", "true"),
            param("outSR", WGS84.to_string()),
        ];
        spatial_params(&mut params, ESRI_ENVELOPE, envelope(bounds));
        Ok(self.query_layer(&entry, &params, 0, limit).await?.features)
    }

    /// Envelope query on every layer; failing layers are logged and skipped
    async fn envelope_fan_out(&self, ids: &[u32], bounds: &Bounds, limit: Option<usize>) -> Vec<FeatureRecord> {
        let results = join_all(ids.iter().map(|id| self.envelope_query(*id, bounds, limit))).await;
        ids.iter()
            .zip(results)
            .flat_map(|(id, result)| match result {
                Ok(records) => records,
                Err(e) => {
                    warn!("Selection on layer {} failed: {}", id, e);
                    Vec::new()
                }
            })
            .collect()
    }

    fn result_record(&self, result: EsriResult) -> Option<FeatureRecord> {
        let entry = self
            .layer(result.layer_id)
            .unwrap_or_else(|| LayerEntry::new(result.layer_id, &result.layer_name));
        let geometry = result.geometry.as_ref().and_then(from_esri);
        entry.record(result.attributes, geometry)
    }

    async fn identify(&self, request: &SelectionRequest, ids: &[u32]) -> Result<Vec<FeatureRecord>> {
        let extent = request.map_extent.unwrap_or_else(|| request.tolerance_bounds());
        let resolution = request.resolution();
        let width = (extent.width() / resolution).round().max(1.0);
        let height = (extent.height() / resolution).round().max(1.0);
        let layer_ids = ids.iter().map(u32::to_string).collect::<Vec<_>>().join(",");

        let params = vec![
            param("geometry", json!({"x": request.x(), "y": request.y()}).to_string()),
            param("geometryType", ESRI_POINT),
            param("sr", WGS84.to_string()),
            param("layers", format!("all:{}", layer_ids)),
            param("tolerance", request.pixel_tolerance.to_string()),
            param("mapExtent", extent.to_bbox_string()),
            param("imageDisplay", format!("{},{},96", width, height)),
            param("returnGeometry", "true"),
        ];

        let results = self.client.identify(&params).await?;
        Ok(results.into_iter().filter_map(|r| self.result_record(r)).collect())
    }

    async fn find(&self, text: &str, options: &SearchOptions, ids: &[u32]) -> Result<Vec<SearchSuggestion>> {
        let (layer_ids, search_fields) = {
            let index = self.index.read();
            let mut fields: Vec<String> = Vec::new();
            for id in ids {
                for field in index.get(*id).map(|l| l.string_fields.clone()).unwrap_or_default() {
                    if !fields.contains(&field) {
                        fields.push(field);
                    }
                }
            }
            (
                ids.iter().map(u32::to_string).collect::<Vec<_>>().join(","),
                fields,
            )
        };

        let mut params = vec![
            param("searchText", text),
            param("contains", "true"),
            param("layers", layer_ids),
            param("returnGeometry", "false"),
            param("sr", WGS84.to_string()),
        ];
        if !search_fields.is_empty() {
            params.push(param("searchFields", search_fields.join(",")));
        }

        let results = self.client.find(&params).await?;
        Ok(results
            .into_iter()
            .filter_map(|result| {
                let label = format!("{}: {}", result.layer_name, result.label());
                let record = self.result_record(result)?;
                Some(SearchSuggestion::Feature {
                    label,
                    feature_type: record.feature_type,
                    id: record.id,
                })
            })
            .take(options.limit)
            .collect())
    }

    /// Display-field `LIKE` query per layer, for services without `find`
    async fn search_layers(&self, text: &str, options: &SearchOptions, ids: &[u32]) -> Vec<SearchSuggestion> {
        let searches = ids.iter().filter_map(|id| {
            let entry = self.layer(*id)?;
            let field = entry
                .display_field
                .clone()
                .or_else(|| entry.string_fields.first().cloned())?;
            let query = FeatureQuery {
                bounds: options.bounds,
                include_geometry: false,
                limit: Some(options.limit),
                ..FeatureQuery::new().with_clause(QueryClause::new(
                    field.as_str(),
                    Operator::ILike,
                    ClauseValue::String(format!("%{}%", text)),
                ))
            };
            Some(async move {
                let params = self.query_params(&entry, &query)?;
                let params = self.spatial_variants(params, &query).remove(0);
                let collection = self.query_layer(&entry, &params, 0, query.limit).await?;
                Ok::<_, DataError>(
                    collection
                        .features
                        .into_iter()
                        .map(|record| SearchSuggestion::Feature {
                            label: format!(
                                "{}: {}",
                                entry.name,
                                record
                                    .property(&field)
                                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                                    .unwrap_or_default()
                            ),
                            feature_type: record.feature_type,
                            id: record.id,
                        })
                        .collect::<Vec<_>>(),
                )
            })
        });

        join_all(searches)
            .await
            .into_iter()
            .flat_map(|result| match result {
                Ok(suggestions) => suggestions,
                Err(e) => {
                    warn!("Search on {} failed: {}", self.client.base_url(), e);
                    Vec::new()
                }
            })
            .take(options.limit)
            .collect()
    }

    fn target_layers(&self, layers: &[String], feature_types: &[String]) -> Vec<u32> {
        self.index.read().select(layers, feature_types)
    }
}

#[async_trait]
impl FeatureSource for EsriSource {
    fn source_type(&self) -> &'static str {
        "esri"
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::Query, Capability::Selection, Capability::Search]
    }

    fn requires_login(&self) -> bool {
        self.client.uses_token()
    }

    async fn login(&self) -> Result<()> {
        self.client.generate_token().await
    }

    async fn initialise(&self) -> Result<()> {
        let info = self.client.service_info().await?;
        let mut index = self.index.write();
        for layer in info.layers.iter().chain(&info.tables) {
            if self.config.layers.is_empty() || self.config.layers.contains(&layer.id) {
                index.insert(LayerEntry::new(layer.id, &layer.name));
            }
        }
        info!(
            "ArcGIS service {} offers {} layers",
            self.client.base_url(),
            index.ids().len()
        );
        Ok(())
    }

    async fn list_feature_types(&self) -> Result<Vec<String>> {
        Ok(self.index.read().feature_types())
    }

    async fn fetch_metadata(&self, feature_types: &[String]) -> Result<Vec<FeatureTypeDescriptor>> {
        let ids: Vec<u32> = {
            let index = self.index.read();
            feature_types
                .iter()
                .filter_map(|t| index.layer_for_type(t).map(|l| l.id))
                .collect()
        };

        let infos = try_join_all(ids.iter().map(|id| self.client.layer_info(*id))).await?;
        let mut index = self.index.write();
        Ok(infos
            .iter()
            .map(|info| {
                index.update(info);
                descriptor_from_layer(info)
            })
            .collect())
    }

    async fn get_feature(&self, descriptor: &FeatureTypeDescriptor, id: &str) -> Result<FeatureRecord> {
        let entry = self.layer_for_type(&descriptor.name)?;
        let params = vec![
            param("objectIds", id),
            param("outFields", "*"),
            param("returnGeometry", "true"),
            param("outSR", WGS84.to_string()),
        ];
        self.query_layer(&entry, &params, 0, Some(1))
            .await?
            .features
            .into_iter()
            .next()
            .ok_or_else(|| DataError::not_found(format!("{}/{}", descriptor.name, id)))
    }

    async fn get_features(
        &self,
        descriptor: &FeatureTypeDescriptor,
        query: &FeatureQuery,
    ) -> Result<FeatureCollection> {
        let entry = self.layer_for_type(&descriptor.name)?;
        let variants = self.spatial_variants(self.query_params(&entry, query)?, query);
        let offset = query.offset.unwrap_or_default();

        let fetch = async {
            if let [params] = variants.as_slice() {
                return self.query_layer(&entry, params, offset, query.limit).await;
            }
            // Parts may overlap, so each is read from the start and the
            // window is applied to the merged result
            let window = query.limit.map(|limit| offset + limit);
            let parts = try_join_all(
                variants
                    .iter()
                    .map(|params| self.query_layer(&entry, params, 0, window)),
            )
            .await?;
            Ok::<_, DataError>(merge_parts(parts, offset, query.limit))
        };

        if query.include_total {
            let (mut collection, total) = futures::try_join!(fetch, self.count(descriptor, query))?;
            collection.total_count = Some(total);
            Ok(collection)
        } else {
            fetch.await
        }
    }

    async fn count(&self, descriptor: &FeatureTypeDescriptor, query: &FeatureQuery) -> Result<u64> {
        let entry = self.layer_for_type(&descriptor.name)?;
        let variants = self.spatial_variants(self.query_params(&entry, query)?, query);
        if let [params] = variants.as_slice() {
            return self.client.count(entry.id, params).await;
        }

        let ids = try_join_all(
            variants
                .iter()
                .map(|params| self.client.object_ids(entry.id, params)),
        )
        .await?;
        let distinct: HashSet<i64> = ids.into_iter().flatten().collect();
        Ok(distinct.len() as u64)
    }

    async fn select(&self, request: &SelectionRequest) -> Result<Vec<FeatureRecord>> {
        let ids = self.target_layers(&request.layers, &request.feature_types);
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.load_layers(&ids).await;

        let mut records = match self.kind {
            ServiceKind::MapServer => self.identify(request, &ids).await?,
            ServiceKind::FeatureServer => {
                self.envelope_fan_out(&ids, &request.tolerance_bounds(), request.limit)
                    .await
            }
        };
        if let Some(limit) = request.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn select_box(&self, request: &BoxSelectionRequest) -> Result<Vec<FeatureRecord>> {
        let ids = self.target_layers(&request.layers, &request.feature_types);
        self.load_layers(&ids).await;

        let mut records = self.envelope_fan_out(&ids, &request.bounds, request.limit).await;
        if let Some(limit) = request.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn run_search(&self, text: &str, options: &SearchOptions) -> Result<Vec<SearchSuggestion>> {
        let ids = self.target_layers(&[], &options.feature_types);
        if ids.is_empty() || text.trim().is_empty() {
            return Ok(Vec::new());
        }
        self.load_layers(&ids).await;

        match self.kind {
            ServiceKind::MapServer => self.find(text, options, &ids).await,
            ServiceKind::FeatureServer => Ok(self.search_layers(text, options, &ids).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::ESRI_POLYGON;
    use crate::metadata::tests::poles_layer;
    use federa_query::Datasource;
    use serde_json::Value;
    use std::sync::Arc;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    const SERVICE: &str = "/arcgis/rest/services/Network/MapServer";

    fn cables_layer() -> Value {
        json!({
            "id": 1,
            "name": "Cables",
            "geometryType": "esriGeometryPolyline",
            "objectIdField": "FID",
            "displayField": "LABEL",
            "fields": [
                {"name": "FID", "type": "esriFieldTypeOID", "alias": "FID"},
                {"name": "LABEL", "type": "esriFieldTypeString", "alias": "Label", "length": 20}
            ]
        })
    }

    async fn mount_service(mock_server: &MockServer, service: &str) {
        Mock::given(method("GET"))
            .and(path(service.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "currentVersion": 10.91,
                "layers": [{"id": 0, "name": "Street Poles"}, {"id": 1, "name": "Cables"}]
            })))
            .mount(mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{}/0", service)))
            .respond_with(ResponseTemplate::new(200).set_body_json(poles_layer()))
            .mount(mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{}/1", service)))
            .respond_with(ResponseTemplate::new(200).set_body_json(cables_layer()))
            .mount(mock_server)
            .await;
    }

    fn source(mock_server: &MockServer, service: &str) -> EsriSource {
        EsriSource::new(&ConnectionConfig::new(
            "assets",
            "esri",
            format!("{}{}", mock_server.uri(), service),
        ))
        .unwrap()
    }

    fn query_value(request: &Request, key: &str) -> Option<String> {
        request
            .url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    #[tokio::test]
    async fn test_metadata_and_filtered_query() {
        let mock_server = MockServer::start().await;
        mount_service(&mock_server, SERVICE).await;
        Mock::given(method("GET"))
            .and(path(format!("{}/0/query", SERVICE)))
            .and(query_param("where", "HEIGHT > 10"))
            .and(query_param("geometryType", ESRI_ENVELOPE))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "features": [
                    {"attributes": {"OBJECTID": 4, "NAME": "P4", "HEIGHT": 12},
                     "geometry": {"x": 5.0, "y": 52.0}}
                ]
            })))
            .mount(&mock_server)
            .await;

        let ds = Datasource::new("assets", Arc::new(source(&mock_server, SERVICE)));
        let list = ds
            .get_features(
                "street_poles",
                &FeatureQuery::new()
                    .with_clauses(federa_query::parse_attribute_query("[HEIGHT] > 10"))
                    .with_bounds(Bounds::new(4.0, 51.0, 6.0, 53.0)),
            )
            .await
            .unwrap();

        assert_eq!(list.features.len(), 1);
        let pole = &list.features[0];
        assert_eq!(pole.urn(), "street_poles/4");
        assert_eq!(pole.title(), "P4");
        assert_eq!(pole.geometry(), Some(&Geometry::point(5.0, 52.0)));
    }

    #[tokio::test]
    async fn test_multi_geometry_split_in_order() {
        let mock_server = MockServer::start().await;
        mount_service(&mock_server, SERVICE).await;
        for (x, id) in [(1.0, 10), (2.0, 20)] {
            Mock::given(method("GET"))
                .and(path(format!("{}/0/query", SERVICE)))
                .and(move |request: &Request| {
                    query_value(request, "geometryType").as_deref() == Some(ESRI_POINT)
                        && query_value(request, "geometry")
                            .is_some_and(|g| g.contains(&format!("\"x\":{:?}", x)))
                })
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "features": [{"attributes": {"OBJECTID": id}}]
                })))
                .expect(1)
                .mount(&mock_server)
                .await;
        }

        let ds = Datasource::new("assets", Arc::new(source(&mock_server, SERVICE)));
        let query = FeatureQuery::new()
            .with_geometry(Geometry::MultiPoint(vec![vec![2.0, 0.0], vec![1.0, 0.0]]));
        let list = ds.get_features("street_poles", &query).await.unwrap();

        let ids: Vec<&str> = list.features.iter().map(|f| f.id()).collect();
        assert_eq!(ids, vec!["20", "10"]);
    }

    fn square(x: f64) -> Vec<Vec<Vec<f64>>> {
        vec![vec![
            vec![x, 0.0],
            vec![x + 1.0, 0.0],
            vec![x + 1.0, 1.0],
            vec![x, 1.0],
            vec![x, 0.0],
        ]]
    }

    /// Answers polygon queries of the square starting at `x` with `ids`
    async fn mount_part(mock_server: &MockServer, x: f64, ids: Value, object_ids: Value) {
        let marker = format!("[{:?},", x);
        let feature_marker = marker.clone();
        Mock::given(method("GET"))
            .and(path(format!("{}/0/query", SERVICE)))
            .and(move |request: &Request| {
                query_value(request, "geometryType").as_deref() == Some(ESRI_POLYGON)
                    && query_value(request, "returnIdsOnly").is_none()
                    && query_value(request, "geometry").is_some_and(|g| g.contains(&feature_marker))
            })
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "features": ids })))
            .mount(mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{}/0/query", SERVICE)))
            .and(query_param("returnIdsOnly", "true"))
            .and(move |request: &Request| {
                query_value(request, "geometry").is_some_and(|g| g.contains(&marker))
            })
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "objectIdFieldName": "OBJECTID",
                "objectIds": object_ids
            })))
            .mount(mock_server)
            .await;
    }

    #[tokio::test]
    async fn test_multi_polygon_parts_respect_limit() {
        let mock_server = MockServer::start().await;
        mount_service(&mock_server, SERVICE).await;
        mount_part(&mock_server, 10.0, json!([{"attributes": {"OBJECTID": 1}}]), json!([1])).await;
        mount_part(&mock_server, 20.0, json!([{"attributes": {"OBJECTID": 2}}]), json!([2])).await;

        let ds = Datasource::new("assets", Arc::new(source(&mock_server, SERVICE)));
        let query = FeatureQuery::new()
            .with_geometry(Geometry::MultiPolygon(vec![square(10.0), square(20.0)]))
            .with_limit(1);
        let list = ds.get_features("street_poles", &query).await.unwrap();

        let ids: Vec<&str> = list.features.iter().map(|f| f.id()).collect();
        assert_eq!(ids, vec!["1"]);
        assert!(list.has_more);
    }

    #[tokio::test]
    async fn test_overlapping_parts_are_merged_once() {
        let mock_server = MockServer::start().await;
        mount_service(&mock_server, SERVICE).await;
        mount_part(
            &mock_server,
            10.0,
            json!([{"attributes": {"OBJECTID": 1}}, {"attributes": {"OBJECTID": 2}}]),
            json!([1, 2]),
        )
        .await;
        mount_part(
            &mock_server,
            20.0,
            json!([{"attributes": {"OBJECTID": 2}}, {"attributes": {"OBJECTID": 3}}]),
            json!([2, 3]),
        )
        .await;

        let ds = Datasource::new("assets", Arc::new(source(&mock_server, SERVICE)));
        let query = FeatureQuery::new()
            .with_geometry(Geometry::MultiPolygon(vec![square(10.0), square(20.0)]));

        let list = ds.get_features("street_poles", &query).await.unwrap();
        let ids: Vec<&str> = list.features.iter().map(|f| f.id()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert!(!list.has_more);

        let page = ds
            .get_features("street_poles", &query.clone().with_offset(1).with_limit(1))
            .await
            .unwrap();
        let ids: Vec<&str> = page.features.iter().map(|f| f.id()).collect();
        assert_eq!(ids, vec!["2"]);

        assert_eq!(ds.count("street_poles", &query).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_identify_select_on_map_server() {
        let mock_server = MockServer::start().await;
        mount_service(&mock_server, SERVICE).await;
        Mock::given(method("GET"))
            .and(path(format!("{}/identify", SERVICE)))
            .and(query_param("layers", "all:0,1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    {"layerId": 0, "layerName": "Street Poles", "value": "P1",
                     "attributes": {"Object ID": "1", "Pole Name": "P1"},
                     "geometry": {"x": 1.0, "y": 1.0}},
                    {"layerId": 1, "layerName": "Cables", "value": "C7",
                     "attributes": {"FID": "7", "Label": "C7"},
                     "geometry": {"paths": [[[0.0, 0.0], [2.0, 2.0]]]}},
                    {"layerId": 9, "layerName": "Unknown", "attributes": {"OBJECTID": "3"}}
                ]
            })))
            .mount(&mock_server)
            .await;

        let ds = Datasource::new("assets", Arc::new(source(&mock_server, SERVICE)));
        let features = ds.select(&SelectionRequest::at(1.0, 1.0, 18)).await.unwrap();

        // Records of types without metadata are dropped by the datasource
        let urns: Vec<String> = features.iter().map(|f| f.urn()).collect();
        assert_eq!(urns, vec!["street_poles/1", "cables/7"]);
        assert_eq!(features[0].property("NAME"), Some(&json!("P1")));
        assert_eq!(features[1].title(), "C7");
    }

    #[tokio::test]
    async fn test_box_selection_on_feature_server_is_best_effort() {
        let service = "/arcgis/rest/services/Network/FeatureServer";
        let mock_server = MockServer::start().await;
        mount_service(&mock_server, service).await;
        Mock::given(method("GET"))
            .and(path(format!("{}/0/query", service)))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{}/1/query", service)))
            .and(query_param("geometryType", ESRI_ENVELOPE))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "features": [{"attributes": {"FID": 2, "LABEL": "C2"}}]
            })))
            .mount(&mock_server)
            .await;

        let source = source(&mock_server, service);
        assert_eq!(source.service_kind(), ServiceKind::FeatureServer);
        source.initialise().await.unwrap();

        let records = source
            .select_box(&BoxSelectionRequest::new(Bounds::new(0.0, 0.0, 1.0, 1.0), 16))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].urn(), "cables/2");
    }

    #[tokio::test]
    async fn test_find_search() {
        let mock_server = MockServer::start().await;
        mount_service(&mock_server, SERVICE).await;
        Mock::given(method("GET"))
            .and(path(format!("{}/find", SERVICE)))
            .and(query_param("searchText", "P1"))
            .and(query_param("searchFields", "NAME,MATERIAL,LABEL"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    {"layerId": 0, "layerName": "Street Poles", "value": "P1",
                     "attributes": {"Object ID": 1}},
                    {"layerId": 0, "layerName": "Street Poles", "value": "P12",
                     "attributes": {"Object ID": 12}}
                ]
            })))
            .mount(&mock_server)
            .await;

        let source = source(&mock_server, SERVICE);
        source.initialise().await.unwrap();
        let suggestions = source
            .run_search("P1", &SearchOptions { limit: 1, ..Default::default() })
            .await
            .unwrap();

        assert_eq!(
            suggestions,
            vec![SearchSuggestion::Feature {
                label: "Street Poles: P1".to_string(),
                feature_type: "street_poles".to_string(),
                id: "1".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_get_feature_not_found_and_count() {
        let mock_server = MockServer::start().await;
        mount_service(&mock_server, SERVICE).await;
        Mock::given(method("GET"))
            .and(path(format!("{}/0/query", SERVICE)))
            .and(query_param("returnCountOnly", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": 77})))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{}/0/query", SERVICE)))
            .and(query_param("objectIds", "404"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"features": []})))
            .mount(&mock_server)
            .await;

        let ds = Datasource::new("assets", Arc::new(source(&mock_server, SERVICE)));
        assert_eq!(ds.count("street_poles", &FeatureQuery::new()).await.unwrap(), 77);

        let err = ds.get_feature("street_poles", "404").await.unwrap_err();
        assert!(matches!(err, DataError::ObjectNotFound(_)));
        assert_eq!(ds.state(), federa_query::DatasourceState::Ok);
    }
}
