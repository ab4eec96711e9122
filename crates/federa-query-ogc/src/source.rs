use async_trait::async_trait;
use federa_query::{
    BoxSelectionRequest, Bounds, Capability, ConnectionConfig, Credentials, DataError,
    FeatureCollection, FeatureQuery, FeatureRecord, FeatureSource, FeatureTypeDescriptor,
    HttpRequest, HttpResponse, RequestTransport, Result, SearchOptions, SearchSuggestion,
    SelectionRequest,
};
use futures::future::{join_all, try_join_all};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::config::OgcConfig;
use crate::filter::{equals_any, filter_params, search_filter};
use crate::metadata::{descriptor_from_schema, feature_id, record_from_geojson};
use crate::wms::WmsService;
use crate::xml::{
    exception_error, parse_capabilities, parse_hits, parse_schema, probe_authenticated,
    FeatureTypeSummary,
};

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

const FALLBACK_GEOMETRY_FIELD: &str = "the_geom";

type Params = Vec<(String, String)>;

fn param(key: &str, value: impl Into<String>) -> (String, String) {
    (key.to_string(), value.into())
}

fn looks_like_xml(body: &str) -> bool {
    body.trim_start().starts_with('<')
}

/// GeoJSON page of a `GetFeature` response
struct WfsPage {
    records: Vec<FeatureRecord>,
    number_matched: Option<u64>,
}

/// OGC WFS (features) and WMS (maps) backend
pub struct OgcSource {
    transport: RequestTransport,
    config: OgcConfig,
    wfs_url: String,
    wms: Option<WmsService>,
    username: Option<String>,
    feature_types: RwLock<Vec<FeatureTypeSummary>>,
    /// Primary geometry property per feature type, from the schemas read
    geometry_fields: RwLock<HashMap<String, String>>,
}

impl OgcSource {
    pub fn new(connection: &ConnectionConfig) -> Result<Self> {
        let config: OgcConfig = connection.options_as()?;
        let transport = RequestTransport::new(connection.transport_config(DEFAULT_TIMEOUT_MS))?;

        if let Some(username) = &connection.username {
            transport.set_credentials(Some(Credentials::Basic {
                username: username.clone(),
                password: connection.password.clone().unwrap_or_default(),
            }));
        }

        let wfs_url = config
            .wfs_url
            .clone()
            .unwrap_or_else(|| connection.base_url().to_string());
        let wms = config
            .wms_url
            .as_ref()
            .map(|url| WmsService::new(url.clone(), config.wms_version.clone()));

        debug!("Creating WFS {} source for {}", config.version, wfs_url);

        Ok(Self {
            transport,
            config,
            wfs_url,
            wms,
            username: connection.username.clone(),
            feature_types: RwLock::new(Vec::new()),
            geometry_fields: RwLock::new(HashMap::new()),
        })
    }

    pub fn wfs_url(&self) -> &str {
        &self.wfs_url
    }

    pub fn config(&self) -> &OgcConfig {
        &self.config
    }

    pub fn wms(&self) -> Option<&WmsService> {
        self.wms.as_ref()
    }

    fn wms_service(&self) -> Result<&WmsService> {
        self.wms
            .as_ref()
            .ok_or_else(|| DataError::not_supported(format!("No WMS configured for {}", self.wfs_url)))
    }

    fn wms_layer(&self, feature_type: &str) -> String {
        self.config
            .wms_layers
            .get(feature_type)
            .cloned()
            .unwrap_or_else(|| feature_type.to_string())
    }

    /// `GetMap` URL of an XYZ tile showing the given feature types
    pub fn tile_url(&self, feature_types: &[String], x: u32, y: u32, z: u8) -> Result<String> {
        let layers: Vec<String> = feature_types.iter().map(|t| self.wms_layer(t)).collect();
        self.wms_service()?.tile_url(&layers, x, y, z)
    }

    pub fn legend_url(&self, feature_type: &str) -> Result<String> {
        self.wms_service()?
            .legend_url(&self.wms_layer(feature_type), None)
    }

    fn base_params(&self, request: &str) -> Params {
        vec![
            param("service", "WFS"),
            param("version", self.config.version.as_str()),
            param("request", request),
        ]
    }

    fn get_feature_params(&self, type_name: &str) -> Params {
        let mut params = self.base_params("GetFeature");
        params.push(param(self.config.version.type_param(), type_name));
        params.push(param("srsName", self.config.srs.clone()));
        params
    }

    fn geometry_field(&self, type_name: &str) -> String {
        self.geometry_fields
            .read()
            .get(type_name)
            .cloned()
            .or_else(|| self.config.geometry_field.clone())
            .unwrap_or_else(|| FALLBACK_GEOMETRY_FIELD.to_string())
    }

    async fn wfs_get(&self, params: Params) -> Result<HttpResponse> {
        let response = self
            .transport
            .send(HttpRequest::get(&self.wfs_url).query_pairs(params))
            .await?;
        // Services report errors as exception documents with status 200
        if looks_like_xml(&response.body) {
            if let Some(error) = exception_error(&response.body) {
                return Err(error);
            }
        }
        Ok(response)
    }

    async fn fetch_page(&self, type_name: &str, params: Params) -> Result<WfsPage> {
        let response = self.wfs_get(params).await?;
        if looks_like_xml(&response.body) {
            return Err(DataError::protocol(format!(
                "Expected {} from {} but got XML",
                self.config.output_format, self.wfs_url
            )));
        }

        let mut body: Value = response.json()?;
        let number_matched = body
            .get("numberMatched")
            .or_else(|| body.get("totalFeatures"))
            .and_then(Value::as_u64);
        let features = match body.get_mut("features").map(Value::take) {
            Some(Value::Array(features)) => features,
            _ => return Err(DataError::protocol("GetFeature response has no features")),
        };

        let records = features
            .into_iter()
            .map(|feature| record_from_geojson(type_name, feature, self.config.key_field.as_deref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(WfsPage {
            records,
            number_matched,
        })
    }

    /// Filter parameters (`filter`, `bbox` or feature ids) of a query
    fn filter_params(&self, type_name: &str, query: &FeatureQuery) -> Result<Params> {
        let version = self.config.version;
        let mut params = Vec::new();
        let mut extra = Vec::new();

        if let Some(ids) = query.ids.as_ref().filter(|ids| !ids.is_empty()) {
            match &self.config.key_field {
                Some(key) => extra.extend(equals_any(version, key, ids)),
                None => {
                    let ids: Vec<String> = ids.iter().map(|id| feature_id(type_name, id)).collect();
                    params.push(param(version.id_param(), ids.join(",")));
                }
            }
        }

        let bounds: Option<Bounds> = match &query.geometry {
            Some(geometry) => {
                debug!("Filtering {} by the bounds of the query geometry", type_name);
                geometry.bounds()
            }
            None => query.bounds,
        };

        params.extend(filter_params(
            version,
            &query.clauses,
            extra,
            bounds.as_ref(),
            &self.geometry_field(type_name),
            &self.config.srs,
        )?);
        Ok(params)
    }

    fn query_params(&self, type_name: &str, query: &FeatureQuery) -> Result<Params> {
        let version = self.config.version;
        let mut params = self.get_feature_params(type_name);
        params.push(param("outputFormat", self.config.output_format.clone()));

        if let Some(limit) = query.limit.or(self.config.default_limit) {
            params.push(param(version.count_param(), limit.to_string()));
        }
        if let Some(offset) = query.offset.filter(|o| *o > 0) {
            if version.supports_paging() {
                params.push(param("startIndex", offset.to_string()));
            } else {
                warn!("WFS {} has no paging, ignoring offset {}", version, offset);
            }
        }
        if !query.order_by.is_empty() {
            let sort = query
                .order_by
                .iter()
                .map(|o| format!("{} {}", o.field, version.sort_suffix(o.descending)))
                .collect::<Vec<_>>()
                .join(",");
            params.push(param("sortBy", sort));
        }
        if let Some(fields) = query.fields.as_ref().filter(|f| !f.is_empty()) {
            let mut names = fields.clone();
            if query.include_geometry {
                let geometry = self.geometry_field(type_name);
                if !names.contains(&geometry) {
                    names.push(geometry);
                }
            }
            params.push(param("propertyName", names.join(",")));
        }

        params.extend(self.filter_params(type_name, query)?);
        Ok(params)
    }

    async fn count_type(&self, type_name: &str, query: &FeatureQuery) -> Result<u64> {
        let mut params = self.get_feature_params(type_name);
        params.push(param("resultType", "hits"));
        params.extend(self.filter_params(type_name, query)?);

        let response = self.wfs_get(params).await?;
        parse_hits(self.config.version, &response.body)
    }

    async fn bbox_features(&self, type_name: &str, bounds: &Bounds, limit: Option<usize>) -> Result<Vec<FeatureRecord>> {
        let mut query = FeatureQuery::new().with_bounds(*bounds);
        query.limit = limit;
        let params = self.query_params(type_name, &query)?;
        Ok(self.fetch_page(type_name, params).await?.records)
    }

    /// Bounds query on every type; failing types are logged and skipped
    async fn bbox_fan_out(&self, types: &[String], bounds: &Bounds, limit: Option<usize>) -> Vec<FeatureRecord> {
        let results = join_all(types.iter().map(|t| self.bbox_features(t, bounds, limit))).await;
        let mut records: Vec<FeatureRecord> = types
            .iter()
            .zip(results)
            .flat_map(|(type_name, result)| match result {
                Ok(records) => records,
                Err(e) => {
                    warn!("Selection on {} failed: {}", type_name, e);
                    Vec::new()
                }
            })
            .collect();
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        records
    }

    /// Feature types named by layer or type; every known type when both are empty
    fn target_types(&self, layers: &[String], feature_types: &[String]) -> Vec<String> {
        let known = self.feature_types.read();
        known
            .iter()
            .map(|t| t.name.clone())
            .filter(|name| {
                (layers.is_empty() && feature_types.is_empty())
                    || feature_types.contains(name)
                    || layers.iter().any(|l| *l == *name || *l == self.wms_layer(name))
            })
            .collect()
    }

    fn type_title(&self, type_name: &str) -> String {
        self.feature_types
            .read()
            .iter()
            .find(|t| t.name == type_name)
            .and_then(|t| t.title.clone())
            .unwrap_or_else(|| type_name.to_string())
    }

    async fn search_type(&self, type_name: &str, fields: &[String], text: &str, limit: usize) -> Result<Vec<SearchSuggestion>> {
        let Some(filter) = search_filter(self.config.version, fields, text) else {
            return Ok(Vec::new());
        };

        let mut params = self.get_feature_params(type_name);
        params.push(param("outputFormat", self.config.output_format.clone()));
        params.push(param(self.config.version.count_param(), limit.to_string()));
        params.push(param("filter", filter));

        let title = self.type_title(type_name);
        let page = self.fetch_page(type_name, params).await?;
        Ok(page
            .records
            .into_iter()
            .map(|record| {
                let value = fields
                    .iter()
                    .find_map(|f| record.property(f).and_then(Value::as_str))
                    .unwrap_or(&record.id)
                    .to_string();
                SearchSuggestion::Feature {
                    label: format!("{}: {}", title, value),
                    feature_type: record.feature_type.clone(),
                    id: record.id.clone(),
                }
            })
            .collect())
    }

    async fn probe(&self, request: HttpRequest) -> Result<bool> {
        let url = request.url.clone();
        let response = self.transport.send_raw(request).await?;
        let authenticated = probe_authenticated(response.status, &response.body);
        debug!("Authentication probe of {}: {}", url, authenticated);
        Ok(authenticated)
    }

    fn wfs_probe_request(&self) -> HttpRequest {
        let first = self.feature_types.read().first().map(|t| t.name.clone());
        let params = match first {
            Some(type_name) => {
                let mut params = self.get_feature_params(&type_name);
                params.push(param(self.config.version.count_param(), "1"));
                params
            }
            None => self.base_params("GetCapabilities"),
        };
        HttpRequest::get(&self.wfs_url).query_pairs(params)
    }
}

#[async_trait]
impl FeatureSource for OgcSource {
    fn source_type(&self) -> &'static str {
        "ogc"
    }

    fn capabilities(&self) -> Vec<Capability> {
        let mut capabilities = vec![Capability::Query, Capability::Selection, Capability::Search];
        if self.wms.is_some() {
            capabilities.push(Capability::Tiles);
        }
        capabilities
    }

    fn requires_login(&self) -> bool {
        self.username.is_some()
    }

    /// Probe WFS and WMS with the configured credentials
    async fn login(&self) -> Result<()> {
        let wfs = self.probe(self.wfs_probe_request());
        let wms = async {
            match &self.wms {
                Some(wms) => self.probe(HttpRequest::get(wms.capabilities_url()?)).await,
                None => Ok(true),
            }
        };

        let (wfs_ok, wms_ok) = futures::try_join!(wfs, wms)?;
        if wfs_ok && wms_ok {
            info!("Authenticated against {}", self.wfs_url);
            Ok(())
        } else {
            Err(DataError::Unauthorized(format!(
                "Credentials rejected by {} (wfs: {}, wms: {})",
                self.wfs_url, wfs_ok, wms_ok
            )))
        }
    }

    async fn initialise(&self) -> Result<()> {
        let types = if self.config.feature_types.is_empty() {
            let response = self.wfs_get(self.base_params("GetCapabilities")).await?;
            parse_capabilities(&response.body)?
        } else {
            self.config
                .feature_types
                .iter()
                .map(|name| FeatureTypeSummary {
                    name: name.clone(),
                    title: None,
                })
                .collect()
        };

        info!("WFS {} offers {} feature types", self.wfs_url, types.len());
        *self.feature_types.write() = types;
        Ok(())
    }

    async fn list_feature_types(&self) -> Result<Vec<String>> {
        Ok(self.feature_types.read().iter().map(|t| t.name.clone()).collect())
    }

    async fn fetch_metadata(&self, feature_types: &[String]) -> Result<Vec<FeatureTypeDescriptor>> {
        let known: Vec<FeatureTypeSummary> = {
            let types = self.feature_types.read();
            feature_types
                .iter()
                .filter_map(|name| types.iter().find(|t| t.name == *name).cloned())
                .collect()
        };

        let descriptors = try_join_all(known.iter().map(|summary| async move {
            let mut params = self.base_params("DescribeFeatureType");
            params.push(param(self.config.version.type_param(), summary.name.clone()));
            let response = self.wfs_get(params).await?;
            let properties = parse_schema(&response.body)?;
            Ok::<_, DataError>(descriptor_from_schema(
                &summary.name,
                summary.title.as_deref(),
                &properties,
                self.config.key_field.as_deref(),
                self.config.geometry_field.as_deref(),
            ))
        }))
        .await?;

        let mut geometry_fields = self.geometry_fields.write();
        for descriptor in &descriptors {
            if let Some(geometry) = descriptor.primary_geometry_name() {
                geometry_fields.insert(descriptor.name.clone(), geometry.to_string());
            }
        }
        Ok(descriptors)
    }

    async fn get_feature(&self, descriptor: &FeatureTypeDescriptor, id: &str) -> Result<FeatureRecord> {
        let query = FeatureQuery::new().with_ids(vec![id.to_string()]).with_limit(1);
        let params = self.query_params(&descriptor.name, &query)?;
        self.fetch_page(&descriptor.name, params)
            .await?
            .records
            .into_iter()
            .next()
            .ok_or_else(|| DataError::not_found(format!("{}/{}", descriptor.name, id)))
    }

    async fn get_features(
        &self,
        descriptor: &FeatureTypeDescriptor,
        query: &FeatureQuery,
    ) -> Result<FeatureCollection> {
        let params = self.query_params(&descriptor.name, query)?;
        let fetch = self.fetch_page(&descriptor.name, params);

        let (page, total) = if query.include_total {
            let (page, total) = futures::try_join!(fetch, self.count_type(&descriptor.name, query))?;
            (page, Some(total))
        } else {
            let page = fetch.await?;
            let total = page.number_matched;
            (page, total)
        };

        let limit = query.limit.or(self.config.default_limit);
        let returned = query.offset.unwrap_or_default() + page.records.len();
        let has_more = match (total, limit) {
            (Some(total), _) => (returned as u64) < total,
            (None, Some(limit)) => page.records.len() >= limit,
            (None, None) => false,
        };
        Ok(FeatureCollection::with_pagination(page.records, total, has_more))
    }

    async fn count(&self, descriptor: &FeatureTypeDescriptor, query: &FeatureQuery) -> Result<u64> {
        self.count_type(&descriptor.name, query).await
    }

    async fn select(&self, request: &SelectionRequest) -> Result<Vec<FeatureRecord>> {
        let types = self.target_types(&request.layers, &request.feature_types);
        Ok(self
            .bbox_fan_out(&types, &request.tolerance_bounds(), request.limit)
            .await)
    }

    async fn select_box(&self, request: &BoxSelectionRequest) -> Result<Vec<FeatureRecord>> {
        let types = self.target_types(&request.layers, &request.feature_types);
        Ok(self.bbox_fan_out(&types, &request.bounds, request.limit).await)
    }

    async fn run_search(&self, text: &str, options: &SearchOptions) -> Result<Vec<SearchSuggestion>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let searches: Vec<(String, Vec<String>)> = self
            .target_types(&[], &options.feature_types)
            .into_iter()
            .filter_map(|t| self.config.search_fields.get(&t).map(|f| (t, f.clone())))
            .collect();

        let results = join_all(
            searches
                .iter()
                .map(|(type_name, fields)| self.search_type(type_name, fields, text, options.limit)),
        )
        .await;

        Ok(searches
            .iter()
            .zip(results)
            .flat_map(|((type_name, _), result)| match result {
                Ok(suggestions) => suggestions,
                Err(e) => {
                    warn!("Search on {} failed: {}", type_name, e);
                    Vec::new()
                }
            })
            .take(options.limit)
            .collect())
    }
}
