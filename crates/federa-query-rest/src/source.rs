use async_trait::async_trait;
use federa_query::types::id_to_string;
use federa_query::{
    format_attribute_query, BoxSelectionRequest, Capability, ConnectionConfig, Credentials,
    DataError, EnumValue, FeatureCollection, FeatureData, FeatureQuery, FeatureRecord, FeatureRef,
    FeatureSource, FeatureTypeDescriptor, HttpRequest, MetadataMap, Properties, RequestTransport,
    Result, SearchOptions, SearchSuggestion, SelectionRequest, Transaction, TransactionResult,
};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::RestConfig;
use crate::normalise::{normalise_data, normalise_transaction_op, validate_bulk_update};

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CollectionResponse {
    #[serde(default)]
    pub features: Vec<Value>,
    #[serde(default)]
    pub total_count: Option<u64>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
struct DdResponse {
    #[serde(default)]
    feature_types: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct CatalogueResponse {
    #[serde(default)]
    values: Vec<EnumValue>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    suggestions: Vec<SearchSuggestion>,
}

/// Proprietary REST backend
pub struct RestSource {
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    config: RestConfig,
    delta: RwLock<Option<String>>,
    pub(crate) transport: RequestTransport,
}

impl RestSource {
    pub fn new(connection: &ConnectionConfig) -> Result<Self> {
        let config: RestConfig = connection.options_as()?;
        let transport = RequestTransport::new(
            connection
                .transport_config(DEFAULT_TIMEOUT_MS)
                .with_cookie_store(),
        )?;

        debug!("Creating REST source for {}", connection.base_url());

        Ok(Self {
            base_url: connection.base_url().to_string(),
            username: connection.username.clone(),
            password: connection.password.clone(),
            delta: RwLock::new(config.delta.clone()),
            config,
            transport,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn delta(&self) -> Option<String> {
        self.delta.read().clone()
    }

    /// Switch to a delta; `None` returns to the master data
    pub fn set_delta(&self, delta: Option<String>) {
        info!("REST source {} now using delta {:?}", self.base_url, delta);
        *self.delta.write() = delta;
    }

    /// URL of `segments` below the base URL, each segment escaped
    pub(crate) fn endpoint(&self, segments: &[&str]) -> Result<String> {
        let mut url = url::Url::parse(&self.base_url).map_err(|e| {
            DataError::invalid_configuration(format!("Invalid base URL {}: {}", self.base_url, e))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                DataError::invalid_configuration(format!("Base URL {} cannot have paths", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url.to_string())
    }

    /// Attach the active delta
    pub(crate) fn versioned(&self, request: HttpRequest) -> HttpRequest {
        match self.delta() {
            Some(delta) => request.query("delta", delta),
            None => request,
        }
    }

    pub(crate) async fn fetch<T: serde::de::DeserializeOwned>(&self, request: HttpRequest) -> Result<T> {
        self.transport.get_json(self.versioned(request)).await
    }

    pub(crate) fn parse_collection(
        response: CollectionResponse,
        default_type: Option<&str>,
        key_field: Option<&str>,
    ) -> FeatureCollection {
        let features = response
            .features
            .into_iter()
            .filter_map(|feature| match FeatureRecord::from_geojson(feature, default_type, key_field) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping malformed feature: {}", e);
                    None
                }
            })
            .collect();
        FeatureCollection::with_pagination(features, response.total_count, response.has_more)
    }

    fn query_body(&self, query: &FeatureQuery) -> Value {
        json!({
            "filter": format_attribute_query(&query.clauses),
            "clauses": query.clauses,
            "bbox": query.bounds.map(|b| b.to_bbox_string()),
            "geometry": query.geometry,
            "ids": query.ids,
            "limit": query.limit.or(self.config.default_limit),
            "offset": query.offset,
            "order_by": query.order_by,
            "fields": query.fields,
            "include_geometry": query.include_geometry,
            "include_total": query.include_total,
        })
    }

    fn selection_types(&self, requested: &[String]) -> Option<String> {
        let types = if requested.is_empty() {
            &self.config.selectable_types
        } else {
            requested
        };
        (!types.is_empty()).then(|| types.join(","))
    }
}

#[async_trait]
impl FeatureSource for RestSource {
    fn source_type(&self) -> &'static str {
        "rest"
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![
            Capability::Query,
            Capability::Selection,
            Capability::Search,
            Capability::Edit,
            Capability::Transaction,
            Capability::Versioning,
            Capability::Trace,
        ]
    }

    fn requires_login(&self) -> bool {
        self.username.is_some()
    }

    async fn login(&self) -> Result<()> {
        let Some(username) = &self.username else {
            return Ok(());
        };

        debug!("Logging in to {} as {}", self.base_url, username);
        let response = self
            .transport
            .send(HttpRequest::post(self.endpoint(&["auth"])?).form(vec![
                ("user".to_string(), username.clone()),
                ("pass".to_string(), self.password.clone().unwrap_or_default()),
            ]))
            .await?;

        // Session cookie, optionally with a bearer token
        let token = serde_json::from_str::<Value>(&response.body)
            .ok()
            .and_then(|body| body.get("token").and_then(Value::as_str).map(str::to_string));
        if let Some(token) = token {
            self.transport.set_credentials(Some(Credentials::Bearer(token)));
        }

        info!("Logged in to {} as {}", self.base_url, username);
        Ok(())
    }

    async fn list_feature_types(&self) -> Result<Vec<String>> {
        let response: DdResponse = self.fetch(HttpRequest::get(self.endpoint(&["dd"])?)).await?;
        Ok(response
            .feature_types
            .iter()
            .filter_map(|dd| dd.get("name").and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    async fn fetch_metadata(&self, feature_types: &[String]) -> Result<Vec<FeatureTypeDescriptor>> {
        let response: DdResponse = self
            .fetch(HttpRequest::get(self.endpoint(&["dd"])?).query("types", feature_types.join(",")))
            .await?;

        response
            .feature_types
            .into_iter()
            .map(FeatureTypeDescriptor::from_json)
            .collect()
    }

    async fn fetch_catalogue(&self, catalogue: &str) -> Result<Vec<EnumValue>> {
        let response: CatalogueResponse = self
            .fetch(HttpRequest::get(self.endpoint(&["catalogue", catalogue])?))
            .await?;
        Ok(response.values)
    }

    async fn get_feature(&self, descriptor: &FeatureTypeDescriptor, id: &str) -> Result<FeatureRecord> {
        let body: Value = self
            .fetch(HttpRequest::get(self.endpoint(&["feature", &descriptor.name, id])?))
            .await?;
        FeatureRecord::from_geojson(body, Some(&descriptor.name), descriptor.key_name())
    }

    async fn get_features(
        &self,
        descriptor: &FeatureTypeDescriptor,
        query: &FeatureQuery,
    ) -> Result<FeatureCollection> {
        let response: CollectionResponse = self
            .fetch(
                HttpRequest::post(self.endpoint(&["feature", &descriptor.name, "query"])?)
                    .json(self.query_body(query)),
            )
            .await?;
        Ok(Self::parse_collection(
            response,
            Some(&descriptor.name),
            descriptor.key_name(),
        ))
    }

    async fn count(&self, descriptor: &FeatureTypeDescriptor, query: &FeatureQuery) -> Result<u64> {
        let body: Value = self
            .fetch(
                HttpRequest::post(self.endpoint(&["feature", &descriptor.name, "count"])?)
                    .json(self.query_body(query)),
            )
            .await?;
        body.get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| DataError::protocol(format!("Count response without count: {}", body)))
    }

    async fn select(&self, request: &SelectionRequest) -> Result<Vec<FeatureRecord>> {
        let mut http = HttpRequest::get(self.endpoint(&["select"])?)
            .query("x", request.x().to_string())
            .query("y", request.y().to_string())
            .query("zoom", request.zoom.to_string())
            .query("tolerance", request.pixel_tolerance.to_string());
        if !request.layers.is_empty() {
            http = http.query("layers", request.layers.join(","));
        }
        if let Some(types) = self.selection_types(&request.feature_types) {
            http = http.query("types", types);
        }
        if let Some(limit) = request.limit {
            http = http.query("limit", limit.to_string());
        }

        let response: CollectionResponse = self.fetch(http).await?;
        Ok(Self::parse_collection(response, None, None).features)
    }

    async fn select_box(&self, request: &BoxSelectionRequest) -> Result<Vec<FeatureRecord>> {
        let mut http = HttpRequest::get(self.endpoint(&["select_box"])?)
            .query("bbox", request.bounds.to_bbox_string())
            .query("zoom", request.zoom.to_string());
        if !request.layers.is_empty() {
            http = http.query("layers", request.layers.join(","));
        }
        if let Some(types) = self.selection_types(&request.feature_types) {
            http = http.query("types", types);
        }
        if let Some(limit) = request.limit {
            http = http.query("limit", limit.to_string());
        }

        let response: CollectionResponse = self.fetch(http).await?;
        Ok(Self::parse_collection(response, None, None).features)
    }

    async fn run_search(&self, text: &str, options: &SearchOptions) -> Result<Vec<SearchSuggestion>> {
        let mut http = HttpRequest::get(self.endpoint(&["search"])?)
            .query("term", text)
            .query("limit", options.limit.to_string());
        if !options.feature_types.is_empty() {
            http = http.query("types", options.feature_types.join(","));
        }
        if let Some(bounds) = options.bounds {
            http = http.query("bbox", bounds.to_bbox_string());
        }

        let response: SearchResponse = self.fetch(http).await?;
        Ok(response.suggestions)
    }

    async fn insert_feature(&self, descriptor: &FeatureTypeDescriptor, data: &FeatureData) -> Result<String> {
        let data = normalise_data(descriptor, data)?;
        let body: Value = self
            .fetch(
                HttpRequest::post(self.endpoint(&["feature", &descriptor.name])?)
                    .json(data.to_geojson()),
            )
            .await?;
        body.get("id")
            .and_then(id_to_string)
            .ok_or_else(|| DataError::protocol(format!("Insert response without id: {}", body)))
    }

    async fn update_feature(&self, descriptor: &FeatureTypeDescriptor, data: &FeatureData) -> Result<()> {
        let id = data
            .id
            .as_deref()
            .ok_or_else(|| DataError::bad_request("Update without id"))?;
        let data = normalise_data(descriptor, data)?;
        self.transport
            .send(self.versioned(
                HttpRequest::put(self.endpoint(&["feature", &descriptor.name, id])?)
                    .json(data.to_geojson()),
            ))
            .await?;
        Ok(())
    }

    async fn delete_feature(&self, descriptor: &FeatureTypeDescriptor, id: &str) -> Result<()> {
        self.transport
            .send(self.versioned(HttpRequest::delete(
                self.endpoint(&["feature", &descriptor.name, id])?,
            )))
            .await?;
        Ok(())
    }

    async fn bulk_update(
        &self,
        targets: &[FeatureRef],
        properties: &Properties,
        descriptors: &MetadataMap,
    ) -> Result<Vec<FeatureRef>> {
        let properties = validate_bulk_update(targets, properties, descriptors)?;
        let urns: Vec<String> = targets.iter().map(FeatureRef::urn).collect();

        let body: Value = self
            .fetch(
                HttpRequest::post(self.endpoint(&["bulk_update"])?)
                    .json(json!({"features": urns, "properties": properties})),
            )
            .await?;

        Ok(body
            .get("updated")
            .and_then(Value::as_array)
            .map(|updated| {
                updated
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(FeatureRef::parse_urn)
                    .collect()
            })
            .unwrap_or_else(|| targets.to_vec()))
    }

    async fn get_relationship(
        &self,
        descriptor: &FeatureTypeDescriptor,
        record: &FeatureRecord,
        field: &str,
    ) -> Result<Vec<FeatureRecord>> {
        self.related_features(descriptor, record, field).await
    }

    async fn run_transaction(
        &self,
        transaction: &Transaction,
        descriptors: &MetadataMap,
    ) -> Result<TransactionResult> {
        let operations = transaction
            .operations
            .iter()
            .map(|op| normalise_transaction_op(op, descriptors))
            .collect::<Result<Vec<_>>>()?;

        debug!("Running transaction of {} operations", operations.len());
        let body: Value = self
            .fetch(
                HttpRequest::post(self.endpoint(&["transaction"])?)
                    .json(json!({ "operations": operations })),
            )
            .await?;

        let ids = body
            .get("ids")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().map(id_to_string).collect())
            .unwrap_or_default();
        Ok(TransactionResult { ids })
    }
}
