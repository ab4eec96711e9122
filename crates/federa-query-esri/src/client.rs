use federa_query::transport::status_error;
use federa_query::{
    ConnectionConfig, Credentials, DataError, HttpRequest, RequestTransport, Result,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::config::{EsriAuth, EsriConfig};
use crate::response::{
    body_error, parse_reply, EsriFeature, EsriResponse, EsriResult, LayerInfo, ServiceInfo,
    TokenResponse,
};

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Stop paging after this many pages even if the service keeps answering
const MAX_PAGES: usize = 1000;

pub type Params = Vec<(String, String)>;

/// Features gathered across pages
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EsriPage {
    pub features: Vec<EsriFeature>,
    /// The limit was reached or the service reported more rows
    pub has_more: bool,
}

/// `generateToken` URL next to the `rest/services` root of a service URL
fn default_token_url(base_url: &str) -> Option<String> {
    let idx = base_url.find("/rest/services")?;
    Some(format!("{}/tokens/generateToken", &base_url[..idx]))
}

/// Requests against one ArcGIS REST service
pub struct EsriQueryClient {
    base_url: String,
    transport: RequestTransport,
    auth: EsriAuth,
    token_url: Option<String>,
    token_expiration: u32,
    username: Option<String>,
    password: Option<String>,
    request_limit: usize,
    token: RwLock<Option<String>>,
    /// Set once the service refused a GET
    use_post: AtomicBool,
    /// Layers refused for lack of authorisation
    invalid_layers: RwLock<HashSet<u32>>,
}

impl EsriQueryClient {
    pub fn new(connection: &ConnectionConfig, config: &EsriConfig) -> Result<Self> {
        let base_url = connection.base_url().to_string();
        let transport = RequestTransport::new(connection.transport_config(DEFAULT_TIMEOUT_MS))?;

        let token_url = match config.auth {
            EsriAuth::Token => Some(
                config
                    .token_url
                    .clone()
                    .or_else(|| default_token_url(&base_url))
                    .ok_or_else(|| {
                        DataError::invalid_configuration(format!(
                            "No token URL configured for {} and none can be derived",
                            base_url
                        ))
                    })?,
            ),
            _ => None,
        };

        if config.auth == EsriAuth::Transparent {
            if let Some(username) = &connection.username {
                transport.set_credentials(Some(Credentials::Basic {
                    username: username.clone(),
                    password: connection.password.clone().unwrap_or_default(),
                }));
            }
        }

        Ok(Self {
            base_url,
            transport,
            auth: config.auth,
            token_url,
            token_expiration: config.token_expiration,
            username: connection.username.clone(),
            password: connection.password.clone(),
            request_limit: config.request_limit.max(1),
            token: RwLock::new(None),
            use_post: AtomicBool::new(false),
            invalid_layers: RwLock::new(HashSet::new()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn request_limit(&self) -> usize {
        self.request_limit
    }

    pub fn uses_token(&self) -> bool {
        self.auth == EsriAuth::Token
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    pub fn is_layer_invalid(&self, layer: u32) -> bool {
        self.invalid_layers.read().contains(&layer)
    }

    pub fn layer_url(&self, layer: u32, operation: Option<&str>) -> String {
        match operation {
            Some(op) => format!("{}/{}/{}", self.base_url, layer, op),
            None => format!("{}/{}", self.base_url, layer),
        }
    }

    pub fn service_url(&self, operation: &str) -> String {
        format!("{}/{}", self.base_url, operation)
    }

    /// Fetch a fresh token and use it for every later request
    pub async fn generate_token(&self) -> Result<()> {
        let Some(token_url) = &self.token_url else {
            return Ok(());
        };
        let username = self
            .username
            .clone()
            .ok_or_else(|| DataError::invalid_configuration("Token authentication needs a username"))?;

        debug!("Requesting ArcGIS token from {} for {}", token_url, username);
        let response = self
            .transport
            .send(HttpRequest::post(token_url.clone()).form(vec![
                ("username".to_string(), username.clone()),
                ("password".to_string(), self.password.clone().unwrap_or_default()),
                ("client".to_string(), "requestip".to_string()),
                ("expiration".to_string(), self.token_expiration.to_string()),
                ("f".to_string(), "json".to_string()),
            ]))
            .await?;

        let token: TokenResponse = parse_reply(serde_json::from_str(&response.body)?)?;
        *self.token.write() = Some(token.token);
        info!("Obtained ArcGIS token for {} at {}", username, self.base_url);
        Ok(())
    }

    fn build(&self, url: &str, params: &Params, as_post: bool) -> HttpRequest {
        let mut request = HttpRequest::get(url)
            .query_pairs(params.iter().cloned())
            .query("f", "json");
        if let Some(token) = self.token() {
            request = request.query("token", token);
        }
        if as_post {
            request.into_form_post()
        } else {
            request
        }
    }

    /// Send a request, retrying once as POST when GET is disabled and once
    /// after a new token when the token was rejected. Errors reported in
    /// the body are left for the caller to interpret.
    pub async fn request(&self, layer: Option<u32>, url: &str, params: &Params) -> Result<Value> {
        if let Some(layer) = layer.filter(|l| self.is_layer_invalid(*l)) {
            return Err(DataError::Unauthorized(format!(
                "Layer {} of {} is not accessible",
                layer, self.base_url
            )));
        }

        let mut as_post = self.use_post.load(Ordering::Relaxed);
        let mut token_refreshed = false;
        loop {
            let response = self.transport.send_raw(self.build(url, params, as_post)).await?;
            let body: Option<Value> = serde_json::from_str(&response.body).ok();
            let error = body.as_ref().and_then(body_error);

            let token_rejected = matches!(response.status, 498 | 499)
                || error.as_ref().is_some_and(|e| e.is_token_error());
            if token_rejected {
                if self.uses_token() && !token_refreshed {
                    debug!("Token rejected by {}, requesting a new one", url);
                    token_refreshed = true;
                    self.generate_token().await?;
                    continue;
                }
                if let Some(layer) = layer {
                    warn!("Marking layer {} of {} as inaccessible", layer, self.base_url);
                    self.invalid_layers.write().insert(layer);
                }
                return Err(DataError::Unauthorized(format!("Token required for {}", url)));
            }

            if !as_post && error.as_ref().is_some_and(|e| e.is_get_disabled()) {
                info!("GET disabled on {}, switching to POST", self.base_url);
                self.use_post.store(true, Ordering::Relaxed);
                as_post = true;
                continue;
            }

            if !response.is_success() {
                return Err(status_error(response.status, &response.body));
            }
            return body.ok_or_else(|| {
                DataError::protocol(format!("Response from {} is not JSON", url))
            });
        }
    }

    pub async fn service_info(&self) -> Result<ServiceInfo> {
        parse_reply(self.request(None, &self.base_url, &Vec::new()).await?)
    }

    pub async fn layer_info(&self, layer: u32) -> Result<LayerInfo> {
        parse_reply(
            self.request(Some(layer), &self.layer_url(layer, None), &Vec::new())
                .await?,
        )
    }

    /// Query a layer page by page, `request_limit` rows at a time, until a
    /// page comes back short or `limit` rows have been read
    pub async fn query(
        &self,
        layer: u32,
        params: &Params,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<EsriPage> {
        let url = self.layer_url(layer, Some("query"));
        let mut remaining = limit.unwrap_or(usize::MAX);
        let mut offset = offset;
        let mut page = EsriPage::default();

        for _ in 0..MAX_PAGES {
            if remaining == 0 {
                page.has_more = true;
                break;
            }
            let page_size = remaining.min(self.request_limit);

            let mut page_params = params.clone();
            page_params.push(("resultOffset".to_string(), offset.to_string()));
            page_params.push(("resultRecordCount".to_string(), page_size.to_string()));

            let (features, exceeded) = EsriResponse::parse(self.request(Some(layer), &url, &page_params).await?)?
                .into_features()?;
            let received = features.len();
            page.features.extend(features);

            if received < page_size || received == 0 {
                page.has_more = exceeded;
                break;
            }
            remaining -= received;
            offset += received;
        }

        debug!(
            "Layer {} query returned {} features",
            layer,
            page.features.len()
        );
        Ok(page)
    }

    pub async fn count(&self, layer: u32, params: &Params) -> Result<u64> {
        let mut params = params.clone();
        params.push(("returnCountOnly".to_string(), "true".to_string()));
        EsriResponse::parse(
            self.request(Some(layer), &self.layer_url(layer, Some("query")), &params)
                .await?,
        )?
        .into_count()
    }

    /// Object ids matching a query, without paging
    pub async fn object_ids(&self, layer: u32, params: &Params) -> Result<Vec<i64>> {
        let mut params = params.clone();
        params.push(("returnIdsOnly".to_string(), "true".to_string()));
        EsriResponse::parse(
            self.request(Some(layer), &self.layer_url(layer, Some("query")), &params)
                .await?,
        )?
        .into_object_ids()
    }

    pub async fn identify(&self, params: &Params) -> Result<Vec<EsriResult>> {
        EsriResponse::parse(self.request(None, &self.service_url("identify"), params).await?)?
            .into_results()
    }

    pub async fn find(&self, params: &Params) -> Result<Vec<EsriResult>> {
        EsriResponse::parse(self.request(None, &self.service_url("find"), params).await?)?
            .into_results()
    }
}
