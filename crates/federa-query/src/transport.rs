//! Shared HTTP plumbing for the adapters
//!
//! Every adapter holds a [`RequestTransport`] by composition. It provides
//! direct or server-tunnelled requests, an explicit timeout around every
//! request, credential headers and HTTP status classification.

use parking_lot::RwLock;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{DataError, Result};

/// Route requests through a server-side tunnel endpoint instead of
/// contacting the target service directly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Base URL of the tunnelling server; requests go to `{server_url}/tunnel`
    pub server_url: String,
    /// Datasource name the server uses to authorise the tunnelled request
    pub owner: String,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub timeout: Duration,
    pub tunnel: Option<TunnelConfig>,
    pub cookie_store: bool,
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            tunnel: None,
            cookie_store: false,
            user_agent: concat!("federa/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl TransportConfig {
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout = Duration::from_millis(timeout_ms);
        self
    }

    pub fn with_tunnel(mut self, tunnel: Option<TunnelConfig>) -> Self {
        self.tunnel = tunnel;
        self
    }

    pub fn with_cookie_store(mut self) -> Self {
        self.cookie_store = true;
        self
    }
}

/// Credentials attached as an `Authorization` header
#[derive(Debug, Clone, PartialEq)]
pub enum Credentials {
    Basic { username: String, password: String },
    Bearer(String),
}

/// Outbound request description
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub form: Option<Vec<(String, String)>>,
    pub json: Option<Value>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            form: None,
            json: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn query_pairs(mut self, pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        self.query.extend(pairs);
        self
    }

    pub fn form(mut self, pairs: Vec<(String, String)>) -> Self {
        self.form = Some(pairs);
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.json = Some(body);
        self
    }

    /// Same request re-expressed as a form POST of the query parameters
    pub fn into_form_post(self) -> Self {
        let mut pairs = self.query;
        pairs.extend(self.form.unwrap_or_default());
        Self {
            method: Method::POST,
            url: self.url,
            query: Vec::new(),
            form: Some(pairs),
            json: None,
        }
    }
}

/// Buffered response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|e| {
            DataError::Protocol(format!(
                "Failed to parse response: {} ({})",
                e,
                snippet(&self.body)
            ))
        })
    }
}

fn snippet(body: &str) -> String {
    const MAX: usize = 200;
    if body.chars().count() <= MAX {
        body.trim().to_string()
    } else {
        let cut: String = body.chars().take(MAX).collect();
        format!("{}...", cut.trim())
    }
}

/// Classify a non-success HTTP status
pub fn status_error(status: u16, body: &str) -> DataError {
    let detail = snippet(body);
    match status {
        400 | 422 => DataError::BadRequest(detail),
        401 | 403 => DataError::Unauthorized(format!("HTTP {}: {}", status, detail)),
        404 => DataError::ObjectNotFound(detail),
        409 => DataError::DuplicateKey(detail),
        500..=599 => DataError::Network(format!("HTTP {}: {}", status, detail)),
        _ => DataError::Protocol(format!("Unexpected HTTP status {}: {}", status, detail)),
    }
}

fn request_error(err: reqwest::Error, timeout: Duration) -> DataError {
    if err.is_timeout() {
        DataError::Timeout(timeout.as_millis() as u64)
    } else if err.is_decode() || err.is_body() {
        DataError::Protocol(format!("Failed to read response: {}", err))
    } else {
        DataError::Network(format!("Request failed: {}", err))
    }
}

/// HTTP client shared by composition across adapters
pub struct RequestTransport {
    client: Client,
    config: TransportConfig,
    credentials: RwLock<Option<Credentials>>,
}

impl RequestTransport {
    pub fn new(config: TransportConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .cookie_store(config.cookie_store)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| DataError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            credentials: RwLock::new(None),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn is_tunnelled(&self) -> bool {
        self.config.tunnel.is_some()
    }

    pub fn set_credentials(&self, credentials: Option<Credentials>) {
        *self.credentials.write() = credentials;
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials.read().clone()
    }

    /// Full target URL including query string
    pub fn target_url(&self, url: &str, query: &[(String, String)]) -> Result<String> {
        let url = if query.is_empty() {
            url::Url::parse(url)
        } else {
            url::Url::parse_with_params(url, query)
        }
        .map_err(|e| DataError::invalid_configuration(format!("Invalid URL {}: {}", url, e)))?;
        Ok(url.to_string())
    }

    /// Send a request without interpreting the HTTP status
    pub async fn send_raw(&self, request: HttpRequest) -> Result<HttpResponse> {
        let credentials = self.credentials();
        self.execute(request, credentials.as_ref()).await
    }

    /// Send a request; non-success statuses become typed errors
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = self.send_raw(request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(status_error(response.status, &response.body))
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, request: HttpRequest) -> Result<T> {
        self.send(request).await?.json()
    }

    /// Check whether the given basic-auth credentials are accepted by `url`.
    /// On success the credentials are kept for subsequent requests.
    pub async fn probe_basic_auth(&self, url: &str, username: &str, password: &str) -> Result<bool> {
        let credentials = Credentials::Basic {
            username: username.to_string(),
            password: password.to_string(),
        };
        let response = self
            .execute(HttpRequest::get(url), Some(&credentials))
            .await?;

        match response.status {
            401 | 403 => {
                debug!("Basic auth rejected by {}", url);
                Ok(false)
            }
            _ if response.is_success() => {
                self.set_credentials(Some(credentials));
                Ok(true)
            }
            status => Err(status_error(status, &response.body)),
        }
    }

    async fn execute(
        &self,
        request: HttpRequest,
        credentials: Option<&Credentials>,
    ) -> Result<HttpResponse> {
        let (url, query) = match &self.config.tunnel {
            Some(tunnel) => {
                let target = self.target_url(&request.url, &request.query)?;
                (
                    format!("{}/tunnel", tunnel.server_url.trim_end_matches('/')),
                    vec![
                        ("owner".to_string(), tunnel.owner.clone()),
                        ("url".to_string(), target),
                    ],
                )
            }
            None => (request.url.clone(), request.query.clone()),
        };

        debug!("{} {}", request.method, url);

        let mut builder = self.client.request(request.method.clone(), &url);
        if !query.is_empty() {
            builder = builder.query(&query);
        }
        if let Some(form) = &request.form {
            builder = builder.form(form);
        }
        if let Some(json) = &request.json {
            builder = builder.json(json);
        }
        builder = match credentials {
            Some(Credentials::Basic { username, password }) => {
                builder.basic_auth(username, Some(password))
            }
            Some(Credentials::Bearer(token)) => builder.bearer_auth(token),
            None => builder,
        };

        let timeout = self.config.timeout;
        let exchange = async move {
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.text().await?;
            Ok::<_, reqwest::Error>(HttpResponse {
                status,
                content_type,
                body,
            })
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(request_error(e, timeout)),
            Err(_) => {
                warn!("Request to {} timed out after {:?}", url, timeout);
                Err(DataError::Timeout(timeout.as_millis() as u64))
            }
        }
    }
}
