use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::connectivity::Connectivity;
use crate::datasource::Datasource;
use crate::error::{DataError, Result};
use crate::feature::FeatureModelRegistry;
use crate::locale::{Localiser, NoopLocaliser};
use crate::traits::FeatureSource;
use crate::transport::{TransportConfig, TunnelConfig};

/// Connection configuration for creating datasources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Datasource name used by callers and in feature class keys
    pub name: String,
    /// Backend type identifier (rest, esri, ogc)
    pub backend: String,
    /// Service base URL
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Request timeout; each backend has its own default
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub tunnel: Option<TunnelConfig>,
    /// Backend-specific settings, deserialised by the backend factory
    #[serde(default)]
    pub options: Value,
}

impl ConnectionConfig {
    pub fn new(
        name: impl Into<String>,
        backend: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            backend: backend.into(),
            url: url.into(),
            username: None,
            password: None,
            timeout_ms: None,
            tunnel: None,
            options: Value::Null,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_tunnel(mut self, server_url: impl Into<String>) -> Self {
        self.tunnel = Some(TunnelConfig {
            server_url: server_url.into(),
            owner: self.name.clone(),
        });
        self
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    /// Deserialise the backend options; absent options give the defaults
    pub fn options_as<T: DeserializeOwned + Default>(&self) -> Result<T> {
        if self.options.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.options.clone()).map_err(|e| {
            DataError::InvalidConfiguration(format!(
                "Invalid {} options for {}: {}",
                self.backend, self.name, e
            ))
        })
    }

    pub fn transport_config(&self, default_timeout_ms: u64) -> TransportConfig {
        TransportConfig::default()
            .with_timeout_ms(self.timeout_ms.unwrap_or(default_timeout_ms))
            .with_tunnel(self.tunnel.clone())
    }

    /// Base URL without a trailing slash
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }

    /// Connection string for display purposes (without password)
    pub fn connection_string(&self) -> String {
        match &self.username {
            Some(username) => format!("{}:{}@{}", self.backend, username, self.url),
            None => format!("{}:{}", self.backend, self.url),
        }
    }
}

/// Datasource list loaded from a YAML or JSON file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FederaConfig {
    #[serde(default)]
    pub application: Option<String>,
    #[serde(default)]
    pub datasources: Vec<ConnectionConfig>,
}

impl FederaConfig {
    /// Load from disk; `.json` files are parsed as JSON, everything else as YAML
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            DataError::InvalidConfiguration(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json_str(&contents)
        } else {
            Self::from_yaml_str(&contents)
        }
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| DataError::InvalidConfiguration(format!("Invalid YAML config: {}", e)))
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        serde_json::from_str(contents)
            .map_err(|e| DataError::InvalidConfiguration(format!("Invalid JSON config: {}", e)))
    }

    pub fn datasource(&self, name: &str) -> Option<&ConnectionConfig> {
        self.datasources.iter().find(|d| d.name == name)
    }
}

/// Collaborators injected into every datasource
#[derive(Clone)]
pub struct RegistryContext {
    pub models: Arc<FeatureModelRegistry>,
    pub localiser: Arc<dyn Localiser>,
    pub connectivity: Connectivity,
    pub application: String,
}

impl RegistryContext {
    pub fn new(application: impl Into<String>) -> Self {
        Self {
            models: Arc::new(FeatureModelRegistry::new()),
            localiser: Arc::new(NoopLocaliser),
            connectivity: Connectivity::default(),
            application: application.into(),
        }
    }

    pub fn with_models(mut self, models: Arc<FeatureModelRegistry>) -> Self {
        self.models = models;
        self
    }

    pub fn with_localiser(mut self, localiser: Arc<dyn Localiser>) -> Self {
        self.localiser = localiser;
        self
    }

    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }
}

impl Default for RegistryContext {
    fn default() -> Self {
        Self::new("federa")
    }
}

/// Factory trait for creating feature sources from configurations
pub trait DatasourceFactory: Send + Sync {
    /// Get the backend type this factory handles
    fn backend_type(&self) -> &'static str;

    /// Create a feature source from configuration
    fn create_source(&self, config: &ConnectionConfig) -> Result<Arc<dyn FeatureSource>>;
}

/// Registry for backend factories and the datasources built from them
pub struct DatasourceRegistry {
    context: RegistryContext,
    factories: Arc<RwLock<HashMap<String, Arc<dyn DatasourceFactory>>>>,
    datasources: Arc<RwLock<HashMap<String, Datasource>>>,
}

impl DatasourceRegistry {
    pub fn new(context: RegistryContext) -> Self {
        Self {
            context,
            factories: Arc::new(RwLock::new(HashMap::new())),
            datasources: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn context(&self) -> &RegistryContext {
        &self.context
    }

    /// Register a factory for a backend type
    pub async fn register_factory(&self, factory: Arc<dyn DatasourceFactory>) {
        let backend = factory.backend_type();
        let mut factories = self.factories.write().await;

        if factories.contains_key(backend) {
            warn!("Overwriting existing factory for backend: {}", backend);
        }

        factories.insert(backend.to_string(), factory);
        debug!("Registered factory for backend: {}", backend);
    }

    /// Create a datasource and cache it under its configured name
    pub async fn create_datasource(&self, config: ConnectionConfig) -> Result<Datasource> {
        let factory = self
            .factories
            .read()
            .await
            .get(&config.backend)
            .cloned()
            .ok_or_else(|| {
                DataError::InvalidConfiguration(format!(
                    "No factory registered for backend: {}",
                    config.backend
                ))
            })?;

        debug!(
            "Creating datasource {} ({})",
            config.name,
            config.connection_string()
        );

        let source = factory.create_source(&config)?;
        let datasource = Datasource::with_context(config.name.clone(), source, self.context.clone());

        let mut datasources = self.datasources.write().await;
        if datasources
            .insert(config.name.clone(), datasource.clone())
            .is_some()
        {
            warn!("Replaced existing datasource: {}", config.name);
        }

        Ok(datasource)
    }

    /// Create every datasource listed in a config file, in order
    pub async fn load_config(&self, config: &FederaConfig) -> Result<Vec<String>> {
        let mut names = Vec::with_capacity(config.datasources.len());
        for connection in &config.datasources {
            self.create_datasource(connection.clone()).await?;
            names.push(connection.name.clone());
        }
        info!("Loaded {} datasources", names.len());
        Ok(names)
    }

    pub async fn get_datasource(&self, name: &str) -> Option<Datasource> {
        self.datasources.read().await.get(name).cloned()
    }

    /// Like `get_datasource` but failing with `InvalidConfiguration`
    pub async fn datasource(&self, name: &str) -> Result<Datasource> {
        self.get_datasource(name).await.ok_or_else(|| {
            DataError::InvalidConfiguration(format!("Unknown datasource: {}", name))
        })
    }

    pub async fn remove_datasource(&self, name: &str) -> Option<Datasource> {
        let removed = self.datasources.write().await.remove(name);
        if removed.is_some() {
            debug!("Removed datasource: {}", name);
        }
        removed
    }

    pub async fn list_datasources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.datasources.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// List registered backend types
    pub async fn list_backends(&self) -> Vec<String> {
        let mut backends: Vec<String> = self.factories.read().await.keys().cloned().collect();
        backends.sort();
        backends
    }
}

impl Default for DatasourceRegistry {
    fn default() -> Self {
        Self::new(RegistryContext::default())
    }
}
