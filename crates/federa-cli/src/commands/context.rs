//! Shared plumbing: config loading, registry setup and JSON output

use anyhow::Context;
use federa_query::{Bounds, Datasource, DatasourceRegistry, Feature, FederaConfig, RegistryContext};
use federa_query_esri::EsriSourceFactory;
use federa_query_ogc::OgcSourceFactory;
use federa_query_rest::RestSourceFactory;
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const APPLICATION: &str = "federa-cli";

/// Run a command body on a fresh runtime
pub fn block_on<F>(future: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(future)
}

/// Registry with every backend registered and the config's datasources created
pub async fn load_registry(config_path: &Path) -> anyhow::Result<DatasourceRegistry> {
    let config = FederaConfig::from_path(config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    debug!(
        "Loaded {} datasources from {}",
        config.datasources.len(),
        config_path.display()
    );

    let application = config.application.clone().unwrap_or_else(|| APPLICATION.to_string());
    let registry = DatasourceRegistry::new(RegistryContext::new(application));
    registry.register_factory(Arc::new(RestSourceFactory)).await;
    registry.register_factory(Arc::new(EsriSourceFactory)).await;
    registry.register_factory(Arc::new(OgcSourceFactory)).await;
    registry.load_config(&config).await?;
    Ok(registry)
}

pub async fn datasource(config_path: &Path, name: &str) -> anyhow::Result<Datasource> {
    let registry = load_registry(config_path).await?;
    Ok(registry.datasource(name).await?)
}

/// `min_x,min_y,max_x,max_y`
pub fn parse_bbox(text: &str) -> anyhow::Result<Bounds> {
    Bounds::parse(text).ok_or_else(|| {
        anyhow::anyhow!("Invalid bounding box '{}', expected min_x,min_y,max_x,max_y", text)
    })
}

pub fn feature_json(feature: &Feature) -> Value {
    json!({
        "urn": feature.urn(),
        "title": feature.title(),
        "properties": feature.properties(),
        "geometry": feature.geometry(),
    })
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
