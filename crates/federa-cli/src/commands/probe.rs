use super::context::{block_on, datasource, print_json};
use clap::Args;
use colored::Colorize;
use serde_json::json;
use std::path::Path;
use tracing::info;

#[derive(Args)]
pub struct ProbeCommand {
    /// Datasource name
    pub datasource: String,
}

impl ProbeCommand {
    pub fn execute(self, config: &Path) -> anyhow::Result<()> {
        block_on(async move {
            let ds = datasource(config, &self.datasource).await?;
            if let Err(e) = ds.ensure_logged_in().await {
                eprintln!("{} {}: {}", "✗".bright_red(), ds.name().bright_white(), e);
                return Err(e.into());
            }
            let feature_types = ds.list_feature_types().await?;
            eprintln!("{} {}", "✓".bright_green(), ds.name().bright_white());
            info!(
                "Datasource {} is ready with {} feature types",
                ds.name(),
                feature_types.len()
            );
            print_json(&json!({
                "name": ds.name(),
                "backend": ds.source().source_type(),
                "state": ds.state(),
                "capabilities": ds.capabilities(),
                "feature_types": feature_types,
            }))
        })
    }
}
