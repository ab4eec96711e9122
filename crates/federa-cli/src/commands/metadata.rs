use super::context::{block_on, datasource, print_json};
use clap::Args;
use std::path::Path;

#[derive(Args)]
pub struct MetadataCommand {
    /// Datasource name
    pub datasource: String,

    /// Feature types to describe; lists the available types when empty
    pub feature_types: Vec<String>,
}

impl MetadataCommand {
    pub fn execute(self, config: &Path) -> anyhow::Result<()> {
        block_on(async move {
            let ds = datasource(config, &self.datasource).await?;
            if self.feature_types.is_empty() {
                let types = ds.list_feature_types().await?;
                return print_json(&types);
            }
            let metadata = ds.get_metadata_for(&self.feature_types).await?;
            print_json(&metadata)
        })
    }
}
