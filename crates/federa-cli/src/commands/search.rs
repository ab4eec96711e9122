use super::context::{block_on, datasource, parse_bbox, print_json};
use clap::Args;
use federa_query::SearchOptions;
use std::path::Path;

#[derive(Args)]
pub struct SearchCommand {
    /// Datasource name
    pub datasource: String,

    /// Search text
    pub text: String,

    #[arg(long, short = 'l', default_value_t = 10)]
    pub limit: usize,

    /// Restrict to these feature types (comma separated)
    #[arg(long = "types", value_delimiter = ',')]
    pub feature_types: Vec<String>,

    /// Bounding box: min_x,min_y,max_x,max_y
    #[arg(long)]
    pub bbox: Option<String>,
}

impl SearchCommand {
    pub fn execute(self, config: &Path) -> anyhow::Result<()> {
        block_on(async move {
            let options = SearchOptions {
                limit: self.limit,
                feature_types: self.feature_types.clone(),
                bounds: self.bbox.as_deref().map(parse_bbox).transpose()?,
            };
            let ds = datasource(config, &self.datasource).await?;
            let suggestions = ds.run_search(&self.text, &options).await?;
            print_json(&suggestions)
        })
    }
}
