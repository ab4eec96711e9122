use super::context::{block_on, datasource, feature_json, parse_bbox, print_json};
use clap::Args;
use federa_query::BoxSelectionRequest;
use serde_json::Value;
use std::path::Path;

#[derive(Args)]
pub struct SelectBoxCommand {
    /// Datasource name
    pub datasource: String,

    /// Bounding box: min_x,min_y,max_x,max_y
    #[arg(long)]
    pub bbox: String,

    /// Map zoom level
    #[arg(long, short = 'z', default_value_t = 15)]
    pub zoom: u8,

    /// Restrict to these layers (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub layers: Vec<String>,

    /// Restrict to these feature types (comma separated)
    #[arg(long = "types", value_delimiter = ',')]
    pub feature_types: Vec<String>,

    #[arg(long, short = 'l')]
    pub limit: Option<usize>,
}

impl SelectBoxCommand {
    fn request(&self) -> anyhow::Result<BoxSelectionRequest> {
        let mut request = BoxSelectionRequest::new(parse_bbox(&self.bbox)?, self.zoom);
        request.layers = self.layers.clone();
        request.feature_types = self.feature_types.clone();
        request.limit = self.limit;
        Ok(request)
    }

    pub fn execute(self, config: &Path) -> anyhow::Result<()> {
        block_on(async move {
            let request = self.request()?;
            let ds = datasource(config, &self.datasource).await?;
            let features = ds.select_box(&request).await?;
            let features: Vec<Value> = features.iter().map(feature_json).collect();
            print_json(&features)
        })
    }
}
