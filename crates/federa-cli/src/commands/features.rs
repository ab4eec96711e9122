use super::context::{block_on, datasource, feature_json, parse_bbox, print_json};
use clap::Args;
use federa_query::{parse_attribute_query, FeatureQuery};
use serde_json::{json, Value};
use std::path::Path;

#[derive(Args)]
pub struct GetCommand {
    /// Datasource name
    pub datasource: String,
    /// Feature type
    pub feature_type: String,
    /// Feature id
    pub id: String,
}

impl GetCommand {
    pub fn execute(self, config: &Path) -> anyhow::Result<()> {
        block_on(async move {
            let ds = datasource(config, &self.datasource).await?;
            let feature = ds.get_feature(&self.feature_type, &self.id).await?;
            print_json(&feature_json(&feature))
        })
    }
}

#[derive(Args)]
pub struct QueryCommand {
    /// Datasource name
    pub datasource: String,
    /// Feature type
    pub feature_type: String,

    /// Attribute query, e.g. "[status]='open' & [height] > 10"
    #[arg(long, short = 'f')]
    pub filter: Option<String>,

    /// Bounding box: min_x,min_y,max_x,max_y
    #[arg(long)]
    pub bbox: Option<String>,

    #[arg(long, short = 'l')]
    pub limit: Option<usize>,

    #[arg(long)]
    pub offset: Option<usize>,

    /// Order by field; prefix with '-' for descending
    #[arg(long)]
    pub order: Option<String>,

    /// Request the total match count
    #[arg(long)]
    pub total: bool,
}

impl QueryCommand {
    fn build_query(&self) -> anyhow::Result<FeatureQuery> {
        let mut query = filter_query(self.filter.as_deref());
        if let Some(bbox) = &self.bbox {
            query = query.with_bounds(parse_bbox(bbox)?);
        }
        if let Some(limit) = self.limit {
            query = query.with_limit(limit);
        }
        if let Some(offset) = self.offset {
            query = query.with_offset(offset);
        }
        if let Some(order) = &self.order {
            query = match order.strip_prefix('-') {
                Some(field) => query.with_order(field, true),
                None => query.with_order(order.as_str(), false),
            };
        }
        if self.total {
            query = query.with_total();
        }
        Ok(query)
    }

    pub fn execute(self, config: &Path) -> anyhow::Result<()> {
        block_on(async move {
            let query = self.build_query()?;
            let ds = datasource(config, &self.datasource).await?;
            let list = ds.get_features(&self.feature_type, &query).await?;
            let features: Vec<Value> = list.features.iter().map(feature_json).collect();
            print_json(&json!({
                "features": features,
                "total_count": list.total_count,
                "has_more": list.has_more,
            }))
        })
    }
}

#[derive(Args)]
pub struct CountCommand {
    /// Datasource name
    pub datasource: String,
    /// Feature type
    pub feature_type: String,

    /// Attribute query, e.g. "[status]='open'"
    #[arg(long, short = 'f')]
    pub filter: Option<String>,
}

impl CountCommand {
    pub fn execute(self, config: &Path) -> anyhow::Result<()> {
        block_on(async move {
            let query = filter_query(self.filter.as_deref());
            let ds = datasource(config, &self.datasource).await?;
            let count = ds.count(&self.feature_type, &query).await?;
            print_json(&json!({ "count": count }))
        })
    }
}

fn filter_query(filter: Option<&str>) -> FeatureQuery {
    match filter {
        Some(text) => FeatureQuery::new().with_clauses(parse_attribute_query(text)),
        None => FeatureQuery::new(),
    }
}
