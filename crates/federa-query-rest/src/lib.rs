//! Proprietary REST backend for federa-query
//!
//! Implements `FeatureSource` over the native JSON service: session login,
//! data dictionary metadata, feature queries, selection, search, edits,
//! transactions and delta (versioned working copy) switching. Network
//! traces and delta change lists are available on [`RestSource`] directly.

mod config;
mod network;
mod normalise;
mod relationship;
mod render;
mod source;

use federa_query::{ConnectionConfig, DatasourceFactory, FeatureSource, Result};
use std::sync::Arc;

pub use config::RestConfig;
pub use network::{ChangeType, DeltaChange, TraceDirection, TraceNode, TraceOptions};
pub use normalise::{normalise_properties, validate_bulk_update};
pub use render::{render_fields, render_query, FeatureStyle};
pub use source::{RestSource, DEFAULT_TIMEOUT_MS};

/// Factory for the `rest` backend
#[derive(Debug, Default, Clone, Copy)]
pub struct RestSourceFactory;

impl DatasourceFactory for RestSourceFactory {
    fn backend_type(&self) -> &'static str {
        "rest"
    }

    fn create_source(&self, config: &ConnectionConfig) -> Result<Arc<dyn FeatureSource>> {
        Ok(Arc::new(RestSource::new(config)?))
    }
}
