use async_trait::async_trait;
use downcast_rs::{impl_downcast, Downcast};
use std::collections::HashMap;
use std::sync::Arc;

use crate::descriptor::FeatureTypeDescriptor;
use crate::error::{DataError, Result};
use crate::field::EnumValue;
use crate::types::*;

/// Descriptors keyed by feature type name
pub type MetadataMap = HashMap<String, Arc<FeatureTypeDescriptor>>;

/// Protocol adapter behind a [`crate::Datasource`]
///
/// Adapters translate uniform operations into protocol requests and return
/// protocol-neutral [`FeatureRecord`]s. Metadata caching, login sharing and
/// state tracking are handled by the datasource, not here.
///
/// Edit operations default to `NotImplemented`; read-only adapters only
/// override what their protocol offers.
#[async_trait]
pub trait FeatureSource: Send + Sync + Downcast {
    /// Backend identifier (rest, esri, ogc)
    fn source_type(&self) -> &'static str;

    fn capabilities(&self) -> Vec<Capability>;

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// One-time setup before the first request (service info, layer lists)
    async fn initialise(&self) -> Result<()> {
        Ok(())
    }

    /// Whether [`FeatureSource::login`] must succeed before any request
    fn requires_login(&self) -> bool {
        false
    }

    async fn login(&self) -> Result<()> {
        Ok(())
    }

    /// Feature types this source can serve
    async fn list_feature_types(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Fetch descriptors for the given types in a single round trip.
    /// Types unknown to the backend are simply absent from the result.
    async fn fetch_metadata(&self, feature_types: &[String]) -> Result<Vec<FeatureTypeDescriptor>>;

    /// Values of a server-side catalogue referenced by a field
    async fn fetch_catalogue(&self, catalogue: &str) -> Result<Vec<EnumValue>> {
        Err(DataError::not_implemented(format!(
            "{} does not provide catalogue {}",
            self.source_type(),
            catalogue
        )))
    }

    async fn get_feature(&self, descriptor: &FeatureTypeDescriptor, id: &str) -> Result<FeatureRecord>;

    async fn get_features(
        &self,
        descriptor: &FeatureTypeDescriptor,
        query: &FeatureQuery,
    ) -> Result<FeatureCollection>;

    async fn count(&self, descriptor: &FeatureTypeDescriptor, query: &FeatureQuery) -> Result<u64> {
        let collection = self
            .get_features(descriptor, &query.clone().without_geometry().with_total())
            .await?;
        Ok(collection
            .total_count
            .unwrap_or(collection.features.len() as u64))
    }

    async fn select(&self, request: &SelectionRequest) -> Result<Vec<FeatureRecord>>;

    async fn select_box(&self, request: &BoxSelectionRequest) -> Result<Vec<FeatureRecord>>;

    /// Run a named query of the descriptor, combined with the caller's own clauses
    async fn run_query(
        &self,
        descriptor: &FeatureTypeDescriptor,
        query_name: &str,
        query: &FeatureQuery,
    ) -> Result<FeatureCollection> {
        let clauses = descriptor.query_clauses(query_name).ok_or_else(|| {
            DataError::InvalidQuery(format!(
                "No query named {} for {}",
                query_name, descriptor.name
            ))
        })?;
        let merged = query.clone().with_clauses(clauses);
        self.get_features(descriptor, &merged).await
    }

    async fn run_search(&self, text: &str, options: &SearchOptions) -> Result<Vec<SearchSuggestion>>;

    /// Insert a feature, returning its new id
    async fn insert_feature(
        &self,
        descriptor: &FeatureTypeDescriptor,
        _data: &FeatureData,
    ) -> Result<String> {
        Err(self.not_implemented("insert_feature", &descriptor.name))
    }

    async fn update_feature(
        &self,
        descriptor: &FeatureTypeDescriptor,
        _data: &FeatureData,
    ) -> Result<()> {
        Err(self.not_implemented("update_feature", &descriptor.name))
    }

    async fn delete_feature(&self, descriptor: &FeatureTypeDescriptor, _id: &str) -> Result<()> {
        Err(self.not_implemented("delete_feature", &descriptor.name))
    }

    /// Apply the same property values to features of possibly different types
    async fn bulk_update(
        &self,
        _targets: &[FeatureRef],
        _properties: &Properties,
        _descriptors: &MetadataMap,
    ) -> Result<Vec<FeatureRef>> {
        Err(self.not_implemented("bulk_update", "features"))
    }

    /// Features related to `record` through the reference field `field`
    async fn get_relationship(
        &self,
        descriptor: &FeatureTypeDescriptor,
        _record: &FeatureRecord,
        field: &str,
    ) -> Result<Vec<FeatureRecord>> {
        Err(self.not_implemented("get_relationship", &format!("{}.{}", descriptor.name, field)))
    }

    async fn run_transaction(
        &self,
        _transaction: &Transaction,
        _descriptors: &MetadataMap,
    ) -> Result<TransactionResult> {
        Err(self.not_implemented("run_transaction", "transaction"))
    }

    #[doc(hidden)]
    fn not_implemented(&self, operation: &str, target: &str) -> DataError {
        DataError::not_implemented(format!(
            "{} is not implemented by {} ({})",
            operation,
            self.source_type(),
            target
        ))
    }
}

impl_downcast!(FeatureSource);
