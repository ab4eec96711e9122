//! Datasource orchestration around a protocol adapter
//!
//! A [`Datasource`] owns the metadata cache of one backend, shares
//! in-flight metadata fetches and logins between concurrent callers, and
//! tracks whether the backend is healthy. Every public data method goes
//! through the same wrapper: wait for initialisation, run the adapter call,
//! record the outcome.

use futures::future::{join_all, try_join_all, BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, OnceCell};
use tracing::{debug, info, warn};

use crate::current::CurrentRequest;
use crate::descriptor::FeatureTypeDescriptor;
use crate::error::{DataError, Result};
use crate::feature::{Feature, FeatureClass, FeatureList};
use crate::field::EnumValue;
use crate::registry::RegistryContext;
use crate::traits::{FeatureSource, MetadataMap};
use crate::types::*;

type SharedTask = Shared<BoxFuture<'static, Result<()>>>;

/// Health of a datasource as observed through its requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasourceState {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DatasourceEvent {
    /// Emitted only on an actual transition
    StateChanged {
        datasource: String,
        from: DatasourceState,
        to: DatasourceState,
        error: Option<String>,
    },
}

struct Inner {
    name: String,
    source: Arc<dyn FeatureSource>,
    context: RegistryContext,
    metadata: RwLock<MetadataMap>,
    in_flight: Mutex<HashMap<String, SharedTask>>,
    classes: Mutex<HashMap<String, Arc<FeatureClass>>>,
    catalogues: RwLock<HashMap<String, Vec<EnumValue>>>,
    login: Mutex<Option<SharedTask>>,
    login_retry_pending: AtomicBool,
    initialised: OnceCell<()>,
    state: Mutex<DatasourceState>,
    events: broadcast::Sender<DatasourceEvent>,
    current_search: CurrentRequest,
}

/// Cloneable handle to one configured backend
#[derive(Clone)]
pub struct Datasource {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Datasource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datasource")
            .field("name", &self.inner.name)
            .field("source_type", &self.inner.source.source_type())
            .field("state", &self.state())
            .finish()
    }
}

impl Datasource {
    pub fn new(name: impl Into<String>, source: Arc<dyn FeatureSource>) -> Self {
        Self::with_context(name, source, RegistryContext::default())
    }

    pub fn with_context(
        name: impl Into<String>,
        source: Arc<dyn FeatureSource>,
        context: RegistryContext,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                source,
                context,
                metadata: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                classes: Mutex::new(HashMap::new()),
                catalogues: RwLock::new(HashMap::new()),
                login: Mutex::new(None),
                login_retry_pending: AtomicBool::new(false),
                initialised: OnceCell::new(),
                state: Mutex::new(DatasourceState::Ok),
                events,
                current_search: CurrentRequest::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn source(&self) -> &Arc<dyn FeatureSource> {
        &self.inner.source
    }

    /// Concrete adapter, for protocol-specific operations
    pub fn source_as<T: FeatureSource>(&self) -> Option<&T> {
        self.inner.source.as_ref().downcast_ref::<T>()
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        self.inner.source.capabilities()
    }

    pub fn state(&self) -> DatasourceState {
        *self.inner.state.lock()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DatasourceEvent> {
        self.inner.events.subscribe()
    }

    /// Descriptor already in the cache, without fetching
    pub fn cached_metadata(&self, feature_type: &str) -> Option<Arc<FeatureTypeDescriptor>> {
        self.inner.metadata.read().get(feature_type).cloned()
    }

    // ---------------------------------------------------------------------
    // Initialisation, login and state
    // ---------------------------------------------------------------------

    async fn ensure_initialised(&self) -> Result<()> {
        self.inner
            .initialised
            .get_or_try_init(|| async {
                debug!("Initialising datasource {}", self.inner.name);
                self.inner.source.initialise().await?;
                if self.inner.source.requires_login() {
                    self.ensure_logged_in().await?;
                }
                info!(
                    "Datasource {} ({}) initialised",
                    self.inner.name,
                    self.inner.source.source_type()
                );
                Ok::<_, DataError>(())
            })
            .await
            .map(|_| ())
    }

    /// Log in unless already logged in; concurrent callers share one attempt
    pub async fn ensure_logged_in(&self) -> Result<()> {
        self.login_task().await
    }

    fn login_task(&self) -> SharedTask {
        let mut login = self.inner.login.lock();
        if let Some(pending) = login.as_ref() {
            return pending.clone();
        }

        let source = self.inner.source.clone();
        let weak = Arc::downgrade(&self.inner);
        let task = async move {
            let result = source.login().await;
            if let Err(e) = &result {
                if let Some(inner) = weak.upgrade() {
                    Datasource { inner }.login_failed(e);
                }
            }
            result
        }
        .boxed()
        .shared();

        *login = Some(task.clone());
        task
    }

    fn login_failed(&self, error: &DataError) {
        *self.inner.login.lock() = None;
        warn!("Login to {} failed: {}", self.inner.name, error);

        if self.inner.login_retry_pending.swap(true, Ordering::SeqCst) {
            return;
        }

        let connectivity = self.inner.context.connectivity.clone();
        let mut restored = connectivity.subscribe();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                if restored.changed().await.is_err() {
                    return;
                }
                if *restored.borrow_and_update() {
                    break;
                }
            }

            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.login_retry_pending.store(false, Ordering::SeqCst);
            let datasource = Datasource { inner };
            debug!("Network restored, retrying login to {}", datasource.name());
            if datasource.login_task().await.is_ok() {
                info!("Login to {} succeeded after reconnect", datasource.name());
            }
        });
    }

    fn record_outcome<T>(&self, operation: &str, result: &Result<T>) {
        match result {
            Ok(_) => self.set_state(DatasourceState::Ok, None),
            Err(e) if e.flips_state() => {
                warn!("{} on {} failed: {}", operation, self.inner.name, e);
                self.set_state(DatasourceState::Error, Some(e));
            }
            Err(e) => debug!("{} on {} failed: {}", operation, self.inner.name, e),
        }
    }

    fn set_state(&self, next: DatasourceState, error: Option<&DataError>) {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), next);
        if previous == next {
            return;
        }

        info!(
            "Datasource {} state changed: {:?} -> {:?}",
            self.inner.name, previous, next
        );
        // No receivers is fine
        let _ = self.inner.events.send(DatasourceEvent::StateChanged {
            datasource: self.inner.name.clone(),
            from: previous,
            to: next,
            error: error.map(|e| e.to_string()),
        });
    }

    async fn run<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let result = match self.ensure_initialised().await {
            Ok(()) => call.await,
            Err(e) => Err(e),
        };
        self.record_outcome(operation, &result);
        result
    }

    // ---------------------------------------------------------------------
    // Metadata
    // ---------------------------------------------------------------------

    pub async fn list_feature_types(&self) -> Result<Vec<String>> {
        self.run("list_feature_types", self.inner.source.list_feature_types())
            .await
    }

    /// Descriptors for the requested types, fetching what is not cached
    pub async fn get_metadata_for<S: AsRef<str>>(&self, feature_types: &[S]) -> Result<MetadataMap> {
        let types: Vec<String> = feature_types.iter().map(|t| t.as_ref().to_string()).collect();
        self.run("get_metadata_for", self.metadata_for(&types)).await
    }

    async fn metadata_for(&self, feature_types: &[String]) -> Result<MetadataMap> {
        let mut wanted: Vec<String> = Vec::new();
        for t in feature_types {
            if !wanted.contains(t) {
                wanted.push(t.clone());
            }
        }

        let mut waits: Vec<SharedTask> = Vec::new();
        {
            let cache = self.inner.metadata.read();
            let mut in_flight = self.inner.in_flight.lock();
            let mut to_fetch = Vec::new();

            for t in &wanted {
                if cache.contains_key(t) {
                    continue;
                }
                match in_flight.get(t) {
                    Some(pending) => waits.push(pending.clone()),
                    None => to_fetch.push(t.clone()),
                }
            }

            if !to_fetch.is_empty() {
                let task = self.fetch_task(to_fetch.clone());
                for t in to_fetch {
                    in_flight.insert(t, task.clone());
                }
                waits.push(task);
            }
        }

        let fetch_error = join_all(waits)
            .await
            .into_iter()
            .find_map(|r| r.err());

        let cache = self.inner.metadata.read();
        let mut result = MetadataMap::new();
        let mut missing = Vec::new();
        for t in wanted {
            match cache.get(&t) {
                Some(descriptor) => {
                    result.insert(t, descriptor.clone());
                }
                None => missing.push(t),
            }
        }

        if missing.is_empty() {
            Ok(result)
        } else if let Some(e) = fetch_error {
            Err(e)
        } else {
            Err(DataError::MissingMetadata(missing))
        }
    }

    fn fetch_task(&self, feature_types: Vec<String>) -> SharedTask {
        let source = self.inner.source.clone();
        let weak = Arc::downgrade(&self.inner);
        async move {
            debug!("Fetching metadata for {:?}", feature_types);
            let fetched = source.fetch_metadata(&feature_types).await;

            let inner = weak
                .upgrade()
                .ok_or_else(|| DataError::Internal("Datasource dropped".to_string()))?;
            let mut cache = inner.metadata.write();
            let mut in_flight = inner.in_flight.lock();
            for t in &feature_types {
                in_flight.remove(t);
            }

            let descriptors = fetched.map_err(|e| {
                warn!("Metadata fetch for {:?} failed: {}", feature_types, e);
                e
            })?;
            for descriptor in descriptors {
                let merged = match cache.get(&descriptor.name) {
                    Some(existing) => {
                        let mut merged = existing.as_ref().clone();
                        merged.merge(descriptor);
                        merged
                    }
                    None => descriptor,
                };
                cache.insert(merged.name.clone(), Arc::new(merged));
            }
            Ok(())
        }
        .boxed()
        .shared()
    }

    async fn descriptor(&self, feature_type: &str) -> Result<Arc<FeatureTypeDescriptor>> {
        let mut map = self.metadata_for(&[feature_type.to_string()]).await?;
        map.remove(feature_type)
            .ok_or_else(|| DataError::MissingMetadata(vec![feature_type.to_string()]))
    }

    /// Class shared by every feature of `feature_type` in this datasource
    pub async fn resolve_feature_class(&self, feature_type: &str) -> Result<Arc<FeatureClass>> {
        self.run("resolve_feature_class", async {
            let descriptor = self.descriptor(feature_type).await?;
            Ok(self.class_for(descriptor))
        })
        .await
    }

    fn class_for(&self, descriptor: Arc<FeatureTypeDescriptor>) -> Arc<FeatureClass> {
        let mut classes = self.inner.classes.lock();
        if let Some(class) = classes.get(&descriptor.name) {
            if Arc::ptr_eq(class.descriptor(), &descriptor) {
                return class.clone();
            }
        }

        let class = Arc::new(FeatureClass::new(
            self.inner.name.clone(),
            descriptor.clone(),
            self.inner.context.models.model_for(&descriptor.name),
            self.inner.context.localiser.clone(),
        ));
        classes.insert(descriptor.name.clone(), class.clone());
        class
    }

    /// Convert records whose types must all have metadata
    async fn to_features(&self, records: Vec<FeatureRecord>) -> Result<Vec<Feature>> {
        let types = distinct_types(&records);
        let metadata = self.metadata_for(&types).await?;
        Ok(records
            .into_iter()
            .filter_map(|record| {
                let descriptor = metadata.get(&record.feature_type)?.clone();
                Some(self.class_for(descriptor).feature(record))
            })
            .collect())
    }

    /// Convert records, dropping those of types without metadata
    async fn to_features_lenient(&self, records: Vec<FeatureRecord>) -> Result<Vec<Feature>> {
        let types = distinct_types(&records);
        match self.metadata_for(&types).await {
            Ok(_) => {}
            Err(DataError::MissingMetadata(missing)) => {
                warn!(
                    "Skipping features of types without metadata in {}: {}",
                    self.inner.name,
                    missing.join(", ")
                );
            }
            Err(e) => return Err(e),
        }

        Ok(records
            .into_iter()
            .filter_map(|record| {
                let descriptor = self.cached_metadata(&record.feature_type)?;
                Some(self.class_for(descriptor).feature(record))
            })
            .collect())
    }

    /// Enumerator or catalogue values of a field
    pub async fn field_values(&self, feature_type: &str, field: &str) -> Result<Vec<EnumValue>> {
        self.run("field_values", async {
            let descriptor = self.descriptor(feature_type).await?;
            let metadata = descriptor.field(field).ok_or_else(|| {
                DataError::InvalidQuery(format!("Unknown field {}.{}", feature_type, field))
            })?;

            if let Some(values) = &metadata.values {
                return Ok(values.clone());
            }
            let Some(catalogue) = &metadata.catalogue else {
                return Ok(Vec::new());
            };

            if let Some(values) = self.inner.catalogues.read().get(catalogue) {
                return Ok(values.clone());
            }
            let values = self.inner.source.fetch_catalogue(catalogue).await?;
            self.inner
                .catalogues
                .write()
                .insert(catalogue.clone(), values.clone());
            Ok(values)
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    pub async fn get_feature(&self, feature_type: &str, id: &str) -> Result<Feature> {
        self.run("get_feature", async {
            let descriptor = self.descriptor(feature_type).await?;
            let record = self.inner.source.get_feature(&descriptor, id).await?;
            Ok(self.class_for(descriptor).feature(record))
        })
        .await
    }

    pub async fn get_features(&self, feature_type: &str, query: &FeatureQuery) -> Result<FeatureList> {
        self.run("get_features", async {
            let descriptor = self.descriptor(feature_type).await?;
            let collection = self.inner.source.get_features(&descriptor, query).await?;
            self.to_feature_list(collection).await
        })
        .await
    }

    /// Fetch features by `type/id` urns, returned in input order.
    /// Invalid urns and types without metadata are skipped.
    pub async fn get_features_by_urn<S: AsRef<str>>(&self, urns: &[S]) -> Result<Vec<Feature>> {
        self.run("get_features_by_urn", async {
            let refs: Vec<FeatureRef> = urns
                .iter()
                .filter_map(|urn| {
                    let parsed = FeatureRef::parse_urn(urn.as_ref());
                    if parsed.is_none() {
                        warn!("Ignoring invalid urn: {}", urn.as_ref());
                    }
                    parsed
                })
                .collect();

            let mut groups: Vec<(String, Vec<String>)> = Vec::new();
            for r in &refs {
                match groups.iter_mut().find(|(t, _)| *t == r.feature_type) {
                    Some((_, ids)) => ids.push(r.id.clone()),
                    None => groups.push((r.feature_type.clone(), vec![r.id.clone()])),
                }
            }

            let types: Vec<String> = groups.iter().map(|(t, _)| t.clone()).collect();
            match self.metadata_for(&types).await {
                Ok(_) | Err(DataError::MissingMetadata(_)) => {}
                Err(e) => return Err(e),
            }

            let requests = groups.into_iter().filter_map(|(feature_type, ids)| {
                let descriptor = self.cached_metadata(&feature_type);
                if descriptor.is_none() {
                    warn!("No metadata for {}, skipping {} urns", feature_type, ids.len());
                }
                let descriptor = descriptor?;
                let source = self.inner.source.clone();
                Some(async move {
                    let query = FeatureQuery::new().with_ids(ids);
                    source.get_features(&descriptor, &query).await
                })
            });
            let collections = try_join_all(requests).await?;

            let mut by_urn: HashMap<String, FeatureRecord> = collections
                .into_iter()
                .flat_map(|c| c.features)
                .map(|record| (record.urn(), record))
                .collect();
            let ordered: Vec<FeatureRecord> = refs
                .iter()
                .filter_map(|r| by_urn.remove(&r.urn()))
                .collect();

            self.to_features_lenient(ordered).await
        })
        .await
    }

    pub async fn count(&self, feature_type: &str, query: &FeatureQuery) -> Result<u64> {
        self.run("count", async {
            let descriptor = self.descriptor(feature_type).await?;
            self.inner.source.count(&descriptor, query).await
        })
        .await
    }

    /// Point selection; features of types without metadata are skipped
    pub async fn select(&self, request: &SelectionRequest) -> Result<Vec<Feature>> {
        self.run("select", async {
            let records = self.inner.source.select(request).await?;
            self.to_features_lenient(records).await
        })
        .await
    }

    pub async fn select_box(&self, request: &BoxSelectionRequest) -> Result<Vec<Feature>> {
        self.run("select_box", async {
            let records = self.inner.source.select_box(request).await?;
            self.to_features_lenient(records).await
        })
        .await
    }

    pub async fn run_query(
        &self,
        feature_type: &str,
        query_name: &str,
        query: &FeatureQuery,
    ) -> Result<FeatureList> {
        self.run("run_query", async {
            let descriptor = self.descriptor(feature_type).await?;
            let collection = self
                .inner
                .source
                .run_query(&descriptor, query_name, query)
                .await?;
            self.to_feature_list(collection).await
        })
        .await
    }

    pub async fn run_search(&self, text: &str, options: &SearchOptions) -> Result<Vec<SearchSuggestion>> {
        self.run("run_search", self.inner.source.run_search(text, options))
            .await
    }

    /// Like `run_search`, but `Ok(None)` when a newer search started before
    /// this one resolved
    pub async fn run_search_latest(
        &self,
        text: &str,
        options: &SearchOptions,
    ) -> Result<Option<Vec<SearchSuggestion>>> {
        match self
            .inner
            .current_search
            .resolve(self.run_search(text, options))
            .await
        {
            Some(result) => result.map(Some),
            None => Ok(None),
        }
    }

    async fn to_feature_list(&self, collection: FeatureCollection) -> Result<FeatureList> {
        let total_count = collection.total_count;
        let has_more = collection.has_more;
        let features = self.to_features(collection.features).await?;
        Ok(FeatureList {
            features,
            total_count,
            has_more,
        })
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    /// Insert a feature, returning the new id
    pub async fn insert_feature(&self, data: impl Into<FeatureData>) -> Result<String> {
        let data = data.into();
        self.run("insert_feature", async {
            let descriptor = self.descriptor(&data.feature_type).await?;
            self.inner.source.insert_feature(&descriptor, &data).await
        })
        .await
    }

    pub async fn update_feature(&self, data: impl Into<FeatureData>) -> Result<()> {
        let data = data.into();
        self.run("update_feature", async {
            if data.id.is_none() {
                return Err(DataError::bad_request(format!(
                    "Cannot update {} without an id",
                    data.feature_type
                )));
            }
            let descriptor = self.descriptor(&data.feature_type).await?;
            self.inner.source.update_feature(&descriptor, &data).await
        })
        .await
    }

    pub async fn delete_feature(&self, data: impl Into<FeatureData>) -> Result<()> {
        let data = data.into();
        self.run("delete_feature", async {
            let id = data.id.as_deref().ok_or_else(|| {
                DataError::bad_request(format!("Cannot delete {} without an id", data.feature_type))
            })?;
            let descriptor = self.descriptor(&data.feature_type).await?;
            self.inner.source.delete_feature(&descriptor, id).await
        })
        .await
    }

    /// Set the same property values on features of one or more types
    pub async fn bulk_update_features(
        &self,
        targets: &[FeatureRef],
        properties: &Properties,
    ) -> Result<Vec<FeatureRef>> {
        self.run("bulk_update_features", async {
            let types: Vec<String> = targets.iter().map(|t| t.feature_type.clone()).collect();
            let descriptors = self.metadata_for(&types).await?;
            self.inner
                .source
                .bulk_update(targets, properties, &descriptors)
                .await
        })
        .await
    }

    /// Features referenced by `field` of `feature`
    pub async fn get_relationship(&self, feature: &Feature, field: &str) -> Result<Vec<Feature>> {
        self.run("get_relationship", async {
            let descriptor = self.descriptor(feature.feature_type()).await?;
            let records = self
                .inner
                .source
                .get_relationship(&descriptor, feature.record(), field)
                .await?;
            self.to_features_lenient(records).await
        })
        .await
    }

    pub async fn run_transaction(&self, transaction: &Transaction) -> Result<TransactionResult> {
        self.run("run_transaction", async {
            if transaction.is_empty() {
                return Ok(TransactionResult::default());
            }
            let descriptors = self.metadata_for(&transaction.feature_types()).await?;
            self.inner
                .source
                .run_transaction(transaction, &descriptors)
                .await
        })
        .await
    }
}

fn distinct_types(records: &[FeatureRecord]) -> Vec<String> {
    let mut seen = HashSet::new();
    records
        .iter()
        .filter(|r| seen.insert(r.feature_type.as_str()))
        .map(|r| r.feature_type.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::Connectivity;
    use crate::field::FieldMetadata;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct MockSource {
        requires_login: bool,
        login_ok: AtomicBool,
        login_calls: AtomicUsize,
        fetch_calls: AtomicUsize,
        catalogue_calls: AtomicUsize,
        next_error: Mutex<Option<DataError>>,
    }

    impl MockSource {
        fn known(feature_type: &str) -> Option<FeatureTypeDescriptor> {
            match feature_type {
                "pole" => Some(
                    FeatureTypeDescriptor::new("pole")
                        .with_field(FieldMetadata::new("id", "integer").as_key())
                        .with_field({
                            let mut f = FieldMetadata::new("material", "string");
                            f.catalogue = Some("materials".to_string());
                            f
                        })
                        .with_filter("tall", "[height]>20")
                        .with_query(crate::descriptor::QueryDefinition {
                            name: "tall_poles".to_string(),
                            description: None,
                            filter: Some("tall".to_string()),
                        }),
                ),
                "cable" => Some(FeatureTypeDescriptor::new("cable")),
                _ => None,
            }
        }

        fn fail_next(&self, error: DataError) {
            *self.next_error.lock() = Some(error);
        }

        fn take_error(&self) -> Result<()> {
            match self.next_error.lock().take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl FeatureSource for MockSource {
        fn source_type(&self) -> &'static str {
            "mock"
        }

        fn capabilities(&self) -> Vec<Capability> {
            vec![Capability::Query, Capability::Selection]
        }

        fn requires_login(&self) -> bool {
            self.requires_login
        }

        async fn login(&self) -> Result<()> {
            self.login_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.login_ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(DataError::Network("login endpoint unreachable".to_string()))
            }
        }

        async fn fetch_metadata(&self, types: &[String]) -> Result<Vec<FeatureTypeDescriptor>> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if types.iter().any(|t| t == "broken") {
                return Err(DataError::Network("dd unavailable".to_string()));
            }
            Ok(types.iter().filter_map(|t| Self::known(t)).collect())
        }

        async fn fetch_catalogue(&self, _catalogue: &str) -> Result<Vec<EnumValue>> {
            self.catalogue_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![EnumValue::new("wood"), EnumValue::new("steel")])
        }

        async fn get_feature(&self, dd: &FeatureTypeDescriptor, id: &str) -> Result<FeatureRecord> {
            self.take_error()?;
            Ok(FeatureRecord::new(dd.name.clone(), id))
        }

        async fn get_features(
            &self,
            dd: &FeatureTypeDescriptor,
            query: &FeatureQuery,
        ) -> Result<FeatureCollection> {
            let ids = query.ids.clone().unwrap_or_else(|| vec!["1".to_string()]);
            // Reverse to check that results are reordered
            Ok(FeatureCollection::new(
                ids.iter()
                    .rev()
                    .map(|id| {
                        FeatureRecord::new(dd.name.clone(), id.clone()).with_properties(
                            json!({"clauses": query.clauses.len()})
                                .as_object()
                                .cloned()
                                .unwrap(),
                        )
                    })
                    .collect(),
            ))
        }

        async fn select(&self, _request: &SelectionRequest) -> Result<Vec<FeatureRecord>> {
            Ok(vec![
                FeatureRecord::new("pole", "1"),
                FeatureRecord::new("mystery", "2"),
                FeatureRecord::new("cable", "3"),
            ])
        }

        async fn select_box(&self, _request: &BoxSelectionRequest) -> Result<Vec<FeatureRecord>> {
            Ok(vec![FeatureRecord::new("broken", "1")])
        }

        async fn run_search(&self, text: &str, _options: &SearchOptions) -> Result<Vec<SearchSuggestion>> {
            let delay = if text == "slow" { 50 } else { 5 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(vec![SearchSuggestion::Feature {
                label: text.to_string(),
                feature_type: "pole".to_string(),
                id: "1".to_string(),
            }])
        }
    }

    fn datasource(source: MockSource) -> (Datasource, Arc<MockSource>) {
        let source = Arc::new(source);
        (Datasource::new("network", source.clone()), source)
    }

    #[tokio::test]
    async fn test_concurrent_metadata_requests_share_one_fetch() {
        let (ds, source) = datasource(MockSource::default());

        let (a, b, c) = tokio::join!(
            ds.get_metadata_for(&["pole", "cable"]),
            ds.get_metadata_for(&["cable"]),
            ds.get_metadata_for(&["pole"]),
        );
        assert_eq!(a.unwrap().len(), 2);
        assert!(b.unwrap().contains_key("cable"));
        assert!(c.unwrap().contains_key("pole"));
        assert_eq!(source.fetch_calls.load(Ordering::SeqCst), 1);

        // Cached afterwards
        ds.get_metadata_for(&["pole"]).await.unwrap();
        assert_eq!(source.fetch_calls.load(Ordering::SeqCst), 1);
        assert!(ds.inner.in_flight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_missing_metadata_does_not_flip_state() {
        let (ds, _source) = datasource(MockSource::default());
        let mut events = ds.subscribe();

        let err = ds.get_metadata_for(&["pole", "ghost"]).await.unwrap_err();
        assert_eq!(err, DataError::MissingMetadata(vec!["ghost".to_string()]));
        assert_eq!(ds.state(), DatasourceState::Ok);
        assert!(events.try_recv().is_err());

        // The known type is still cached
        assert!(ds.cached_metadata("pole").is_some());
    }

    #[tokio::test]
    async fn test_failed_fetch_error_is_propagated_and_entry_removed() {
        let (ds, source) = datasource(MockSource::default());

        let err = ds.get_metadata_for(&["broken"]).await.unwrap_err();
        assert!(matches!(err, DataError::Network(_)));
        assert_eq!(ds.state(), DatasourceState::Error);
        assert!(ds.inner.in_flight.lock().is_empty());

        // A later request fetches again
        let _ = ds.get_metadata_for(&["broken"]).await;
        assert_eq!(source.fetch_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_state_changes_are_edge_triggered() {
        let (ds, source) = datasource(MockSource::default());
        let mut events = ds.subscribe();

        source.fail_next(DataError::Network("reset".to_string()));
        assert!(ds.get_feature("pole", "1").await.is_err());
        source.fail_next(DataError::Timeout(100));
        assert!(ds.get_feature("pole", "1").await.is_err());

        match events.try_recv().unwrap() {
            DatasourceEvent::StateChanged { from, to, error, .. } => {
                assert_eq!(from, DatasourceState::Ok);
                assert_eq!(to, DatasourceState::Error);
                assert!(error.unwrap().contains("reset"));
            }
        }
        assert!(events.try_recv().is_err());

        // Expected errors leave the state alone
        source.fail_next(DataError::not_found("pole 1"));
        assert!(ds.get_feature("pole", "1").await.is_err());
        assert_eq!(ds.state(), DatasourceState::Error);
        assert!(events.try_recv().is_err());

        let feature = ds.get_feature("pole", "1").await.unwrap();
        assert_eq!(feature.urn(), "pole/1");
        assert_eq!(ds.state(), DatasourceState::Ok);
        assert!(matches!(
            events.try_recv().unwrap(),
            DatasourceEvent::StateChanged {
                to: DatasourceState::Ok,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_login() {
        let (ds, source) = datasource(MockSource {
            requires_login: true,
            login_ok: AtomicBool::new(true),
            ..Default::default()
        });

        let (a, b) = tokio::join!(ds.get_feature("pole", "1"), ds.ensure_logged_in());
        assert!(a.is_ok());
        assert!(b.is_ok());
        ds.ensure_logged_in().await.unwrap();
        assert_eq!(source.login_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_login_retried_when_network_restored() {
        let connectivity = Connectivity::new(false);
        let source = Arc::new(MockSource {
            requires_login: true,
            ..Default::default()
        });
        let ds = Datasource::with_context(
            "network",
            source.clone(),
            RegistryContext::default().with_connectivity(connectivity.clone()),
        );

        let err = ds.get_feature("pole", "1").await.unwrap_err();
        assert!(matches!(err, DataError::Network(_)));
        assert_eq!(source.login_calls.load(Ordering::SeqCst), 1);

        source.login_ok.store(true, Ordering::SeqCst);
        connectivity.set_online(true);

        for _ in 0..100 {
            if source.login_calls.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(source.login_calls.load(Ordering::SeqCst), 2);

        // Let the retried login settle, then it is reused
        tokio::time::sleep(Duration::from_millis(30)).await;
        ds.get_feature("pole", "1").await.unwrap();
        assert_eq!(source.login_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_select_skips_types_without_metadata() {
        let (ds, _source) = datasource(MockSource::default());
        let features = ds.select(&SelectionRequest::at(1.0, 2.0, 15)).await.unwrap();
        let urns: Vec<String> = features.iter().map(|f| f.urn()).collect();
        assert_eq!(urns, vec!["pole/1", "cable/3"]);
        assert_eq!(ds.state(), DatasourceState::Ok);
    }

    #[tokio::test]
    async fn test_strict_conversion_propagates_fetch_errors() {
        let (ds, _source) = datasource(MockSource::default());
        let err = ds
            .select_box(&BoxSelectionRequest::new(crate::Bounds::new(0.0, 0.0, 1.0, 1.0), 12))
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Network(_)));
    }

    #[tokio::test]
    async fn test_get_features_by_urn_keeps_input_order() {
        let (ds, _source) = datasource(MockSource::default());
        let features = ds
            .get_features_by_urn(&["pole/1", "cable/9", "bogus", "ghost/4", "pole/2"])
            .await
            .unwrap();
        let urns: Vec<String> = features.iter().map(|f| f.urn()).collect();
        assert_eq!(urns, vec!["pole/1", "cable/9", "pole/2"]);
    }

    #[tokio::test]
    async fn test_run_query_uses_named_filter() {
        let (ds, _source) = datasource(MockSource::default());
        let list = ds
            .run_query("pole", "tall_poles", &FeatureQuery::new())
            .await
            .unwrap();
        assert_eq!(list.features[0].property("clauses"), Some(&json!(1)));

        let err = ds
            .run_query("pole", "nope", &FeatureQuery::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn test_caller_errors_keep_state_ok() {
        let (ds, source) = datasource(MockSource::default());
        let mut events = ds.subscribe();
        let feature = ds.get_feature("pole", "1").await.unwrap();
        assert_eq!(ds.state(), DatasourceState::Ok);

        assert!(ds.run_query("pole", "nope", &FeatureQuery::new()).await.is_err());
        assert!(ds.update_feature(&feature).await.is_err());
        source.fail_next(DataError::protocol("unexpected payload"));
        assert!(ds.get_feature("pole", "1").await.is_err());

        assert_eq!(ds.state(), DatasourceState::Ok);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_class_cached_per_type() {
        let (ds, _source) = datasource(MockSource::default());
        let a = ds.resolve_feature_class("pole").await.unwrap();
        let b = ds.resolve_feature_class("pole").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.datasource(), "network");
    }

    #[tokio::test]
    async fn test_catalogue_values_cached() {
        let (ds, source) = datasource(MockSource::default());
        let values = ds.field_values("pole", "material").await.unwrap();
        assert_eq!(values.len(), 2);
        ds.field_values("pole", "material").await.unwrap();
        assert_eq!(source.catalogue_calls.load(Ordering::SeqCst), 1);

        assert!(ds.field_values("pole", "id").await.unwrap().is_empty());
        assert!(ds.field_values("pole", "nope").await.is_err());
    }

    #[tokio::test]
    async fn test_unimplemented_edits() {
        let (ds, _source) = datasource(MockSource::default());
        let feature = ds.get_feature("pole", "1").await.unwrap();

        let err = ds.update_feature(&feature).await.unwrap_err();
        assert!(matches!(err, DataError::NotImplemented(_)));

        let data = FeatureData::new("pole", Properties::new());
        let err = ds.insert_feature(data.clone()).await.unwrap_err();
        assert!(matches!(err, DataError::NotImplemented(_)));

        let err = ds.delete_feature(data).await.unwrap_err();
        assert!(matches!(err, DataError::BadRequest(_)));

        let mut tx = Transaction::new();
        tx.add_delete("pole", "1");
        assert!(matches!(
            ds.run_transaction(&tx).await,
            Err(DataError::NotImplemented(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_search_discarded() {
        let (ds, _source) = datasource(MockSource::default());
        let options = SearchOptions::default();
        let (slow, fast) = tokio::join!(ds.run_search_latest("slow", &options), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            ds.run_search_latest("fast", &options).await
        });
        assert_eq!(slow.unwrap(), None);
        assert_eq!(fast.unwrap().unwrap()[0].label(), "fast");
    }

    #[test]
    fn test_source_downcast() {
        let (ds, _source) = datasource(MockSource::default());
        assert!(ds.source_as::<MockSource>().is_some());
        assert_eq!(ds.capabilities().len(), 2);
    }
}
