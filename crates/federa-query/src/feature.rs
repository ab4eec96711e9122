//! Typed features: a shared per-type class combined with a record

use parking_lot::RwLock;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::descriptor::{render_template, FeatureTypeDescriptor};
use crate::field::{FieldMetadata, FieldValidationError};
use crate::geometry::Geometry;
use crate::locale::{field_key, type_key, Localiser, NoopLocaliser};
use crate::types::{FeatureData, FeatureRecord, FeatureRef, Properties};

/// Per-type behaviour extension
///
/// Every method has a default derived from the descriptor, so a model only
/// overrides what its feature type does differently.
pub trait FeatureModel: Send + Sync {
    fn title(&self, class: &FeatureClass, record: &FeatureRecord) -> String {
        match &class.descriptor.title {
            Some(template) => {
                let title = render_template(template, &record.properties);
                if title.is_empty() {
                    format!("{}: {}", class.label(), record.id)
                } else {
                    title
                }
            }
            None => format!("{}: {}", class.label(), record.id),
        }
    }

    fn short_description(&self, class: &FeatureClass, record: &FeatureRecord) -> Option<String> {
        class
            .descriptor
            .short_description
            .as_deref()
            .map(|template| render_template(template, &record.properties))
            .filter(|s| !s.is_empty())
    }

    fn validate(&self, class: &FeatureClass, record: &FeatureRecord) -> Vec<FieldValidationError> {
        class.descriptor.validate(&record.properties)
    }
}

/// Model used for types without a registered extension
#[derive(Debug, Default)]
pub struct DefaultModel;

impl FeatureModel for DefaultModel {}

/// Feature type name to model extension, injected into datasources
pub struct FeatureModelRegistry {
    models: RwLock<HashMap<String, Arc<dyn FeatureModel>>>,
    default_model: Arc<dyn FeatureModel>,
}

impl FeatureModelRegistry {
    pub fn new() -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
            default_model: Arc::new(DefaultModel),
        }
    }

    pub fn with_default_model(mut self, model: Arc<dyn FeatureModel>) -> Self {
        self.default_model = model;
        self
    }

    pub fn register(&self, feature_type: impl Into<String>, model: Arc<dyn FeatureModel>) {
        self.models.write().insert(feature_type.into(), model);
    }

    /// Registered model for `feature_type`, or the default model
    pub fn model_for(&self, feature_type: &str) -> Arc<dyn FeatureModel> {
        self.models
            .read()
            .get(feature_type)
            .cloned()
            .unwrap_or_else(|| self.default_model.clone())
    }

    pub fn has_model(&self, feature_type: &str) -> bool {
        self.models.read().contains_key(feature_type)
    }
}

impl Default for FeatureModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything shared by the features of one type in one datasource
pub struct FeatureClass {
    datasource: String,
    descriptor: Arc<FeatureTypeDescriptor>,
    model: Arc<dyn FeatureModel>,
    localiser: Arc<dyn Localiser>,
}

impl FeatureClass {
    pub fn new(
        datasource: impl Into<String>,
        descriptor: Arc<FeatureTypeDescriptor>,
        model: Arc<dyn FeatureModel>,
        localiser: Arc<dyn Localiser>,
    ) -> Self {
        Self {
            datasource: datasource.into(),
            descriptor,
            model,
            localiser,
        }
    }

    /// Class with the default model and no localisation
    pub fn plain(datasource: impl Into<String>, descriptor: FeatureTypeDescriptor) -> Self {
        Self::new(
            datasource,
            Arc::new(descriptor),
            Arc::new(DefaultModel),
            Arc::new(NoopLocaliser),
        )
    }

    pub fn datasource(&self) -> &str {
        &self.datasource
    }

    pub fn feature_type(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &Arc<FeatureTypeDescriptor> {
        &self.descriptor
    }

    pub fn model(&self) -> &Arc<dyn FeatureModel> {
        &self.model
    }

    /// Localised type label
    pub fn label(&self) -> String {
        self.localiser.localise(
            &type_key(&self.datasource, &self.descriptor.name),
            self.descriptor.display_name(),
        )
    }

    /// Localised field label
    pub fn field_label(&self, field: &FieldMetadata) -> String {
        self.localiser.localise(
            &field_key(&self.datasource, &self.descriptor.name, &field.internal_name),
            field.display_name(),
        )
    }

    /// Wrap a record of this type
    pub fn feature(self: &Arc<Self>, record: FeatureRecord) -> Feature {
        Feature::new(self.clone(), record)
    }
}

impl std::fmt::Debug for FeatureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureClass")
            .field("datasource", &self.datasource)
            .field("feature_type", &self.descriptor.name)
            .finish()
    }
}

/// A feature record bound to its class
#[derive(Debug, Clone)]
pub struct Feature {
    class: Arc<FeatureClass>,
    record: FeatureRecord,
}

impl Feature {
    pub fn new(class: Arc<FeatureClass>, record: FeatureRecord) -> Self {
        Self { class, record }
    }

    pub fn class(&self) -> &Arc<FeatureClass> {
        &self.class
    }

    pub fn descriptor(&self) -> &FeatureTypeDescriptor {
        &self.class.descriptor
    }

    pub fn record(&self) -> &FeatureRecord {
        &self.record
    }

    pub fn into_record(self) -> FeatureRecord {
        self.record
    }

    pub fn datasource(&self) -> &str {
        &self.class.datasource
    }

    pub fn feature_type(&self) -> &str {
        &self.record.feature_type
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn feature_ref(&self) -> FeatureRef {
        self.record.feature_ref()
    }

    pub fn urn(&self) -> String {
        self.record.urn()
    }

    pub fn properties(&self) -> &Properties {
        &self.record.properties
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.record.property(name)
    }

    pub fn geometry(&self) -> Option<&Geometry> {
        self.record.geometry.as_ref()
    }

    /// Primary or secondary geometry by field name
    pub fn geometry_named(&self, name: &str) -> Option<&Geometry> {
        self.record
            .geometry_named(name, self.class.descriptor.primary_geometry_name())
    }

    pub fn title(&self) -> String {
        self.class.model.title(&self.class, &self.record)
    }

    pub fn short_description(&self) -> Option<String> {
        self.class.model.short_description(&self.class, &self.record)
    }

    pub fn validate(&self) -> Vec<FieldValidationError> {
        self.class.model.validate(&self.class, &self.record)
    }

    /// Display text of a property, using enumerator labels when available
    pub fn display_value(&self, field: &str) -> Option<String> {
        let value = self.record.property(field)?;
        let label = self
            .class
            .descriptor
            .field(field)
            .and_then(|f| f.values.as_ref())
            .and_then(|values| values.iter().find(|v| &v.value == value))
            .map(|v| v.label());

        Some(label.unwrap_or_else(|| match value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }))
    }
}

impl From<Feature> for FeatureData {
    fn from(feature: Feature) -> Self {
        feature.record.into()
    }
}

impl From<&Feature> for FeatureData {
    fn from(feature: &Feature) -> Self {
        feature.record.clone().into()
    }
}

impl Serialize for Feature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Feature", 6)?;
        state.serialize_field("datasource", self.datasource())?;
        state.serialize_field("feature_type", self.feature_type())?;
        state.serialize_field("id", self.id())?;
        state.serialize_field("title", &self.title())?;
        state.serialize_field("properties", self.properties())?;
        state.serialize_field("geometry", &self.record.geometry)?;
        state.end()
    }
}

/// Features returned by a paged query
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct FeatureList {
    pub features: Vec<Feature>,
    pub total_count: Option<u64>,
    pub has_more: bool,
}

impl FeatureList {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}
