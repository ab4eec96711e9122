//! # federa-query
//!
//! Uniform query, selection and search over structurally different
//! geospatial backends.
//!
//! Callers talk to a [`Datasource`]; the protocol lives in a
//! [`FeatureSource`] adapter:
//! - `federa-query-rest` - proprietary REST service
//! - `federa-query-esri` - ArcGIS MapServer / FeatureServer
//! - `federa-query-ogc` - OGC WFS 1.0.0 / 1.1.0 / 2.0.0 and WMS
//!
//! ## Architecture
//!
//! - **Datasource**: metadata cache with shared in-flight fetches, shared
//!   login with retry on reconnect, error-state tracking, feature classes
//! - **FeatureSource**: adapter trait; edits default to `NotImplemented`
//! - **FeatureTypeDescriptor / FieldMetadata**: server-declared schema with
//!   predicate-based field rules
//! - **AttributeQueryParser**: `[field] op value` clause strings
//! - **RequestTransport**: HTTP with timeouts, tunnelling and status mapping
//!
//! ## Example
//!
//! ```rust
//! use federa_query::{ConnectionConfig, DatasourceRegistry, FeatureQuery, RegistryContext};
//!
//! # async fn example() -> federa_query::Result<()> {
//! let registry = DatasourceRegistry::new(RegistryContext::new("field-app"));
//!
//! let config = ConnectionConfig::new("network", "rest", "https://gis.example.com/api")
//!     .with_credentials("surveyor", "secret");
//!
//! // Requires a factory registered for the "rest" backend first
//! // let ds = registry.create_datasource(config).await?;
//! // let poles = ds.get_features("pole", &FeatureQuery::new().with_limit(50)).await?;
//! # let _ = (registry, config, FeatureQuery::new());
//! # Ok(())
//! # }
//! ```
//!
//! ## Backend Implementation
//!
//! 1. Create a struct that implements `FeatureSource`
//! 2. Hold a `RequestTransport` for HTTP access
//! 3. Create a `DatasourceFactory` implementation
//! 4. Register the factory with `DatasourceRegistry`

pub mod connectivity;
pub mod current;
pub mod datasource;
pub mod descriptor;
pub mod error;
pub mod feature;
pub mod field;
pub mod geometry;
pub mod locale;
pub mod parser;
pub mod registry;
pub mod traits;
pub mod transport;
pub mod types;

// Re-export commonly used items
pub use connectivity::Connectivity;
pub use current::CurrentRequest;
pub use datasource::{Datasource, DatasourceEvent, DatasourceState};
pub use descriptor::{FeatureTypeDescriptor, QueryDefinition, SearchDefinition};
pub use error::{DataError, ErrorKind, Result};
pub use feature::{DefaultModel, Feature, FeatureClass, FeatureList, FeatureModel, FeatureModelRegistry};
pub use field::{EnumValue, FieldMetadata, FieldRule, Validator};
pub use geometry::{Bounds, Geometry, GeometryType, Position};
pub use locale::{Localiser, NoopLocaliser};
pub use parser::{
    format_attribute_query, parse_attribute_query, AttributeQueryParser, ClauseValue, Operator,
    QueryClause,
};
pub use registry::{
    ConnectionConfig, DatasourceFactory, DatasourceRegistry, FederaConfig, RegistryContext,
};
pub use traits::{FeatureSource, MetadataMap};
pub use transport::{
    Credentials, HttpRequest, HttpResponse, RequestTransport, TransportConfig, TunnelConfig,
};
pub use types::{
    BoxSelectionRequest, Capability, FeatureCollection, FeatureData, FeatureQuery, FeatureRecord,
    FeatureRef, Properties, SearchOptions, SearchSuggestion, SelectionRequest, SortOrder,
    Transaction, TransactionOp, TransactionResult,
};
