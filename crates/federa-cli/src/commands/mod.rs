pub mod context;
pub mod features;
pub mod metadata;
pub mod probe;
pub mod search;
pub mod select;

pub use features::{CountCommand, GetCommand, QueryCommand};
pub use metadata::MetadataCommand;
pub use probe::ProbeCommand;
pub use search::SearchCommand;
pub use select::SelectBoxCommand;
