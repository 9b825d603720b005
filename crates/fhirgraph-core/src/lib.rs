pub mod bundle;
pub mod error;
pub mod graph;
pub mod path;
pub mod reference;
pub mod resource;

pub use bundle::{Bundle, BundleEntry, BundleEntryRequest, BundleEntryResponse};
pub use error::{CoreError, Result};
pub use graph::{GraphDefinition, GraphDefinitionLink, GraphDefinitionTarget};
pub use path::{extract_references, parse_path, resolve_path, PathSegment};
pub use reference::{
    ResourceReference, UnresolvableReference, is_valid_resource_type_name, parse_reference,
    reference_id_for_type,
};
pub use resource::{is_bundle, resource_id_of, resource_key, resource_type_of};
