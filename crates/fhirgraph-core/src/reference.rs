//! FHIR reference parsing.
//!
//! References appear in several formats:
//! - Relative: `Patient/123`
//! - Versioned: `Patient/123/_history/1` (the version is irrelevant for traversal)
//! - Absolute URL: `http://example.org/fhir/Patient/123`
//! - Contained: `#contained-id` (cannot be fetched from the server)
//! - URN: `urn:uuid:xxx` or `urn:oid:xxx` (cannot be fetched from the server)
//!
//! The graph walker only ever needs the `(type, id)` pair of a fetchable
//! reference; everything else is reported as [`UnresolvableReference`] so the
//! caller can skip it.

use std::fmt;

/// A successfully parsed, fetchable FHIR reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceReference {
    /// The resource type (e.g., "Patient", "Observation")
    pub resource_type: String,
    /// The resource ID
    pub id: String,
}

impl ResourceReference {
    /// Creates a new ResourceReference.
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Returns the reference as a relative string (Type/id).
    pub fn to_relative(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }
}

impl fmt::Display for ResourceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_relative())
    }
}

/// A reference that cannot be fetched from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvableReference {
    /// A contained reference (starts with `#`)
    Contained(String),
    /// A URN reference (`urn:uuid:xxx` or `urn:oid:xxx`)
    Urn(String),
    /// A reference to a different server
    External(String),
    /// A malformed or invalid reference
    Invalid(String),
}

impl fmt::Display for UnresolvableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contained(id) => write!(f, "contained reference: #{id}"),
            Self::Urn(urn) => write!(f, "URN reference: {urn}"),
            Self::External(url) => write!(f, "external reference: {url}"),
            Self::Invalid(reason) => write!(f, "invalid reference: {reason}"),
        }
    }
}

impl std::error::Error for UnresolvableReference {}

/// Parse a FHIR reference string into its `(type, id)` components.
///
/// * `reference` - the reference string to parse
/// * `base_url` - optional base URL of the server being traversed; absolute
///   URLs matching this base are treated as local, all others are external.
///
/// A `Type/id/_history/version` reference resolves to the unversioned
/// `(Type, id)` pair: the walker always fetches the current version.
pub fn parse_reference(
    reference: &str,
    base_url: Option<&str>,
) -> Result<ResourceReference, UnresolvableReference> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(UnresolvableReference::Invalid(
            "empty reference".to_string(),
        ));
    }

    if let Some(contained_id) = reference.strip_prefix('#') {
        return Err(UnresolvableReference::Contained(contained_id.to_string()));
    }

    if reference.starts_with("urn:") {
        return Err(UnresolvableReference::Urn(reference.to_string()));
    }

    let path = if reference.contains("://") {
        match base_url {
            Some(base) => {
                let normalized_base = base.trim_end_matches('/');
                if let Some(suffix) = reference.strip_prefix(normalized_base) {
                    suffix.trim_start_matches('/')
                } else {
                    return Err(UnresolvableReference::External(reference.to_string()));
                }
            }
            None => {
                return Err(UnresolvableReference::External(reference.to_string()));
            }
        }
    } else {
        reference
    };

    let parts: Vec<&str> = path.split('/').collect();

    if parts.len() < 2 {
        return Err(UnresolvableReference::Invalid(format!(
            "reference must contain at least Type/id: {reference}"
        )));
    }

    let resource_type = parts[0];
    let id = parts[1];

    if !resource_type
        .chars()
        .next()
        .map(|c| c.is_ascii_uppercase())
        .unwrap_or(false)
    {
        return Err(UnresolvableReference::Invalid(format!(
            "resource type must start with uppercase letter: {resource_type}"
        )));
    }

    if id.is_empty() {
        return Err(UnresolvableReference::Invalid(
            "resource id cannot be empty".to_string(),
        ));
    }

    Ok(ResourceReference {
        resource_type: resource_type.to_string(),
        id: id.to_string(),
    })
}

/// Extract the id from a reference string when its type matches `target_type`.
///
/// This is how a single graph path can target a specific type against a
/// polymorphic field: references of any other type return `None` and are
/// silently skipped by the caller.
pub fn reference_id_for_type(reference: &str, target_type: &str) -> Option<String> {
    match parse_reference(reference, None) {
        Ok(r) if r.resource_type == target_type => Some(r.id),
        _ => None,
    }
}

/// Validate if a string is a valid FHIR resource type name
pub fn is_valid_resource_type_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_uppercase())
            .unwrap_or(false)
        && name.chars().all(|c| c.is_ascii_alphabetic())
}
