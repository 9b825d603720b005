//! Dot-path reference extraction.
//!
//! Graph definition forward links name a path into the parent resource, e.g.
//! `generalPractitioner[x]`, `participant.individual[x]` or
//! `content[x].attachment.url`. The grammar is dot-separated segments where a
//! trailing `[x]` means "iterate over a list and continue"; a plain segment
//! against a list broadcasts over its elements.
//!
//! Missing data is never an error: an absent field simply contributes no
//! references. Only a malformed path itself is rejected, before any I/O.

use serde_json::Value;

use crate::error::CoreError;
use crate::reference::reference_id_for_type;

/// One parsed segment of a path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment {
    pub name: String,
    /// True when the segment carried the `[x]` list marker.
    pub iterate: bool,
}

/// Parse and validate a path expression.
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>, CoreError> {
    if path.is_empty() {
        return Err(CoreError::invalid_path(path, "path is empty"));
    }
    let mut segments = Vec::new();
    for raw in path.split('.') {
        let (name, iterate) = match raw.strip_suffix("[x]") {
            Some(stripped) => (stripped, true),
            None => (raw, false),
        };
        if name.is_empty() {
            return Err(CoreError::invalid_path(path, "empty segment"));
        }
        if !name.chars().next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false)
            || !name.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(CoreError::invalid_path(
                path,
                format!("invalid segment '{raw}'"),
            ));
        }
        segments.push(PathSegment {
            name: name.to_string(),
            iterate,
        });
    }
    Ok(segments)
}

/// Resolve a path against a resource, returning the leaf values it reaches.
///
/// Lists encountered at a leaf are flattened; null elements are dropped.
pub fn resolve_path<'a>(resource: &'a Value, path: &str) -> Result<Vec<&'a Value>, CoreError> {
    let segments = parse_path(path)?;
    let mut frontier: Vec<&Value> = vec![resource];

    // `[x]` over a list and implicit broadcast resolve identically once lists
    // are flattened between segments: look the field up on every element,
    // descend on objects, drop nulls and scalars.
    for segment in &segments {
        let mut next: Vec<&Value> = Vec::new();
        for value in frontier {
            match value {
                Value::Array(items) => {
                    for item in items {
                        if let Some(v) = item.get(&segment.name) {
                            if !v.is_null() {
                                next.push(v);
                            }
                        }
                    }
                }
                Value::Object(_) => {
                    if let Some(v) = value.get(&segment.name) {
                        if !v.is_null() {
                            next.push(v);
                        }
                    }
                }
                _ => {}
            }
        }
        frontier = next;
    }

    // flatten leaf lists so callers always see scalar values
    let mut leaves = Vec::new();
    for value in frontier {
        flatten_into(value, &mut leaves);
    }
    Ok(leaves)
}

fn flatten_into<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                flatten_into(item, out);
            }
        }
        Value::Null => {}
        other => out.push(other),
    }
}

/// Extract the child ids reachable from `resource` along `path` whose
/// reference type equals `target_type`.
///
/// The resolved leaves are expected to be `Reference` objects
/// (`{"reference": "Type/id"}`) or bare reference strings; anything else, and
/// any reference to a different type, is silently discarded.
pub fn extract_references(
    resource: &Value,
    path: &str,
    target_type: &str,
) -> Result<Vec<String>, CoreError> {
    let leaves = resolve_path(resource, path)?;
    let mut ids = Vec::new();
    for leaf in leaves {
        let reference = match leaf {
            Value::Object(_) => leaf.get("reference").and_then(Value::as_str),
            Value::String(s) => Some(s.as_str()),
            _ => None,
        };
        if let Some(reference) = reference {
            if let Some(id) = reference_id_for_type(reference, target_type) {
                ids.push(id);
            }
        }
    }
    Ok(ids)
}
