//! Batching of sibling fetches.
//!
//! Sibling ids of the same target type are grouped into `?_id=a,b,c`
//! requests when the server supports id-set search for that type, chunked by
//! `request_size`. A server that answers 400/404 to an id-set query demotes
//! the type for the rest of the traversal and every id is fetched on its
//! own. Reverse links batch by substituting the comma-joined chunk into the
//! `{ref}` token of the query template.

use std::collections::HashSet;
use std::sync::Mutex;

use fhirgraph_core::{BundleEntry, CoreError};

/// Resource types observed to reject `_id` search, per traversal.
///
/// Grow-only; a demotion is never revisited.
#[derive(Debug, Default)]
pub struct IdSearchSupport {
    unsupported: Mutex<HashSet<String>>,
}

impl IdSearchSupport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_unsupported(&self, resource_type: &str) -> bool {
        self.unsupported
            .lock()
            .expect("id-search lock poisoned")
            .contains(resource_type)
    }

    pub fn mark_unsupported(&self, resource_type: &str) {
        self.unsupported
            .lock()
            .expect("id-search lock poisoned")
            .insert(resource_type.to_string());
    }

    /// Demote on the id-set rejection statuses only; a 5xx is transient and
    /// goes through the normal retry path instead.
    pub fn should_demote(status: u16) -> bool {
        status == 400 || status == 404
    }
}

/// Split ids into chunks of at most `request_size`, preserving order.
pub fn chunk_ids(ids: &[String], request_size: usize) -> Vec<Vec<String>> {
    let size = request_size.max(1);
    ids.chunks(size).map(|c| c.to_vec()).collect()
}

/// Drop duplicate ids, preserving first-seen order.
pub fn dedupe_ids(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

/// Substitute a chunk of parent ids into a reverse-link query template.
///
/// The template is `&`-separated `k=v` pairs of which exactly one ends in
/// `={ref}`; that pair receives the comma-joined ids, the rest pass through
/// unchanged.
pub fn expand_ref_params(template: &str, parent_ids: &[String]) -> Result<Vec<String>, CoreError> {
    let pairs: Vec<&str> = template.split('&').collect();
    let ref_pair = pairs
        .iter()
        .find(|p| p.ends_with("{ref}"))
        .ok_or_else(|| {
            CoreError::invalid_graph_definition(format!(
                "reverse link params must contain the {{ref}} token: {template}"
            ))
        })?;
    let property = ref_pair
        .split('=')
        .next()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| {
            CoreError::invalid_graph_definition(format!(
                "reverse link params must be of the form name={{ref}}: {template}"
            ))
        })?;

    let mut parameters = vec![format!("{property}={}", parent_ids.join(","))];
    parameters.extend(
        pairs
            .iter()
            .filter(|p| !p.ends_with("{ref}"))
            .map(|p| (*p).to_string()),
    );
    Ok(parameters)
}

/// The requested ids a batched response failed to return.
///
/// Each missing id gets a negative cache entry so sibling traversal paths do
/// not refetch it.
pub fn missing_ids(requested: &[String], returned: &[BundleEntry]) -> Vec<String> {
    let present: HashSet<&str> = returned.iter().filter_map(|e| e.resource_id()).collect();
    requested
        .iter()
        .filter(|id| !present.contains(id.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chunk_ids() {
        let ids: Vec<String> = (1..=5).map(|i| i.to_string()).collect();
        let chunks = chunk_ids(&ids, 2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], vec!["1", "2"]);
        assert_eq!(chunks[2], vec!["5"]);
    }

    #[test]
    fn test_chunk_ids_zero_size_treated_as_one() {
        let ids: Vec<String> = vec!["a".to_string(), "b".to_string()];
        assert_eq!(chunk_ids(&ids, 0).len(), 2);
    }

    #[test]
    fn test_dedupe_preserves_order() {
        let ids = vec![
            "b".to_string(),
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
        ];
        assert_eq!(dedupe_ids(ids), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_expand_ref_params_single() {
        let parameters =
            expand_ref_params("subject={ref}", &["1".to_string(), "2".to_string()]).unwrap();
        assert_eq!(parameters, vec!["subject=1,2"]);
    }

    #[test]
    fn test_expand_ref_params_with_additional() {
        let parameters = expand_ref_params(
            "status=active&subject={ref}&category=vital-signs",
            &["42".to_string()],
        )
        .unwrap();
        assert_eq!(
            parameters,
            vec!["subject=42", "status=active", "category=vital-signs"]
        );
    }

    #[test]
    fn test_expand_ref_params_missing_token() {
        let result = expand_ref_params("subject=Patient/1", &["1".to_string()]);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_ids() {
        let returned = vec![
            BundleEntry::new(json!({"resourceType": "Patient", "id": "1"}), None, None),
            BundleEntry::new(json!({"resourceType": "Patient", "id": "3"}), None, None),
        ];
        let requested: Vec<String> =
            vec!["1".to_string(), "2".to_string(), "3".to_string()];
        assert_eq!(missing_ids(&requested, &returned), vec!["2"]);
    }

    #[test]
    fn test_id_search_support_grow_only() {
        let support = IdSearchSupport::new();
        assert!(!support.is_unsupported("Patient"));
        support.mark_unsupported("Patient");
        assert!(support.is_unsupported("Patient"));
        assert!(!support.is_unsupported("Observation"));
    }

    #[test]
    fn test_demotion_statuses() {
        assert!(IdSearchSupport::should_demote(400));
        assert!(IdSearchSupport::should_demote(404));
        assert!(!IdSearchSupport::should_demote(500));
        assert!(!IdSearchSupport::should_demote(503));
    }
}
