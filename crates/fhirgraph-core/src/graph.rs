//! GraphDefinition: the declarative description of a traversal.
//!
//! Mirrors the FHIR R4 `GraphDefinition` resource for the fields the client
//! reads: `id`, `name`, `status`, `start`, `link[*].path`,
//! `link[*].target[*].{type, params, link}`. Any JSON-decodable map that
//! conforms to these fields is accepted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::reference::is_valid_resource_type_name;

/// A traversal target: the child resource type, plus either a reverse-link
/// query template (`params`, containing the literal token `{ref}`) or nothing
/// (forward links carry their directive on the enclosing link's `path`).
/// Nested `link` entries continue the traversal below this target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinitionTarget {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub link: Vec<GraphDefinitionLink>,
}

/// One link of a graph definition: a forward `path` into the parent resource
/// or one or more reverse-link targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinitionLink {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub target: Vec<GraphDefinitionTarget>,
}

/// An immutable traversal tree rooted at one resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub start: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub link: Vec<GraphDefinitionLink>,
}

impl GraphDefinition {
    /// Decode and validate a graph definition from JSON.
    ///
    /// Validation failures are configuration errors raised before any I/O.
    pub fn from_json(value: Value) -> Result<Self, CoreError> {
        let graph: GraphDefinition = serde_json::from_value(value)?;
        graph.validate()?;
        Ok(graph)
    }

    /// Checks the invariants the walker relies on: a non-empty `start` that
    /// names a resource type, and a non-empty `target` list on every link.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.start.is_empty() {
            return Err(CoreError::invalid_graph_definition("start is required"));
        }
        if !is_valid_resource_type_name(&self.start) {
            return Err(CoreError::invalid_resource_type(self.start.clone()));
        }
        for link in &self.link {
            validate_link(link)?;
        }
        Ok(())
    }
}

fn validate_link(link: &GraphDefinitionLink) -> Result<(), CoreError> {
    if link.target.is_empty() {
        return Err(CoreError::invalid_graph_definition(
            "link must have at least one target",
        ));
    }
    for target in &link.target {
        if !is_valid_resource_type_name(&target.resource_type) {
            return Err(CoreError::invalid_resource_type(
                target.resource_type.clone(),
            ));
        }
        for nested in &target.link {
            validate_link(nested)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patient_graph() -> Value {
        json!({
            "resourceType": "GraphDefinition",
            "id": "patient-everything",
            "name": "patient_everything",
            "status": "active",
            "start": "Patient",
            "link": [
                {
                    "path": "generalPractitioner[x]",
                    "target": [{"type": "Practitioner"}]
                },
                {
                    "target": [{
                        "type": "Observation",
                        "params": "subject={ref}",
                        "link": [
                            {
                                "path": "performer[x]",
                                "target": [{"type": "Organization"}]
                            }
                        ]
                    }]
                }
            ]
        })
    }

    #[test]
    fn test_decode_full_graph() {
        let graph = GraphDefinition::from_json(patient_graph()).unwrap();
        assert_eq!(graph.start, "Patient");
        assert_eq!(graph.link.len(), 2);
        assert_eq!(graph.link[0].path.as_deref(), Some("generalPractitioner[x]"));
        assert_eq!(graph.link[0].target[0].resource_type, "Practitioner");

        let reverse = &graph.link[1].target[0];
        assert_eq!(reverse.params.as_deref(), Some("subject={ref}"));
        assert_eq!(reverse.link.len(), 1);
        assert_eq!(reverse.link[0].target[0].resource_type, "Organization");
    }

    #[test]
    fn test_decode_minimal_graph() {
        let graph =
            GraphDefinition::from_json(json!({"start": "Patient", "link": []})).unwrap();
        assert_eq!(graph.start, "Patient");
        assert!(graph.link.is_empty());
        assert!(graph.id.is_none());
    }

    #[test]
    fn test_missing_start_rejected() {
        let result = GraphDefinition::from_json(json!({"link": []}));
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_start_rejected() {
        let result = GraphDefinition::from_json(json!({"start": "", "link": []}));
        assert!(matches!(result, Err(CoreError::InvalidGraphDefinition(_))));
    }

    #[test]
    fn test_invalid_start_type_rejected() {
        let result = GraphDefinition::from_json(json!({"start": "patient"}));
        assert!(matches!(result, Err(CoreError::InvalidResourceType(_))));
    }

    #[test]
    fn test_empty_target_list_rejected() {
        let result = GraphDefinition::from_json(json!({
            "start": "Patient",
            "link": [{"path": "managingOrganization", "target": []}]
        }));
        assert!(matches!(result, Err(CoreError::InvalidGraphDefinition(_))));
    }

    #[test]
    fn test_nested_invalid_type_rejected() {
        let result = GraphDefinition::from_json(json!({
            "start": "Patient",
            "link": [{
                "target": [{
                    "type": "Observation",
                    "params": "subject={ref}",
                    "link": [{"target": [{"type": "bad-type"}]}]
                }]
            }]
        }));
        assert!(matches!(result, Err(CoreError::InvalidResourceType(_))));
    }

    #[test]
    fn test_roundtrip_preserves_shape() {
        let original = patient_graph();
        let graph = GraphDefinition::from_json(original).unwrap();
        let reserialized = serde_json::to_value(&graph).unwrap();
        assert_eq!(reserialized["start"], "Patient");
        assert_eq!(reserialized["link"][1]["target"][0]["params"], "subject={ref}");
    }
}
