use thiserror::Error;

/// Core error types for fhirgraph data handling.
///
/// Everything here is raised before any I/O happens: malformed graph
/// definitions, malformed path expressions, and undecodable JSON.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid path expression '{path}': {message}")]
    InvalidPath { path: String, message: String },

    #[error("Invalid graph definition: {0}")]
    InvalidGraphDefinition(String),

    #[error("Invalid FHIR reference: {0}")]
    InvalidReference(String),

    #[error("Invalid FHIR resource type: {0}")]
    InvalidResourceType(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl CoreError {
    /// Create a new InvalidPath error
    pub fn invalid_path(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new InvalidGraphDefinition error
    pub fn invalid_graph_definition(message: impl Into<String>) -> Self {
        Self::InvalidGraphDefinition(message.into())
    }

    /// Create a new InvalidReference error
    pub fn invalid_reference(message: impl Into<String>) -> Self {
        Self::InvalidReference(message.into())
    }

    /// Create a new InvalidResourceType error
    pub fn invalid_resource_type(resource_type: impl Into<String>) -> Self {
        Self::InvalidResourceType(resource_type.into())
    }

    /// True when the error originated in user-supplied configuration
    /// (graph definition or path grammar) rather than response data.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidPath { .. }
                | Self::InvalidGraphDefinition(_)
                | Self::InvalidResourceType(_)
        )
    }
}

/// Convenience result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
