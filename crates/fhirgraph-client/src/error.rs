use thiserror::Error;

/// Error types for graph traversal.
///
/// Per-fetch failures normally ride inside [`crate::response::FetchResult`];
/// these errors surface only for configuration problems raised before I/O,
/// cooperative cancellation, and the `throw_exception_on_error` mode.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("Authorization failed with HTTP {status} from {url}")]
    Auth { status: u16, url: String },

    #[error("Failed to parse response from {url}: {message}")]
    Parse { url: String, message: String },

    #[error(transparent)]
    Config(#[from] fhirgraph_core::CoreError),

    #[error("Invalid base URL: {0}")]
    BaseUrl(#[from] url::ParseError),

    #[error("Traversal cancelled")]
    Cancelled,
}

impl ClientError {
    /// Create a new Http error
    pub fn http(status: u16, url: impl Into<String>) -> Self {
        Self::Http {
            status,
            url: url.into(),
        }
    }

    /// Create a new Parse error
    pub fn parse(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            url: url.into(),
            message: message.into(),
        }
    }
}

/// Convenience result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
