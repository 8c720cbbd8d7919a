//! Hardware plugin client errors

use thiserror::Error;

/// Errors that can occur when talking to a hardware plugin
#[derive(Debug, Error)]
pub enum HwPluginError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Plugin returned an error status
    #[error("hardware plugin API error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Token rejected by the plugin
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request rejected as malformed (4xx other than 401/403/404)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl HwPluginError {
    /// True when the plugin rejected the request itself rather than failing to serve it
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidRequest(_))
    }
}
