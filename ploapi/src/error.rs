//! Error types for the Playola API client

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, ApiError>;

/// Errors that can occur when talking to the admin API
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing failed
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// The server answered with a non-success status
    #[error("HTTP status {0}")]
    Status(u16),

    /// Authentication failed and could not be refreshed
    #[error("unauthorized")]
    Unauthorized,

    /// Request timeout
    #[error("request timeout")]
    Timeout,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ApiError {
    /// Create a generic error from a string
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Collapse reqwest timeouts into the dedicated variant.
    pub fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(e)
        }
    }
}
