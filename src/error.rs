//! Error types for the rendering service

use thiserror::Error;

/// Result type alias for pool and render operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while pooling browsers or rendering HTML
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to construct the browser allocator or one of its contexts
    #[error("Initialization failed: {0}")]
    InitializationError(String),

    /// Failed to navigate a context to its content source
    #[error("Failed to load content: {0}")]
    LoadError(String),

    /// Failed to capture or produce an image
    #[error("Rendering failed: {0}")]
    RenderError(String),

    /// Operation timed out
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// The ephemeral content server could not be started
    #[error("Content server error: {0}")]
    ServerError(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// The request envelope could not be decoded
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// CDP-specific error
    #[cfg(feature = "cdp")]
    #[error("CDP error: {0}")]
    CdpError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error means the client sent something unusable, as opposed
    /// to the render itself failing.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::InvalidRequest(_))
    }
}

#[cfg(feature = "cdp")]
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::CdpError(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::ServerError(err.to_string())
    }
}
