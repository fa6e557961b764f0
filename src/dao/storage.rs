use std::error::Error;
use thiserror::Error;

/// Result alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Error raised by backends regardless of the underlying transport.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not be reached or failed mid-request.
    #[error("backend unavailable: {message}")]
    Unavailable {
        /// Human readable context.
        message: String,
        /// Underlying failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// The backend refused the request as invalid.
    #[error("mutation rejected: {0}")]
    Rejected(String),
    /// The request referenced a scope the backend does not know.
    #[error("unknown scope `{0}`")]
    UnknownScope(String),
}

impl BackendError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        BackendError::Unavailable {
            message,
            source: Box::new(source),
        }
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable { .. })
    }
}
