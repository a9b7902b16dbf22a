//! Error types for dispatch operations

use backend::BackendError;

/// Message returned when the pool has no clients.
pub const NO_KEYS_MESSAGE: &str =
    "no usable API keys in the pool; set GEMINI_API_KEYS (comma-separated) or GEMINI_API_KEY";

/// Errors from `Dispatcher::execute`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The pool is empty; the operation was never invoked.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The last failed attempt, surfaced unchanged once rotation and
    /// pool retries are spent.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl Error {
    pub(crate) fn no_keys() -> Self {
        Error::Configuration(NO_KEYS_MESSAGE.to_string())
    }
}

/// Result alias for dispatch operations.
pub type Result<T> = std::result::Result<T, Error>;
