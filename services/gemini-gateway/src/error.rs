//! Service-specific error types

use thiserror::Error;

/// Display prefix of [`Error::InvalidModelOutput`].
pub const INVALID_OUTPUT_PREFIX: &str = "model output is not a valid roleplay scenario: ";

/// Failures of a gateway request after it reached a handler.
#[derive(Error, Debug)]
pub enum Error {
    /// Dispatch failed: no keys configured, or the last upstream error.
    #[error(transparent)]
    Dispatch(#[from] key_pool::Error),

    /// The model answered, but not with the expected document.
    #[error("model output is not a valid roleplay scenario: {0}")]
    InvalidModelOutput(String),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
