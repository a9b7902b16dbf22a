//! Backend abstraction for pooled API clients
//!
//! Defines the boundary between the key pool and whatever remote API the
//! clients talk to:
//! - `ClientFactory` turns one credential into one client handle
//! - `BackendError` is the failure every attempt surfaces, carrying the
//!   human-readable message plus optional typed hints (status, rate limit,
//!   retry delay) filled in by a backend-specific error translator
//!
//! The Gemini REST client in [`gemini`] is the concrete backend used by the
//! gateway service.

pub mod gemini;

pub use gemini::{GeminiClient, GeminiClientFactory, GenerateRequest, GenerateResponse};

use common::Secret;
use std::time::Duration;

/// Failure of a single attempt against a backend client.
///
/// `Display` is exactly the message, so callers that surface this error show
/// the backend's own diagnostic text unchanged. The key pool treats a
/// positive `rate_limited` flag as a quota failure and otherwise inspects the
/// message text, so the flag can only add to what the text says.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    message: String,
    status: Option<u16>,
    rate_limited: Option<bool>,
    retry_delay: Option<Duration>,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            rate_limited: None,
            retry_delay: None,
        }
    }

    /// Attach the HTTP status returned by the backend.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Record the translator's verdict on whether this is a quota/rate limit.
    pub fn with_rate_limited(mut self, rate_limited: bool) -> Self {
        self.rate_limited = Some(rate_limited);
        self
    }

    /// Attach a server-suggested delay before the next attempt.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// `None` when no translator classified the error.
    pub fn rate_limited(&self) -> Option<bool> {
        self.rate_limited
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry_delay
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        let err = BackendError::new(format!("request failed: {e}"));
        match e.status() {
            Some(status) => err.with_status(status.as_u16()),
            None => err,
        }
    }
}

/// Result alias for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Builds a client handle bound to a single credential.
///
/// Construction may fail (e.g. a malformed key); the pool skips such
/// credentials instead of aborting.
pub trait ClientFactory {
    type Client;

    fn build(&self, credential: Secret<String>) -> Result<Self::Client>;
}
