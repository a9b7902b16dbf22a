//! Quota detection and retry hints for failed attempts
//!
//! A failure counts as quota/rate-limit exhaustion when the backend error
//! translator flagged it, or when its message contains `429` or `quota`
//! (case-sensitive). The message check always applies, so translated
//! errors keep the textual contract.
//!
//! The suggested wait comes from the translator's structured retry delay,
//! or from a `retry in <seconds>s` phrase in the message. The hint reads the
//! leading number (`1.2.3` is 1.2) and saturates when it overflows.

use std::sync::LazyLock;
use std::time::Duration;

use backend::BackendError;
use regex::Regex;

/// Message markers of a quota or rate-limit failure.
const QUOTA_MARKERS: &[&str] = &["429", "quota"];

static RETRY_HINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"retry in ([0-9.]+)s").expect("retry hint pattern is valid"));

/// How a failed attempt is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Key ran out of quota or hit a rate limit
    QuotaExceeded,
    /// Anything else
    Other,
}

impl ErrorClassification {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::QuotaExceeded => "quota",
            ErrorClassification::Other => "error",
        }
    }
}

/// Classify an error message by its quota markers.
pub fn classify_message(message: &str) -> ErrorClassification {
    if QUOTA_MARKERS.iter().any(|m| message.contains(m)) {
        ErrorClassification::QuotaExceeded
    } else {
        ErrorClassification::Other
    }
}

/// Classify a failed attempt.
///
/// A positive rate-limit flag is decisive; otherwise the message markers
/// decide.
pub fn classify(err: &BackendError) -> ErrorClassification {
    match err.rate_limited() {
        Some(true) => ErrorClassification::QuotaExceeded,
        _ => classify_message(err.message()),
    }
}

/// Parse `retry in <seconds>s` from an error message.
///
/// Only the leading number counts: `retry in 1.2.3s` is 1.2 seconds.
/// A hint too large for a `Duration` saturates to `Duration::MAX`.
pub fn retry_hint(message: &str) -> Option<Duration> {
    let raw = RETRY_HINT.captures(message)?.get(1)?.as_str();
    let secs: f64 = leading_number(raw).parse().ok()?;
    Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
}

/// Digits up to, not including, a second decimal point.
fn leading_number(raw: &str) -> &str {
    match raw.match_indices('.').nth(1) {
        Some((second_dot, _)) => &raw[..second_dot],
        None => raw,
    }
}

/// Server-suggested wait before the next attempt, if the error carries one.
pub fn suggested_wait(err: &BackendError) -> Option<Duration> {
    err.retry_delay().or_else(|| retry_hint(err.message()))
}
