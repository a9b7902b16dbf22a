//! Gemini REST client and error translator
//!
//! One `GeminiClient` per API key, created by `GeminiClientFactory`. All
//! clients share a single `reqwest::Client` (connection pool). Failures are
//! translated from Google's error envelope into `BackendError`, keeping the
//! status code and reason in the message text so text-based quota detection
//! keeps working:
//!
//! `{"error":{"code":429,"message":"...","status":"RESOURCE_EXHAUSTED"}}`
//! becomes `[429 RESOURCE_EXHAUSTED] ...`.

use std::time::Duration;

use common::Secret;
use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{BackendError, ClientFactory, Result};

/// Public Generative Language API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Model used when none is configured.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Header carrying the API key.
const API_KEY_HEADER: &str = "x-goog-api-key";

/// `@type` suffix of the detail entry that carries `retryDelay`.
const RETRY_INFO_TYPE: &str = "google.rpc.RetryInfo";

/// A text generation request.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system: Option<String>,
    /// e.g. `application/json` to force JSON output
    pub response_mime_type: Option<String>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Ask the model for a JSON document instead of free text.
    pub fn json(mut self) -> Self {
        self.response_mime_type = Some("application/json".to_string());
        self
    }
}

/// Text of the first candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateResponse {
    pub text: String,
    pub finish_reason: Option<String>,
}

/// Builds `GeminiClient`s that share one HTTP connection pool.
#[derive(Debug, Clone)]
pub struct GeminiClientFactory {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl GeminiClientFactory {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

impl ClientFactory for GeminiClientFactory {
    type Client = GeminiClient;

    /// Rejects keys that cannot be sent as an HTTP header value.
    fn build(&self, api_key: Secret<String>) -> Result<GeminiClient> {
        HeaderValue::from_str(api_key.expose())
            .map_err(|e| BackendError::new(format!("invalid API key {}: {e}", api_key.hint())))?;

        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        Ok(GeminiClient {
            http: self.http.clone(),
            url,
            model: self.model.clone(),
            key_hint: api_key.hint(),
            api_key,
        })
    }
}

/// Gemini client bound to one API key.
#[derive(Debug)]
pub struct GeminiClient {
    http: reqwest::Client,
    url: String,
    model: String,
    key_hint: String,
    api_key: Secret<String>,
}

impl GeminiClient {
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Log-safe prefix of the bound key.
    pub fn key_hint(&self) -> &str {
        &self.key_hint
    }

    /// Call `generateContent` and return the first candidate's text.
    pub async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        debug!(model = %self.model, key = %self.key_hint, "calling generateContent");

        let response = self
            .http
            .post(&self.url)
            .header(API_KEY_HEADER, self.api_key.expose())
            .json(&WireRequest::from(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(translate_error(status.as_u16(), &body));
        }

        let wire = response
            .json::<WireResponse>()
            .await
            .map_err(|e| BackendError::new(format!("invalid generateContent response: {e}")))?;
        extract_text(wire)
    }
}

/// Translate a non-success `generateContent` response into a `BackendError`.
///
/// Parses Google's error envelope when possible. The rate-limit verdict is
/// `code == 429` or `status == "RESOURCE_EXHAUSTED"`; a `RetryInfo` detail
/// supplies the structured retry delay. Bodies that are not an error
/// envelope keep their raw text prefixed with the HTTP status.
pub fn translate_error(http_status: u16, body: &str) -> BackendError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => {
            let detail = envelope.error;
            let code = detail.code.unwrap_or(http_status);
            let reason = detail.status.unwrap_or_default();
            let label = if reason.is_empty() {
                code.to_string()
            } else {
                format!("{code} {reason}")
            };
            let rate_limited = code == 429 || reason == "RESOURCE_EXHAUSTED";

            let err = BackendError::new(format!("[{label}] {}", detail.message))
                .with_status(http_status)
                .with_rate_limited(rate_limited);
            match retry_delay(&detail.details) {
                Some(delay) => err.with_retry_delay(delay),
                None => err,
            }
        }
        Err(_) => BackendError::new(format!("[{http_status}] {}", body.trim()))
            .with_status(http_status)
            .with_rate_limited(http_status == 429),
    }
}

/// Find `retryDelay` in a `google.rpc.RetryInfo` detail.
fn retry_delay(details: &[serde_json::Value]) -> Option<Duration> {
    details
        .iter()
        .filter(|d| {
            d.get("@type")
                .and_then(serde_json::Value::as_str)
                .is_some_and(|t| t.ends_with(RETRY_INFO_TYPE))
        })
        .find_map(|d| d.get("retryDelay").and_then(serde_json::Value::as_str))
        .and_then(parse_delay)
}

/// Parse protobuf duration strings like `"2s"` or `"0.123s"`.
fn parse_delay(s: &str) -> Option<Duration> {
    let secs: f64 = s.trim().strip_suffix('s')?.trim().parse().ok()?;
    if secs.is_nan() || secs < 0.0 {
        return None;
    }
    Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
}

/// Concatenate the text parts of the first candidate.
fn extract_text(wire: WireResponse) -> Result<GenerateResponse> {
    let candidate = wire
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| BackendError::new("generateContent returned no candidates"))?;

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.is_empty() {
        return Err(BackendError::new(format!(
            "generateContent returned no text (finish reason: {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        )));
    }

    Ok(GenerateResponse {
        text,
        finish_reason: candidate.finish_reason,
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    contents: Vec<WireContent<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<WireGenerationConfig<'a>>,
}

#[derive(Serialize)]
struct WireContent<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parts: Vec<WirePart<'a>>,
}

#[derive(Serialize)]
struct WirePart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig<'a> {
    response_mime_type: &'a str,
}

impl<'a> From<&'a GenerateRequest> for WireRequest<'a> {
    fn from(request: &'a GenerateRequest) -> Self {
        WireRequest {
            contents: vec![WireContent {
                role: Some("user"),
                parts: vec![WirePart {
                    text: &request.prompt,
                }],
            }],
            system_instruction: request.system.as_deref().map(|text| WireContent {
                role: None,
                parts: vec![WirePart { text }],
            }),
            generation_config: request
                .response_mime_type
                .as_deref()
                .map(|response_mime_type| WireGenerationConfig { response_mime_type }),
        }
    }
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCandidate {
    content: Option<WireCandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireCandidateContent {
    #[serde(default)]
    parts: Vec<WireCandidatePart>,
}

#[derive(Deserialize)]
struct WireCandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: Option<u16>,
    #[serde(default)]
    message: String,
    status: Option<String>,
    #[serde(default)]
    details: Vec<serde_json::Value>,
}
