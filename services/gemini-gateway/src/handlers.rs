//! HTTP request handling
//!
//! Each handler runs its backend call through the key-pool dispatcher and maps
//! failures to the JSON error shape:
//! `{"error":{"type":"...","message":"...","request_id":"req_..."}}`.
//! Upstream error messages are passed through unchanged.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use backend::{GeminiClient, GenerateRequest};
use key_pool::Dispatcher;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::error::Error;
use crate::roleplay::{self, RoleplayInput};

/// Shared state passed to the handlers via axum State extractor
#[derive(Clone)]
pub struct GatewayState {
    pub dispatcher: Arc<Dispatcher<GeminiClient>>,
    pub model: String,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn new(dispatcher: Dispatcher<GeminiClient>, model: impl Into<String>) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            model: model.into(),
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.dispatcher.pool().size()
    }
}

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    /// Ask the model for a JSON document.
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
pub struct GenerateReply {
    pub text: String,
    pub model: String,
}

/// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
pub fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Status and error type for a failed request.
///
/// Backend errors keep the upstream HTTP status when it is a 4xx/5xx.
fn classify_failure(err: &Error) -> (StatusCode, &'static str) {
    match err {
        Error::Dispatch(key_pool::Error::Configuration(_)) => {
            (StatusCode::SERVICE_UNAVAILABLE, "no_api_keys")
        }
        Error::Dispatch(key_pool::Error::Backend(e)) => {
            let status = e
                .status()
                .filter(|s| (400..=599).contains(s))
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            (status, "backend_error")
        }
        Error::InvalidModelOutput(_) => (StatusCode::BAD_GATEWAY, "invalid_model_output"),
    }
}

fn failure_response(state: &GatewayState, err: &Error, request_id: &str) -> Response {
    state.errors_total.fetch_add(1, Ordering::Relaxed);
    let (status, error_type) = classify_failure(err);
    if status.is_server_error() {
        error!(error = %err, status = status.as_u16(), "request failed");
    } else {
        warn!(error = %err, status = status.as_u16(), "request failed");
    }
    error_response(status, error_type, &err.to_string(), request_id)
}

fn finish(route: &'static str, started: Instant, response: Response) -> Response {
    crate::metrics::record_request(route, response.status().as_u16(), started.elapsed());
    response
}

/// Free-form text generation.
#[instrument(skip_all, fields(request_id = %request_id, route = "generate"))]
pub async fn generate(state: &GatewayState, body: GenerateBody, request_id: String) -> Response {
    let started = Instant::now();
    state.requests_total.fetch_add(1, Ordering::Relaxed);

    let mut request = GenerateRequest::new(body.prompt);
    if let Some(system) = body.system {
        request = request.with_system(system);
    }
    if body.json {
        request = request.json();
    }

    let result = state
        .dispatcher
        .execute(|client| client.generate(&request))
        .await;

    let response = match result {
        Ok(output) => {
            info!(chars = output.text.len(), "generation complete");
            axum::Json(GenerateReply {
                text: output.text,
                model: state.model.clone(),
            })
            .into_response()
        }
        Err(e) => failure_response(state, &Error::from(e), &request_id),
    };
    finish("generate", started, response)
}

/// Roleplay scenario for a lesson topic.
#[instrument(skip_all, fields(request_id = %request_id, route = "roleplay", level = ?input.user_level))]
pub async fn roleplay(state: &GatewayState, input: RoleplayInput, request_id: String) -> Response {
    let started = Instant::now();
    state.requests_total.fetch_add(1, Ordering::Relaxed);

    let response = match roleplay::start_roleplay(&state.dispatcher, &input).await {
        Ok(scenario) => {
            info!(objectives = scenario.objectives.len(), "scenario generated");
            axum::Json(scenario).into_response()
        }
        Err(e) => failure_response(state, &e, &request_id),
    };
    finish("roleplay", started, response)
}
